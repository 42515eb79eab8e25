// Copyright 2020 Joyent, Inc.

//! One socket to a remote service and the two tasks that own it.
//!
//! The writer task dials (retrying until it succeeds or is cancelled), then
//! spawns the reader on the read half and drains the outbound queue into
//! the write half. The reader forwards decoded responses to the owning
//! service. When either side stops, both are torn down and the service is
//! told so it can put a fresh connection in the same slot.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use slog::{debug, info, o, trace, warn, Logger};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::channel::{self, Receiver, Sender};
use crate::config::Config;
use crate::error::Error;
use crate::protocol::{decode_response, encode_request, FrameCodec, Request, Response};

const DIALING: u8 = 0;
const CONNECTED: u8 = 1;
const CLOSING: u8 = 2;

/// Sent to the owning service when a connection has stopped.
#[derive(Debug)]
pub(crate) struct Closed {
    pub slot: usize,
    pub id: u64,
}

pub(crate) struct Connection {
    id: u64,
    outbound: Sender<Request>,
    state: Arc<AtomicU8>,
    token: CancellationToken,
    writer: JoinHandle<()>,
}

struct Link {
    address: String,
    slot: usize,
    id: u64,
    inbound: Sender<Response>,
    closed: mpsc::UnboundedSender<Closed>,
    state: Arc<AtomicU8>,
    token: CancellationToken,
    config: Config,
    log: Logger,
}

impl Connection {
    /// Starts a connection to `address`. Requests may be queued right away;
    /// they are written once the dial succeeds.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn open(
        address: &str,
        slot: usize,
        id: u64,
        inbound: Sender<Response>,
        closed: mpsc::UnboundedSender<Closed>,
        parent: &CancellationToken,
        config: &Config,
        log: &Logger,
    ) -> Connection {
        let (outbound, queue) = channel::channel(config.outbound_bound);
        let state = Arc::new(AtomicU8::new(DIALING));
        let token = parent.child_token();
        let link = Link {
            address: address.to_string(),
            slot,
            id,
            inbound,
            closed,
            state: Arc::clone(&state),
            token: token.clone(),
            config: config.clone(),
            log: log.new(o!("slot" => slot, "connection" => id)),
        };
        let writer = tokio::spawn(write_loop(link, queue));

        Connection {
            id,
            outbound,
            state,
            token,
            writer,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn outbound(&self) -> Sender<Request> {
        self.outbound.clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CONNECTED
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CLOSING
    }

    pub(crate) async fn close(self) {
        self.state.store(CLOSING, Ordering::SeqCst);
        self.token.cancel();
        let _ = self.writer.await;
    }
}

async fn dial(link: &Link) -> Option<TcpStream> {
    loop {
        let attempt =
            time::timeout(link.config.timeout, TcpStream::connect(&link.address));
        let result = tokio::select! {
            _ = link.token.cancelled() => return None,
            result = attempt => result,
        };

        match result {
            Ok(Ok(stream)) => return Some(stream),
            Ok(Err(e)) => {
                let err = Error::Dial {
                    address: link.address.clone(),
                    source: e,
                };
                warn!(link.log, "dial failed, retrying"; "err" => %err);
            }
            Err(_) => {
                warn!(link.log, "dial timed out, retrying";
                    "timeout_ms" => link.config.timeout.as_millis() as u64);
            }
        }

        tokio::select! {
            _ = link.token.cancelled() => return None,
            _ = time::sleep(link.config.retry_interval) => (),
        }
    }
}

async fn write_loop(link: Link, mut queue: Receiver<Request>) {
    let stream = match dial(&link).await {
        Some(stream) => stream,
        None => {
            link.state.store(CLOSING, Ordering::SeqCst);
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(link.log, "failed to set TCP_NODELAY"; "err" => %e);
    }
    link.state.store(CONNECTED, Ordering::SeqCst);
    info!(link.log, "connected");

    let (rd, wr) = stream.into_split();
    let frames = FramedRead::new(rd, FrameCodec::new(link.config.max_frame_length));
    let reader = tokio::spawn(read_loop(
        frames,
        link.inbound.clone(),
        link.token.clone(),
        link.log.clone(),
    ));
    let mut sink = FramedWrite::new(wr, FrameCodec::new(link.config.max_frame_length));

    loop {
        let req = tokio::select! {
            _ = link.token.cancelled() => break,
            req = queue.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };

        let payload = match encode_request(&req) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(link.log, "dropping unencodable request";
                    "id" => &req.id, "err" => %e);
                continue;
            }
        };
        if let Err(e) = sink.send(payload).await {
            warn!(link.log, "write failed"; "err" => %e);
            break;
        }
        trace!(link.log, "request written"; "id" => &req.id, "endpoint" => &req.endpoint);
    }

    link.state.store(CLOSING, Ordering::SeqCst);
    link.token.cancel();
    drop(queue);
    let _ = reader.await;
    let _ = sink.close().await;
    debug!(link.log, "connection closed");

    let _ = link.closed.send(Closed {
        slot: link.slot,
        id: link.id,
    });
}

fn recoverable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

async fn read_loop(
    mut frames: FramedRead<OwnedReadHalf, FrameCodec>,
    inbound: Sender<Response>,
    token: CancellationToken,
    log: Logger,
) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = frames.next() => frame,
        };

        let payload = match frame {
            None => {
                debug!(log, "peer closed the connection");
                break;
            }
            Some(Err(Error::Io(e))) if recoverable(&e) => {
                warn!(log, "transient read error"; "err" => %e);
                continue;
            }
            Some(Err(e)) => {
                warn!(log, "read failed"; "err" => %e);
                break;
            }
            Some(Ok(payload)) => payload,
        };

        match decode_response(&payload) {
            Ok(resp) => {
                trace!(log, "response read"; "id" => &resp.id, "status" => resp.status);
                if inbound.send(resp).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(log, "dropping undecodable response"; "err" => %e),
        }
    }
    token.cancel();
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::logger_or_stdlog;
    use crate::protocol::{decode_request, encode_response, Method};

    struct Harness {
        responses: Receiver<Response>,
        closed: mpsc::UnboundedReceiver<Closed>,
        token: CancellationToken,
        conn: Connection,
    }

    fn open(address: &str, config: &Config) -> Harness {
        let (inbound, responses) = channel::channel(None);
        let (closed_tx, closed) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let conn = Connection::open(
            address,
            0,
            7,
            inbound,
            closed_tx,
            &token,
            config,
            &logger_or_stdlog(None),
        );
        Harness {
            responses,
            closed,
            token,
            conn,
        }
    }

    #[tokio::test]
    async fn requests_go_out_and_responses_come_back() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut h = open(&address, &Config::default());

        // Queued before the peer has even accepted.
        let req = Request::new(Method::Get, "/v1/status");
        h.conn.outbound().send(req.clone()).await.unwrap();

        let (socket, _) = listener.accept().await.unwrap();
        let mut peer = Framed::new(socket, FrameCodec::default());
        let frame = peer.next().await.unwrap().unwrap();
        let seen = decode_request(&frame).unwrap();
        assert_eq!(seen, req);

        // Garbage first: skipped without losing the stream.
        peer.send(Bytes::from_static(&[0xff, 0xff, 0xff])).await.unwrap();
        let mut resp = Response::for_request(&seen);
        resp.status = 204;
        peer.send(encode_response(&resp).unwrap()).await.unwrap();

        assert_eq!(h.responses.recv().await.unwrap(), resp);
        assert!(h.conn.is_connected());
        assert_eq!(h.conn.id(), 7);

        h.token.cancel();
        h.conn.close().await;
    }

    #[tokio::test]
    async fn peer_hangup_reports_the_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut h = open(&address, &Config::default());

        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);

        let closed = h.closed.recv().await.unwrap();
        assert_eq!((closed.slot, closed.id), (0, 7));
        assert!(h.conn.is_closing());
        assert!(h.conn.outbound().send(Request::default()).await.is_err());
    }

    #[tokio::test]
    async fn dialing_retries_until_the_peer_appears() {
        // Grab a free port, then release it so the first dials are refused.
        let address = {
            let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
            spare.local_addr().unwrap().to_string()
        };
        let config = Config {
            retry_interval: Duration::from_millis(20),
            ..Config::default()
        };
        let h = open(&address, &config);
        time::sleep(Duration::from_millis(60)).await;
        assert!(!h.conn.is_connected());

        let listener = TcpListener::bind(&address).await.unwrap();
        let _socket = listener.accept().await.unwrap();
        for _ in 0..100 {
            if h.conn.is_connected() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.conn.is_connected());
        h.conn.close().await;
    }

    #[tokio::test]
    async fn cancelling_a_dial_stops_quietly() {
        let mut h = open("127.0.0.1:1", &Config::default());
        h.token.cancel();
        h.conn.close().await;
        assert!(h.closed.try_recv().is_err());
    }
}
