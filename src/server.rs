// Copyright 2020 Joyent, Inc.

//! Server side of the protocol.
//!
//! An acceptor task hands accepted sockets to a fixed pool of workers
//! through a bounded queue, so a saturated pool holds the acceptor back.
//! Each worker serves one connection at a time: it reads a frame, routes
//! the decoded request through the endpoint tree, and writes the response
//! frame back. Requests carrying no promise id are handled but not
//! answered.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use slog::{debug, error, info, o, trace, warn, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::endpoint::{new_root_endpoint, Endpoint};
use crate::error::Error;
use crate::logger_or_stdlog;
use crate::protocol::{decode_request, encode_response, FrameCodec};

enum State {
    Stopped,
    Running(Running),
}

struct Running {
    local_addr: SocketAddr,
    token: CancellationToken,
    acceptor: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

pub struct Server {
    address: String,
    root: Endpoint,
    state: Mutex<State>,
    config: Config,
    log: Logger,
}

impl Server {
    pub fn new(address: &str) -> Server {
        Server::build(address, Config::default(), None)
    }

    /// A server with its own tunables. Fails with [`Error::Config`] if
    /// `config` does not validate.
    pub fn with_config(
        address: &str,
        config: Config,
        log: Option<&Logger>,
    ) -> Result<Server, Error> {
        config.validate()?;
        Ok(Server::build(address, config, log))
    }

    fn build(address: &str, config: Config, log: Option<&Logger>) -> Server {
        Server {
            address: address.to_string(),
            root: new_root_endpoint(),
            state: Mutex::new(State::Stopped),
            config,
            log: logger_or_stdlog(log).new(o!("component" => "server")),
        }
    }

    /// Serves requests through the tree under `root`. Takes effect on the
    /// next `start`.
    pub fn register(&mut self, root: Endpoint) {
        self.root = root;
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Binds and starts serving. Fails with [`Error::AlreadyStarted`] if
    /// the server is running.
    pub async fn start(&self) -> Result<SocketAddr, Error> {
        let mut state = self.state.lock().await;
        if let State::Running(_) = *state {
            return Err(Error::AlreadyStarted);
        }

        let listener = TcpListener::bind(&self.address).await?;
        let local_addr = listener.local_addr()?;
        let token = CancellationToken::new();
        let log = self.log.new(o!("address" => local_addr.to_string()));

        let size = self.config.server_workers();
        let (queue, sockets) = mpsc::channel(size);
        let sockets = Arc::new(Mutex::new(sockets));
        let workers = (0..size)
            .map(|n| {
                tokio::spawn(work(
                    Arc::clone(&sockets),
                    self.root.clone(),
                    self.config.max_frame_length,
                    token.clone(),
                    log.new(o!("worker" => n)),
                ))
            })
            .collect();
        let acceptor = tokio::spawn(accept(listener, queue, token.clone(), log.clone()));

        info!(log, "listening for requests"; "workers" => size);
        *state = State::Running(Running {
            local_addr,
            token,
            acceptor,
            workers,
        });
        Ok(local_addr)
    }

    /// Closes the listener and winds down the workers. Fails with
    /// [`Error::NotRunning`] if the server is stopped.
    pub async fn stop(&self) -> Result<(), Error> {
        let running = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, State::Stopped) {
                State::Stopped => return Err(Error::NotRunning),
                State::Running(running) => running,
            }
        };

        running.token.cancel();
        let _ = running.acceptor.await;
        for worker in running.workers {
            let _ = worker.await;
        }
        info!(self.log, "stopped"; "address" => %running.local_addr);
        Ok(())
    }

    /// The bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match *self.state.lock().await {
            State::Running(ref running) => Some(running.local_addr),
            State::Stopped => None,
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let State::Running(ref running) = *self.state.get_mut() {
            running.token.cancel();
        }
    }
}

async fn accept(
    listener: TcpListener,
    queue: mpsc::Sender<TcpStream>,
    token: CancellationToken,
    log: Logger,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (socket, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(log, "failed to accept socket"; "err" => %e);
                continue;
            }
        };
        debug!(log, "accepted connection"; "peer" => %peer);
        if let Err(e) = socket.set_nodelay(true) {
            debug!(log, "failed to set TCP_NODELAY"; "err" => %e);
        }

        tokio::select! {
            _ = token.cancelled() => break,
            sent = queue.send(socket) => if sent.is_err() { break },
        }
    }
    debug!(log, "acceptor exiting");
}

async fn work(
    sockets: Arc<Mutex<mpsc::Receiver<TcpStream>>>,
    root: Endpoint,
    max_frame_length: usize,
    token: CancellationToken,
    log: Logger,
) {
    loop {
        let socket = {
            let mut sockets = sockets.lock().await;
            tokio::select! {
                _ = token.cancelled() => break,
                socket = sockets.recv() => socket,
            }
        };
        let socket = match socket {
            Some(socket) => socket,
            None => break,
        };

        let peer = socket
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let conn_log = log.new(o!("peer" => peer));
        match serve_connection(socket, &root, max_frame_length, &token, &conn_log).await {
            Ok(()) => debug!(conn_log, "connection closed"),
            Err(e) => warn!(conn_log, "connection closed"; "err" => %e),
        }
    }
}

/// Serves one connection until the peer hangs up, a frame fails to read or
/// decode, or `token` is cancelled.
pub async fn serve_connection<S>(
    socket: S,
    root: &Endpoint,
    max_frame_length: usize,
    token: &CancellationToken,
    log: &Logger,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut frames = Framed::new(socket, FrameCodec::new(max_frame_length));

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            frame = frames.next() => frame,
        };
        let payload = match frame {
            Some(payload) => payload?,
            None => return Ok(()),
        };

        let reply = respond(root, &payload, log)?;
        if reply.is_empty() {
            continue;
        }
        frames.send(reply).await?;
    }
}

/// Decodes one request payload, routes it, and returns the encoded
/// response. The result is empty when the request carries no promise id.
pub fn respond(root: &Endpoint, payload: &[u8], log: &Logger) -> Result<Bytes, Error> {
    let req = decode_request(payload)?;
    let answer = !req.pid.is_empty();
    trace!(log, "request received";
        "id" => &req.id, "method" => &req.method, "endpoint" => &req.endpoint);

    let (resp, err) = root.handle_request(req);
    match err {
        Some(e) if resp.status >= 500 => {
            error!(log, "handler failed"; "id" => &resp.id, "status" => resp.status, "err" => %e)
        }
        Some(e) => debug!(log, "request refused"; "id" => &resp.id, "status" => resp.status, "err" => %e),
        None => (),
    }

    if !answer {
        return Ok(Bytes::new());
    }
    encode_response(&resp)
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use tokio_test::io::Builder;
    use tokio_util::codec::Encoder;

    use super::*;
    use crate::protocol::{decode_response, encode_request, Method, Request};

    fn log() -> Logger {
        logger_or_stdlog(None)
    }

    fn frame(payload: Bytes) -> Vec<u8> {
        let mut buf = BytesMut::new();
        FrameCodec::default().encode(payload, &mut buf).unwrap();
        buf.to_vec()
    }

    fn tree() -> Endpoint {
        let root = new_root_endpoint();
        let v1 = root.sub(&Endpoint::new("v1").unwrap()).unwrap();
        v1.sub(&Endpoint::new("status").unwrap())
            .unwrap()
            .get(|_, resp, _| {
                resp.body = b"STATUS".to_vec();
                Ok(())
            });
        v1.sub(&Endpoint::new("broken").unwrap())
            .unwrap()
            .get(|_, _, _| Err(Error::handler("boom")));
        root
    }

    fn request(endpoint: &str, pid: &str) -> Request {
        let mut req = Request::new(Method::Get, endpoint);
        req.pid = pid.to_string();
        req
    }

    #[test]
    fn respond_routes_and_stamps() {
        let root = tree();
        let req = request("/v1/status", "p1");
        let payload = encode_request(&req).unwrap();

        let resp = decode_response(&respond(&root, &payload, &log()).unwrap()).unwrap();
        assert_eq!(resp.status, 204);
        assert_eq!(resp.body, b"STATUS");
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.pid, "p1");

        let missing = encode_request(&request("/missing", "p1")).unwrap();
        let resp = decode_response(&respond(&root, &missing, &log()).unwrap()).unwrap();
        assert_eq!(resp.status, 404);

        let broken = encode_request(&request("/v1/broken", "p1")).unwrap();
        let resp = decode_response(&respond(&root, &broken, &log()).unwrap()).unwrap();
        assert_eq!(resp.status, 500);
        assert!(resp.body.is_empty());
    }

    #[test]
    fn respond_stays_quiet_without_a_promise() {
        let payload = encode_request(&request("/v1/status", "")).unwrap();
        assert!(respond(&tree(), &payload, &log()).unwrap().is_empty());
    }

    #[test]
    fn respond_rejects_garbage() {
        assert!(matches!(
            respond(&tree(), &[0xff, 0xff, 0xff], &log()),
            Err(Error::Decode(_))
        ));
    }

    #[tokio::test]
    async fn connection_answers_each_request_in_turn() {
        let root = tree();
        let first = request("/v1/status", "p1");
        let silent = request("/v1/status", "");
        let second = request("/nowhere", "p2");

        let first_reply = respond(&root, &encode_request(&first).unwrap(), &log()).unwrap();
        let second_reply = respond(&root, &encode_request(&second).unwrap(), &log()).unwrap();

        let socket = Builder::new()
            .read(&frame(encode_request(&first).unwrap()))
            .write(&frame(first_reply))
            .read(&frame(encode_request(&silent).unwrap()))
            .read(&frame(encode_request(&second).unwrap()))
            .write(&frame(second_reply))
            .build();

        serve_connection(socket, &root, 1024, &CancellationToken::new(), &log())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn connection_closes_on_undecodable_request() {
        let socket = Builder::new()
            .read(&frame(Bytes::from_static(&[0xff, 0xff, 0xff])))
            .build();
        let result =
            serve_connection(socket, &tree(), 1024, &CancellationToken::new(), &log()).await;
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn connection_closes_on_oversized_frame() {
        let socket = Builder::new().read(&frame(Bytes::from(vec![0u8; 64]))).build();
        let result =
            serve_connection(socket, &tree(), 16, &CancellationToken::new(), &log()).await;
        assert!(matches!(result, Err(Error::Frame(_))));
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = Config {
            io_bound: 0,
            ..Config::default()
        };
        assert!(matches!(
            Server::with_config("127.0.0.1:0", config, None),
            Err(Error::Config(_))
        ));
        let config = Config {
            max_frame_length: 0,
            ..Config::default()
        };
        assert!(matches!(
            Server::with_config("127.0.0.1:0", config, None),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn start_and_stop_guard_their_state() {
        let server = Server::new("127.0.0.1:0");
        assert!(server.local_addr().await.is_none());
        assert!(matches!(server.stop().await, Err(Error::NotRunning)));

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr().await, Some(addr));
        assert!(matches!(server.start().await, Err(Error::AlreadyStarted)));
        assert_eq!(server.local_addr().await, Some(addr));

        server.stop().await.unwrap();
        assert!(server.local_addr().await.is_none());
        assert!(matches!(server.stop().await, Err(Error::NotRunning)));

        server.start().await.unwrap();
        server.stop().await.unwrap();
    }
}
