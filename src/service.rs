// Copyright 2020 Joyent, Inc.

//! Client-side view of one remote service: a fixed pool of connections to
//! its address, round-robin dispatch across them, and a demultiplexer that
//! feeds every response into the promise registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use slog::{debug, info, o, warn, Logger};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{self, Receiver, Sender};
use crate::config::Config;
use crate::connection::{Closed, Connection};
use crate::error::Error;
use crate::promise::{Registry, Reply};
use crate::protocol::{new_id, Method, Request, Response};

/// A request bound for one service, and whether it expects an answer.
pub struct Exchange {
    pub service: String,
    pub answer: bool,
    pub req: Request,
    waiter: Option<oneshot::Sender<Response>>,
}

impl Exchange {
    pub fn new(service: &str, answer: bool, req: Request) -> Exchange {
        Exchange {
            service: service.to_string(),
            answer,
            req,
            waiter: None,
        }
    }

    /// A handle resolving to this exchange's response. Exchanges that do
    /// not expect an answer resolve to [`Error::Abandoned`].
    pub fn reply(&mut self) -> Reply {
        let (tx, reply) = Reply::new(self.req.id.clone());
        self.waiter = Some(tx);
        reply
    }

    pub fn with_method(mut self, method: Method) -> Exchange {
        self.req.method = method.as_str().to_string();
        self
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Exchange {
        self.req.endpoint = endpoint.to_string();
        self
    }

    pub fn with_body<B: Into<Vec<u8>>>(mut self, body: B) -> Exchange {
        self.req.body = body.into();
        self
    }

    pub fn with_header<V: Into<String>>(mut self, name: &str, value: V) -> Exchange {
        self.req.add_header(name, value);
        self
    }

    pub(crate) fn into_parts(
        self,
    ) -> (String, bool, Request, Option<oneshot::Sender<Response>>) {
        (self.service, self.answer, self.req, self.waiter)
    }
}

struct Inner {
    address: String,
    pool_size: usize,
    connections: Mutex<Vec<Connection>>,
    counter: Mutex<usize>,
    next_id: AtomicU64,
    inbound: Sender<Response>,
    closed: mpsc::UnboundedSender<Closed>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    token: CancellationToken,
    config: Config,
    log: Logger,
}

impl Inner {
    fn connections(&self) -> MutexGuard<Vec<Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, slot: usize) -> Connection {
        Connection::open(
            &self.address,
            slot,
            self.next_id.fetch_add(1, Ordering::Relaxed),
            self.inbound.clone(),
            self.closed.clone(),
            &self.token,
            &self.config,
            &self.log,
        )
    }

    /// Puts a fresh connection in `closed.slot`, unless the connection that
    /// stopped has already been replaced.
    fn replace(&self, closed: Closed) {
        let mut connections = self.connections();
        match connections.get(closed.slot) {
            Some(current) if current.id() == closed.id => (),
            _ => return,
        }
        info!(self.log, "replacing connection"; "slot" => closed.slot);
        connections[closed.slot] = self.open(closed.slot);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    /// Opens `pool_size` connections to `address` and starts routing their
    /// responses into `registry`. Must be called from within a tokio
    /// runtime.
    pub fn new(
        address: &str,
        pool_size: usize,
        registry: Arc<Registry>,
        config: &Config,
        log: &Logger,
    ) -> Service {
        let pool_size = pool_size.max(1);
        let log = log.new(o!("address" => address.to_string()));
        let token = CancellationToken::new();
        let (inbound, responses) = channel::channel(config.inbound_bound);
        let (closed, closures) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            address: address.to_string(),
            pool_size,
            connections: Mutex::new(Vec::with_capacity(pool_size)),
            counter: Mutex::new(0),
            next_id: AtomicU64::new(0),
            inbound,
            closed,
            tasks: Mutex::new(Vec::new()),
            token: token.clone(),
            config: config.clone(),
            log: log.clone(),
        });

        {
            let mut connections = inner.connections();
            for slot in 0..pool_size {
                connections.push(inner.open(slot));
            }
        }

        let demux = tokio::spawn(demux(responses, registry, token.clone(), log));
        let supervisor =
            tokio::spawn(supervise(Arc::downgrade(&inner), closures, token));
        *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner) =
            vec![demux, supervisor];

        Service { inner }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Number of connections whose socket is currently established.
    pub fn connected(&self) -> usize {
        self.inner
            .connections()
            .iter()
            .filter(|c| c.is_connected())
            .count()
    }

    pub fn same_service(&self, other: &Service) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A new exchange for this service. The request gets a fresh id, method
    /// GET, and the service address as its endpoint until a path is set.
    pub fn make_exchange(&self, answer: bool) -> Exchange {
        let req = Request {
            id: new_id(),
            method: Method::Get.as_str().to_string(),
            endpoint: self.inner.address.clone(),
            ..Default::default()
        };
        Exchange::new(&self.inner.address, answer, req)
    }

    /// Queues the exchange's request on the next connection in turn.
    ///
    /// This is the raw path: no promise is involved, so the request goes out
    /// as is, whatever its `answer` flag. Unless the caller stamped a `pid`
    /// on it, the server handles it without answering. Any [`Reply`] taken
    /// from the exchange resolves to [`Error::Abandoned`]. Use
    /// [`Client::send`](crate::client::Client::send) for answered calls.
    ///
    /// [`Reply`]: crate::promise::Reply
    pub async fn send(&self, exchange: Exchange) -> Result<(), Error> {
        let (_, _, req, _) = exchange.into_parts();
        self.submit(req).await
    }

    pub(crate) async fn submit(&self, req: Request) -> Result<(), Error> {
        let outbound = {
            let connections = self.inner.connections();
            if connections.is_empty() {
                return Err(Error::ConnectionClosed);
            }
            let index = {
                let mut counter = self
                    .inner
                    .counter
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let index = *counter % connections.len();
                *counter = counter.wrapping_add(1);
                index
            };
            let connection = &connections[index];
            let outbound = connection.outbound();
            if connection.is_closing() || outbound.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            outbound
        };
        outbound.send(req).await
    }

    /// Closes every connection and stops routing responses.
    pub async fn close(&self) -> Result<(), Error> {
        self.inner.token.cancel();
        let connections = std::mem::take(&mut *self.inner.connections());
        for connection in connections {
            connection.close().await;
        }
        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            let _ = task.await;
        }
        debug!(self.inner.log, "service closed");
        Ok(())
    }
}

async fn demux(
    mut responses: Receiver<Response>,
    registry: Arc<Registry>,
    token: CancellationToken,
    log: Logger,
) {
    loop {
        let resp = tokio::select! {
            _ = token.cancelled() => break,
            resp = responses.recv() => match resp {
                Some(resp) => resp,
                None => break,
            },
        };

        match registry.dispatch(resp) {
            Ok(()) | Err(Error::EmptyPromiseId) => (),
            Err(e) => debug!(log, "dropping stale response"; "err" => %e),
        }
    }
}

async fn supervise(
    service: Weak<Inner>,
    mut closures: mpsc::UnboundedReceiver<Closed>,
    token: CancellationToken,
) {
    loop {
        let closed = tokio::select! {
            _ = token.cancelled() => break,
            closed = closures.recv() => match closed {
                Some(closed) => closed,
                None => break,
            },
        };

        match service.upgrade() {
            Some(inner) if !inner.token.is_cancelled() => {
                warn!(inner.log, "connection lost"; "slot" => closed.slot);
                inner.replace(closed);
            }
            _ => break,
        }
    }
}
