// Copyright 2020 Joyent, Inc.

//! Correlation of outbound requests with inbound responses.
//!
//! A [`Promise`] is created per [`Client::send`](crate::client::Client::send)
//! call. Every request that expects an answer is stamped with the promise id
//! and counted into `required`. Responses find their promise through the
//! [`Registry`] by that id; once `required` responses have arrived, or the
//! deadline passes, the promise closes, leaves the registry and hands the
//! collected responses to its callback. The callback runs exactly once and
//! never while a registry lock is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use slog::{debug, error, o, Logger};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::error::Error;
use crate::logger_or_stdlog;
use crate::protocol::{new_id, Request, Response};

pub type Callback = Box<dyn FnOnce(Vec<Response>) + Send + 'static>;

struct State {
    required: usize,
    responses: Vec<Response>,
    callback: Option<Callback>,
    waiters: HashMap<String, oneshot::Sender<Response>>,
    closed: bool,
    timer: Option<JoinHandle<()>>,
}

/// What is left to do once a promise has closed: the callback and the
/// responses it gets, taken out of the promise so they can be handed over
/// after every lock is released.
struct Fired {
    callback: Option<Callback>,
    responses: Vec<Response>,
}

impl Fired {
    fn fire(self) {
        if let Some(callback) = self.callback {
            callback(self.responses);
        }
    }
}

impl State {
    fn close(&mut self) -> Fired {
        self.closed = true;
        self.waiters.clear();
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        Fired {
            callback: self.callback.take(),
            responses: std::mem::take(&mut self.responses),
        }
    }
}

struct Inner {
    id: String,
    deadline: Instant,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct Promise {
    inner: Arc<Inner>,
}

impl Promise {
    fn new(callback: Callback, deadline: Instant) -> Promise {
        Promise {
            inner: Arc::new(Inner {
                id: new_id(),
                deadline,
                state: Mutex::new(State {
                    required: 0,
                    responses: Vec::new(),
                    callback: Some(callback),
                    waiters: HashMap::new(),
                    closed: false,
                    timer: None,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn deadline(&self) -> Instant {
        self.inner.deadline
    }

    /// Number of requests that carry this promise's id.
    pub fn required(&self) -> usize {
        self.lock().required
    }

    /// Number of responses collected so far. Drops back to zero once the
    /// responses have been handed to the callback.
    pub fn received(&self) -> usize {
        self.lock().responses.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn set_timer(&self, timer: JoinHandle<()>) {
        let mut state = self.lock();
        if state.closed {
            timer.abort();
        } else {
            state.timer = Some(timer);
        }
    }

    fn seal(&self) -> Option<Fired> {
        let mut state = self.lock();
        if state.closed {
            None
        } else {
            Some(state.close())
        }
    }
}

/// Single-slot channel resolving to the response of one request.
pub struct Reply {
    id: String,
    rx: oneshot::Receiver<Response>,
}

impl Reply {
    pub(crate) fn new(id: String) -> (oneshot::Sender<Response>, Reply) {
        let (tx, rx) = oneshot::channel();
        (tx, Reply { id, rx })
    }

    /// Waits for the response. Fails with [`Error::Abandoned`] when the
    /// promise closed without one: on timeout, or because the request never
    /// asked for an answer.
    pub async fn wait(self) -> Result<Response, Error> {
        let Reply { id, rx } = self;
        rx.await.map_err(|_| Error::Abandoned(id))
    }
}

pub struct Registry {
    promises: RwLock<HashMap<String, Promise>>,
    timeout: Duration,
    log: Logger,
}

impl Registry {
    pub fn new(timeout: Duration, log: Option<&Logger>) -> Arc<Registry> {
        let log = logger_or_stdlog(log).new(o!("component" => "promises"));
        Arc::new(Registry {
            promises: RwLock::new(HashMap::new()),
            timeout,
            log,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers a new open promise and arms its deadline. Must be called
    /// from within a tokio runtime.
    pub fn create<F>(self: &Arc<Self>, callback: F) -> Promise
    where
        F: FnOnce(Vec<Response>) + Send + 'static,
    {
        let promise =
            Promise::new(Box::new(callback), Instant::now() + self.timeout);
        self.promises
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(promise.id().to_string(), promise.clone());

        let registry = Arc::downgrade(self);
        let expiring = promise.clone();
        let timer = tokio::spawn(async move {
            time::sleep_until(expiring.deadline()).await;
            expire(registry, expiring);
        });
        promise.set_timer(timer);

        debug!(self.log, "promise created"; "promise" => promise.id());
        promise
    }

    /// Stamps `req` with the promise id and counts it into `required`.
    pub fn add(&self, promise: &Promise, req: &mut Request) -> Result<(), Error> {
        self.add_watched(promise, req, None)
    }

    pub(crate) fn add_watched(
        &self,
        promise: &Promise,
        req: &mut Request,
        waiter: Option<oneshot::Sender<Response>>,
    ) -> Result<(), Error> {
        let mut state = promise.lock();
        if state.closed {
            return Err(Error::PromiseClosed(promise.id().to_string()));
        }
        req.pid = promise.id().to_string();
        state.required += 1;
        if let Some(waiter) = waiter {
            state.waiters.insert(req.id.clone(), waiter);
        }
        Ok(())
    }

    pub fn find(&self, id: &str) -> Result<Promise, Error> {
        if id.is_empty() {
            return Err(Error::EmptyPromiseId);
        }
        self.promises
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::PromiseNotFound(id.to_string()))
    }

    /// Appends `resp` to the promise and closes it once every required
    /// response is in. A promise never holds more responses than it has
    /// requests; anything beyond that fails with
    /// [`Error::UnexpectedResponse`] and is dropped.
    pub fn resolve(&self, promise: &Promise, resp: Response) -> Result<(), Error> {
        let fired = {
            let mut state = promise.lock();
            if state.closed {
                return Err(Error::PromiseClosed(promise.id().to_string()));
            }
            if state.responses.len() >= state.required {
                return Err(Error::UnexpectedResponse {
                    promise: promise.id().to_string(),
                    id: resp.id,
                });
            }
            if let Some(waiter) = state.waiters.remove(&resp.id) {
                let _ = waiter.send(resp.clone());
            }
            state.responses.push(resp);
            if state.responses.len() < state.required {
                return Ok(());
            }
            let fired = state.close();
            self.remove(promise.id());
            fired
        };

        debug!(self.log, "promise complete";
            "promise" => promise.id(), "responses" => fired.responses.len());
        fired.fire();
        Ok(())
    }

    /// Routes a response to the promise named by its `pid`.
    pub fn dispatch(&self, resp: Response) -> Result<(), Error> {
        let promise = self.find(&resp.pid)?;
        self.resolve(&promise, resp)
    }

    /// Closes the promise early, handing whatever has arrived to the
    /// callback. Returns false if it was already closed.
    pub fn close(&self, promise: &Promise) -> bool {
        match promise.seal() {
            Some(fired) => {
                self.remove(promise.id());
                fired.fire();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.promises
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: &str) {
        self.promises
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

fn expire(registry: Weak<Registry>, promise: Promise) {
    let fired = match promise.seal() {
        Some(fired) => fired,
        None => return,
    };
    if let Some(registry) = registry.upgrade() {
        registry.remove(promise.id());
        let err = Error::PromiseTimeout(promise.id().to_string());
        error!(registry.log, "promise timed out";
            "err" => %err,
            "received" => fired.responses.len(),
            "timeout_ms" => registry.timeout.as_millis() as u64);
    }
    fired.fire();
}
