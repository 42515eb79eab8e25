// Copyright 2020 Joyent, Inc.

//! The caller's entry point: a table of services by address and batched
//! submission of exchanges under a single promise.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use slog::{debug, o, warn, Logger};

use crate::config::Config;
use crate::error::Error;
use crate::logger_or_stdlog;
use crate::promise::{Promise, Registry};
use crate::protocol::{Request, Response};
use crate::service::{Exchange, Service};

pub struct Client {
    services: Mutex<HashMap<String, Service>>,
    registry: Arc<Registry>,
    config: Config,
    log: Logger,
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl Client {
    pub fn new() -> Client {
        Client::build(Config::default(), None)
    }

    /// A client with its own tunables. Fails with [`Error::Config`] if
    /// `config` does not validate.
    pub fn with_config(config: Config, log: Option<&Logger>) -> Result<Client, Error> {
        config.validate()?;
        Ok(Client::build(config, log))
    }

    fn build(config: Config, log: Option<&Logger>) -> Client {
        let log = logger_or_stdlog(log).new(o!("component" => "client"));
        let registry = Registry::new(config.timeout, Some(&log));
        Client {
            services: Mutex::new(HashMap::new()),
            registry,
            config,
            log,
        }
    }

    fn services(&self) -> MutexGuard<HashMap<String, Service>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The service for `address`, with the configured pool size if it has to
    /// be created.
    pub fn connect(&self, address: &str) -> Service {
        self.connect_with(address, self.config.service_max_conns)
    }

    /// The service for `address`. An existing service is returned as is,
    /// whatever its pool size.
    pub fn connect_with(&self, address: &str, pool_size: usize) -> Service {
        let mut services = self.services();
        if let Some(service) = services.get(address) {
            return service.clone();
        }

        debug!(self.log, "connecting"; "address" => address, "pool_size" => pool_size);
        let service = Service::new(
            address,
            pool_size,
            Arc::clone(&self.registry),
            &self.config,
            &self.log,
        );
        services.insert(address.to_string(), service.clone());
        service
    }

    pub fn service(&self, address: &str) -> Option<Service> {
        self.services().get(address).cloned()
    }

    /// Submits a batch of exchanges. Every exchange expecting an answer is
    /// counted into one promise, whose callback receives all their
    /// responses. A batch with no such exchange fires the callback right
    /// away with nothing.
    ///
    /// Fails with [`Error::UnknownService`] before sending anything if an
    /// exchange targets an address this client never connected to.
    pub async fn send<F>(
        &self,
        callback: F,
        exchanges: Vec<Exchange>,
    ) -> Result<Promise, Error>
    where
        F: FnOnce(Vec<Response>) + Send + 'static,
    {
        let targets = {
            let services = self.services();
            exchanges
                .iter()
                .map(|exchange| {
                    services
                        .get(&exchange.service)
                        .cloned()
                        .ok_or_else(|| Error::UnknownService(exchange.service.clone()))
                })
                .collect::<Result<Vec<_>, Error>>()?
        };

        let promise = self.registry.create(callback);
        let mut batches: Vec<(Service, Vec<Request>)> = Vec::new();
        for (exchange, target) in exchanges.into_iter().zip(targets) {
            let (_, answer, mut req, waiter) = exchange.into_parts();
            if answer {
                self.registry.add_watched(&promise, &mut req, waiter)?;
            } else {
                req.pid.clear();
            }

            match batches.iter_mut().find(|(s, _)| s.same_service(&target)) {
                Some((_, reqs)) => reqs.push(req),
                None => batches.push((target, vec![req])),
            }
        }

        if promise.required() == 0 {
            self.registry.close(&promise);
        }

        for (service, reqs) in batches {
            for req in reqs {
                let id = req.id.clone();
                if let Err(e) = service.submit(req).await {
                    warn!(self.log, "failed to queue request";
                        "address" => service.address(), "id" => id, "err" => %e);
                }
            }
        }

        Ok(promise)
    }

    /// Closes every service. Promises still open run to their deadline.
    pub async fn close(&self) -> Result<(), Error> {
        let services = std::mem::take(&mut *self.services());
        for (_, service) in services {
            service.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::protocol::Method;

    #[test]
    fn invalid_config_is_refused() {
        let bad = [
            Config {
                outbound_bound: Some(0),
                ..Config::default()
            },
            Config {
                inbound_bound: Some(0),
                ..Config::default()
            },
            Config {
                service_max_conns: 0,
                ..Config::default()
            },
        ];
        for config in bad.iter() {
            assert!(matches!(
                Client::with_config(config.clone(), None),
                Err(Error::Config(_))
            ));
        }
        assert!(Client::with_config(Config::default(), None).is_ok());
    }

    #[tokio::test]
    async fn connect_reuses_services() {
        let client = Client::new();
        let a = client.connect_with("127.0.0.1:1", 2);
        let b = client.connect_with("127.0.0.1:1", 5);
        assert!(a.same_service(&b));
        assert_eq!(b.pool_size(), 2);
        assert!(client.service("127.0.0.1:1").is_some());
        assert!(client.service("127.0.0.1:2").is_none());
        client.close().await.unwrap();
        assert!(client.service("127.0.0.1:1").is_none());
    }

    #[tokio::test]
    async fn unknown_destinations_fail_the_whole_batch() {
        let client = Client::new();
        let known = client.connect_with("127.0.0.1:1", 1);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let stray = Exchange::new("127.0.0.1:2", true, Request::new(Method::Get, "/"));
        let result = client
            .send(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                vec![known.make_exchange(true), stray],
            )
            .await;

        match result {
            Err(Error::UnknownService(address)) => assert_eq!(address, "127.0.0.1:2"),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("batch with an unknown destination was accepted"),
        }
        assert!(client.registry().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn batches_without_answers_close_at_once() {
        let client = Client::new();
        let svc = client.connect_with("127.0.0.1:1", 1);
        let fired = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&fired);

        let mut exchange = svc.make_exchange(false);
        let reply = exchange.reply();
        let promise = client
            .send(
                move |responses| {
                    *seen.lock().unwrap() = Some(responses.len());
                },
                vec![exchange],
            )
            .await
            .unwrap();

        assert_eq!(promise.required(), 0);
        assert!(promise.is_closed());
        assert!(client.registry().is_empty());
        assert_eq!(*fired.lock().unwrap(), Some(0));
        assert!(matches!(reply.wait().await, Err(Error::Abandoned(_))));
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn answered_exchanges_are_stamped_and_counted() {
        let client = Client::new();
        let svc = client.connect_with("127.0.0.1:1", 1);
        let promise = client
            .send(
                |_| (),
                vec![
                    svc.make_exchange(true),
                    svc.make_exchange(false),
                    svc.make_exchange(true),
                ],
            )
            .await
            .unwrap();

        assert_eq!(promise.required(), 2);
        assert_eq!(promise.received(), 0);
        assert!(!promise.is_closed());
        assert!(client.registry().find(promise.id()).is_ok());

        assert!(client.registry().close(&promise));
        client.close().await.unwrap();
    }
}
