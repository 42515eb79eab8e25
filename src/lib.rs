// Copyright 2020 Joyent, Inc.

//! Mesh: framed RPC between microservices
//!
//! Requests travel over long-lived TCP connections to handlers addressed by
//! a URL-style path, and come back as responses. A single call may fan out
//! to several services and be answered through one callback once every
//! response is in, or fire and forget.
//!
//! Protocol definition
//!
//! Every message on the wire is a frame:
//!
//! * LEN0...LEN3     4-byte little-endian unsigned integer, the number of
//!                   payload bytes that follow
//!
//! * DATA0...DATAN   Payload. A protocol-buffer encoded `Request` (client to
//!                   server) or `Response` (server to client).
//!
//! There is no version byte or magic number. A zero-length payload is legal
//! but is never sent by the server: requests that carry no promise id are
//! not answered at all.
//!
//! Request fields: `id=1`, `pid=2`, `method=3`, `endpoint=4`, `body=5`,
//! `headers=6`. Response fields: `status=1`, `id=2`, `pid=3`, `body=4`,
//! `headers=6`; field 5 is reserved. Headers map a case-preserved name to
//! an ordered list of values.
//!
//! Correlation: each request carries a unique `id`, echoed in its response.
//! Requests expecting an answer also carry `pid`, the id of the client-side
//! promise that collects the responses. Responses whose `pid` matches no
//! live promise are dropped.

#![allow(missing_docs)]

use slog::{o, Drain, Logger};

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod promise;
pub mod protocol;
pub mod server;
pub mod service;

mod channel;
mod connection;

pub use client::Client;
pub use config::{Config, LogLevel};
pub use endpoint::{new_endpoint, new_root_endpoint, Endpoint, Handler, Next};
pub use error::{Error, FrameError};
pub use promise::{Promise, Registry, Reply};
pub use protocol::{Method, Request, Response};
pub use server::Server;
pub use service::{Exchange, Service};

/// Components log to the logger they are given, or through the `log` crate
/// when they are given none.
pub(crate) fn logger_or_stdlog(log: Option<&Logger>) -> Logger {
    log.cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
}
