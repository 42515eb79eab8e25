// Copyright 2020 Joyent, Inc.

use std::io;

use thiserror::Error;

/// Framing failures. Any of these terminates the stream they occur on.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream ended inside a frame length prefix ({0} of 4 bytes)")]
    ShortLength(usize),
    #[error("stream ended inside a frame payload ({actual} of {expected} bytes)")]
    ShortPayload { expected: usize, actual: usize },
    #[error("frame payload of {length} bytes exceeds the {max} byte limit")]
    TooLarge { length: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("failed to decode payload: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("no endpoint matches {0}")]
    RouteNotFound(String),
    #[error("method {method} not allowed on {endpoint}")]
    MethodNotAllowed { method: String, endpoint: String },
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("promise {0} not found")]
    PromiseNotFound(String),
    #[error("empty promise id")]
    EmptyPromiseId,
    #[error("promise {0} timed out")]
    PromiseTimeout(String),
    #[error("promise {0} is closed")]
    PromiseClosed(String),
    #[error("promise {promise} expects no further response, got {id}")]
    UnexpectedResponse { promise: String, id: String },
    #[error("request {0} was resolved without a response")]
    Abandoned(String),
    #[error("server already started")]
    AlreadyStarted,
    #[error("server is not running")]
    NotRunning,
    #[error("unknown service {0}")]
    UnknownService(String),
    #[error("invalid endpoint segment {segment:?}: {reason}")]
    InvalidSegment { segment: String, reason: &'static str },
    #[error("endpoint {0} is already attached")]
    AlreadyAttached(String),
    #[error("endpoint {parent} already has a child named {segment:?}")]
    DuplicateSegment { parent: String, segment: String },
    #[error("attaching {0} would create a cycle")]
    CyclicAttach(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn handler<S: Into<String>>(msg: S) -> Error {
        Error::Handler(msg.into())
    }
}
