//! Error types for the mock server.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised while configuring or running a [`MockServer`](crate::MockServer).
///
/// Configuration-time errors (`InvalidPort`, `UnmatchedPattern`, `Bind`) are
/// returned to the caller. `FileRead` never leaves the request it occurred in;
/// it is logged and the reply falls back to an empty body.
#[derive(Debug, Error)]
pub enum Error {
    /// Port is not an integer in `[1025, 49151]`.
    #[error("invalid port {0:?}: expected an integer between 1025 and 49151")]
    InvalidPort(String),

    /// The listener could not be bound.
    #[error("cannot bind to socket addr {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),

    /// `response()` was called without a pending `when()` pattern.
    #[error("response defined without a pending request pattern; call when() first")]
    UnmatchedPattern,

    /// A `responseFile` could not be read.
    #[error("failed to read response file {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration file content.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
