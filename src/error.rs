//! Unified error type.

use thiserror::Error;

/// Result alias for tsuka's fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by tsuka's fallible operations.
///
/// Request-level failures (403, 404, 500) are expressed as HTTP responses,
/// not as `Error`s. This type surfaces the failures that happen before any
/// request exists: rejected configuration and sockets that cannot be bound.
/// Both abort startup.
#[derive(Debug, Error)]
pub enum Error {
    /// The resolved configuration is unusable: unsupported transport kind,
    /// missing document root.
    #[error("configuration error: {0}")]
    Config(String),

    /// The listening socket could not be bound.
    #[error("unable to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure outside the request path.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
