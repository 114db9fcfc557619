use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised by the object and buffer pools.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Every segment of the buffer arena is already leased.
    #[error("buffer arena exhausted: all {capacity} segments are leased")]
    Capacity { capacity: usize },

    /// The arena size does not fit in memory addressing limits.
    #[error("buffer arena of {segment_count} x {segment_size} bytes is too large")]
    Oversized {
        segment_count: usize,
        segment_size: usize,
    },
}

/// Errors surfaced to the operator of a server.
///
/// Connection-scoped failures never show up here; they are turned into
/// `Disconnected` events instead.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid bind address {0:?}")]
    InvalidAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Capacity(#[from] PoolError),

    #[error("no tokio runtime is running on this thread")]
    NoRuntime,

    #[error("server is shut down")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors raised while installing the queue-backed logger.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to spawn logger thread: {0}")]
    Spawn(#[from] io::Error),

    #[error(transparent)]
    Install(#[from] log::SetLoggerError),
}
