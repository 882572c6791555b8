use std::io;

use thiserror::Error;

/// Central error type for the plinth engine.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The listen address could not be parsed or bound.
    #[error("invalid listen address: {0}")]
    Address(String),

    /// The worker pool refused a task because shutdown has started.
    #[error("worker pool is shut down")]
    PoolShutdown,

    /// The connection table is at capacity.
    #[error("connection table is full")]
    TableFull,
}

pub type ServerResult<T> = Result<T, ServerError>;
