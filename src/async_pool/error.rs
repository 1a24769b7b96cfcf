use thiserror::Error;
use tokio::time::error::Elapsed;

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    #[error("no connection became available within {0:?}")]
    Exhausted(std::time::Duration),

    #[error("timeout while connecting")]
    Timeout(#[from] Elapsed),

    #[error("failed to get a good connection to the database: {0}")]
    Connection(String),

    #[error("connection was already returned to the pool")]
    ConnectionClosed,

    #[error("connection pool is shut down")]
    Shutdown,

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    pub(crate) fn connection(error: impl std::fmt::Display) -> Self {
        PoolError::Connection(error.to_string())
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PoolError::Exhausted(_) | PoolError::Timeout(_))
    }
}
