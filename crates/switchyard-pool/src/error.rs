//! Pool failure taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool at capacity ({max} workers, none idle)")]
    AtCapacity { max: usize },

    #[error("session {0} already has a worker in use")]
    SessionBusy(String),

    #[error("no worker freed up within {waited_ms}ms")]
    WaitTimeout { waited_ms: u64 },

    #[error("too many callers waiting for a worker (limit {max})")]
    WaitListFull { max: usize },

    #[error("worker spawn failed: {0}")]
    Spawn(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("worker pool is shut down")]
    Stopped,
}

impl PoolError {
    /// Failures that may clear up if the caller tries again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::AtCapacity { .. } | PoolError::WaitListFull { .. } | PoolError::Spawn(_)
        )
    }
}
