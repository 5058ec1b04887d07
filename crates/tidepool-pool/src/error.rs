//! Pool and driver error types.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by a [`DatabaseDriver`](crate::DatabaseDriver) or
/// [`RawConnection`](crate::RawConnection).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The endpoint could not be reached or refused the session.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Transport-level failure; the session is no longer usable.
    #[error("i/o error: {0}")]
    Io(String),

    /// The statement failed but the session is still usable.
    #[error("query failed: {0}")]
    Query(String),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by [`Pool`](crate::Pool) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("acquire timed out on pool {pool} after {waited:?}")]
    AcquireTimeout { pool: String, waited: Duration },

    #[error("pool {pool} exhausted (zero-wait policy)")]
    PoolExhausted { pool: String },

    #[error("pool {pool} is closed")]
    PoolClosed { pool: String },

    #[error("acquire on pool {pool} cancelled after {waited:?}")]
    Cancelled { pool: String, waited: Duration },

    #[error("connection on pool {pool} broken: {message}")]
    ConnectionBroken { pool: String, message: String },

    #[error("could not open connection for pool {pool}: {message}")]
    Connect { pool: String, message: String },

    #[error("query on pool {pool} failed: {message}")]
    Query { pool: String, message: String },
}

impl PoolError {
    /// Whether retrying (with backoff) is likely to help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::AcquireTimeout { .. }
                | PoolError::PoolExhausted { .. }
                | PoolError::ConnectionBroken { .. }
                | PoolError::Connect { .. }
        )
    }

    /// Id of the pool that produced the error.
    pub fn pool(&self) -> &str {
        match self {
            PoolError::AcquireTimeout { pool, .. }
            | PoolError::PoolExhausted { pool }
            | PoolError::PoolClosed { pool }
            | PoolError::Cancelled { pool, .. }
            | PoolError::ConnectionBroken { pool, .. }
            | PoolError::Connect { pool, .. }
            | PoolError::Query { pool, .. } => pool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_split() {
        let pool = "p".to_string();
        assert!(PoolError::AcquireTimeout { pool: pool.clone(), waited: Duration::ZERO }.is_retryable());
        assert!(PoolError::PoolExhausted { pool: pool.clone() }.is_retryable());
        assert!(
            PoolError::ConnectionBroken { pool: pool.clone(), message: "eof".into() }.is_retryable()
        );
        assert!(!PoolError::PoolClosed { pool: pool.clone() }.is_retryable());
        assert!(!PoolError::Query { pool: pool.clone(), message: "syntax".into() }.is_retryable());
        assert!(!PoolError::Cancelled { pool, waited: Duration::ZERO }.is_retryable());
    }

    #[test]
    fn error_carries_pool_and_wait() {
        let err = PoolError::AcquireTimeout {
            pool: "replica-2".into(),
            waited: Duration::from_millis(250),
        };
        assert_eq!(err.pool(), "replica-2");
        assert!(err.to_string().contains("250ms"));
    }
}
