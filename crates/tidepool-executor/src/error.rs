//! Errors surfaced to callers of the executor.

use thiserror::Error;

use tidepool_balancer::BalancerError;
use tidepool_pool::PoolError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Routing(#[from] BalancerError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

pub type ExecuteResult<T> = Result<T, ExecuteError>;

impl ExecuteError {
    /// Whether retrying (with backoff) is likely to help. Routing failures
    /// mean no pool is eligible and are escalated instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecuteError::Routing(_) => false,
            ExecuteError::Pool(e) => e.is_retryable(),
        }
    }

    /// Pool the failure happened on, when one had been selected.
    pub fn pool(&self) -> Option<&str> {
        match self {
            ExecuteError::Routing(_) => None,
            ExecuteError::Pool(e) => Some(e.pool()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn routing_failures_are_not_retryable() {
        let err: ExecuteError = BalancerError::NoHealthyPool { registered: 2 }.into();
        assert!(!err.is_retryable());
        assert_eq!(err.pool(), None);
        assert_eq!(err.to_string(), "no healthy pool among 2 registered");
    }

    #[test]
    fn pool_failures_keep_their_classification() {
        let timeout: ExecuteError = PoolError::AcquireTimeout {
            pool: "replica-1".into(),
            waited: Duration::from_millis(50),
        }
        .into();
        assert!(timeout.is_retryable());
        assert_eq!(timeout.pool(), Some("replica-1"));

        let closed: ExecuteError = PoolError::PoolClosed { pool: "replica-1".into() }.into();
        assert!(!closed.is_retryable());
    }
}
