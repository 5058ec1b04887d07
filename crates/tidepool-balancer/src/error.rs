//! Load balancer error types.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalancerError {
    /// Every registered pool is degraded, unhealthy, or closed.
    #[error("no healthy pool among {registered} registered")]
    NoHealthyPool { registered: usize },

    #[error("pool already registered: {0}")]
    DuplicatePool(String),

    #[error("pool not registered: {0}")]
    UnknownPool(String),
}

pub type BalancerResult<T> = Result<T, BalancerError>;
