//! Collaborator interfaces implemented per database engine.
//!
//! The pool never speaks a wire protocol itself: it opens sessions through a
//! [`DatabaseDriver`] and runs statements on the returned [`RawConnection`].

use async_trait::async_trait;

use tidepool_core::{QueryResult, Value};

use crate::error::DriverError;

/// Opens physical sessions for a pool.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Open a new session to `endpoint`.
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn RawConnection>, DriverError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str {
        "driver"
    }
}

/// A single physical database session.
#[async_trait]
pub trait RawConnection: Send + std::fmt::Debug {
    /// Run a statement with positional parameters.
    async fn execute(&mut self, query: &str, params: &[Value]) -> Result<QueryResult, DriverError>;

    /// Lightweight liveness check.
    async fn ping(&mut self) -> Result<(), DriverError>;

    /// Close the underlying transport.
    async fn close(&mut self);
}
