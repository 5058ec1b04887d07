//! tidepool-pool: adaptive connection pooling for one database endpoint.
//!
//! A [`Pool`] lends [`PooledConnection`]s opened through a pluggable
//! [`DatabaseDriver`]. Its target size moves between `min_size` and
//! `max_size` at runtime ([`Pool::resize`]); waiting callers are served in
//! arrival order and never lose their place to a caller that arrives later.
//!
//! # Architecture
//!
//! ```text
//! Executor ──acquire──► Pool ──connect──► DatabaseDriver ──► RawConnection
//!                        ▲  │
//!   HealthChecker ───────┘  └──► PoolStats ──► PerformanceMonitor / PoolSizer
//!   (validate_idle, probe, reap_idle, set_health)
//! ```
//!
//! Drivers shipped here:
//!
//! - [`JsonLinesDriver`]: line-delimited JSON over TCP.
//! - `MockDriver` (feature `mock`): in-memory, with failure injection.

pub mod connection;
pub mod driver;
pub mod error;
pub mod jsonl;
pub mod pool;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use connection::{Connection, ConnectionState, PooledConnection};
pub use driver::{DatabaseDriver, RawConnection};
pub use error::{DriverError, PoolError, PoolResult};
pub use jsonl::JsonLinesDriver;
pub use pool::{AcquireOptions, Pool, PoolStats, ValidationReport};

#[cfg(any(test, feature = "mock"))]
pub use mock::MockDriver;
