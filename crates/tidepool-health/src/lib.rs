//! Tidepool health checking.
//!
//! Validates idle connections, moves pools out of routing when validation
//! failures pile up, and probes unhealthy or degraded pools until they
//! recover.

pub mod checker;
pub mod tracker;

pub use checker::{HealthCallback, HealthChecker, PoolCheck};
pub use tracker::{ValidationTracker, Verdict};
