//! tidepool-executor: the request path.
//!
//! ```text
//! execute(query, params)
//!   └─► LoadBalancer::select ─► QueryCache::get ──hit──► result
//!                                    │ miss
//!                                    ▼
//!        Pool::acquire ─► execute ─► release ─► monitor.record
//!                                    │            balancer.record_outcome
//!                                    └──────────► QueryCache::set
//! ```

pub mod error;
pub mod executor;

pub use error::{ExecuteError, ExecuteResult};
pub use executor::{ExecuteOptions, Execution, Executor};
