//! tidepool-metrics: performance monitoring for pools and the query cache.
//!
//! ```text
//! Executor ──record(MetricSample)──► PerformanceMonitor ──► MetricsSink(s)
//!                                        │  windows + aggregates ──► PoolSizer
//!                                        └─ try_send(Alert) ──► dispatch_alerts ──► AlertSink(s)
//! ```
//!
//! [`render_prometheus`] turns pool stats, aggregates, and cache stats into
//! the text exposition format served at `GET /metrics`.

pub mod monitor;
pub mod prometheus;
pub mod sink;

pub use monitor::{PerformanceMonitor, PoolAggregate, PoolTotals};
pub use prometheus::render_prometheus;
pub use sink::{AlertSink, MetricsSink, TracingAlertSink, dispatch_alerts};
