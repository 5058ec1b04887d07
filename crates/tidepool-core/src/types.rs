//! Domain types shared across Tidepool crates.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use serde_json::Value;

/// Identifier of a pool (one per configured endpoint).
pub type PoolId = String;

// ── Pool health ────────────────────────────────────────────────────

/// Routing eligibility of a pool.
///
/// `Degraded` is set by the pool itself after repeated creation failures;
/// `Unhealthy` is set by the health checker after failed validations.
/// Neither state destroys work already handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl PoolHealth {
    /// Whether the load balancer may route new requests to the pool.
    pub fn is_routable(self) -> bool {
        self == PoolHealth::Healthy
    }

    pub fn as_u8(self) -> u8 {
        match self {
            PoolHealth::Healthy => 0,
            PoolHealth::Degraded => 1,
            PoolHealth::Unhealthy => 2,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => PoolHealth::Degraded,
            2 => PoolHealth::Unhealthy,
            _ => PoolHealth::Healthy,
        }
    }
}

impl std::fmt::Display for PoolHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolHealth::Healthy => write!(f, "healthy"),
            PoolHealth::Degraded => write!(f, "degraded"),
            PoolHealth::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

// ── Metric samples ─────────────────────────────────────────────────

/// One observation of a pool, recorded per query completion or failed acquire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub pool_id: PoolId,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub acquire_latency_ms: f64,
    pub query_latency_ms: f64,
    /// Active connections over current target size, in `[0, 1]`.
    pub utilization: f64,
    pub error_count: u32,
    /// Waiters queued on the pool when the sample was taken.
    pub queue_length: usize,
}

impl MetricSample {
    pub fn new(pool_id: impl Into<PoolId>) -> Self {
        Self {
            pool_id: pool_id.into(),
            timestamp: epoch_millis(),
            acquire_latency_ms: 0.0,
            query_latency_ms: 0.0,
            utilization: 0.0,
            error_count: 0,
            queue_length: 0,
        }
    }
}

// ── Query results ──────────────────────────────────────────────────

/// Rows returned by a driver. Treated as immutable once cached.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub rows_affected: u64,
}

impl QueryResult {
    /// Approximate in-memory footprint in bytes, used for cache accounting.
    pub fn size_bytes(&self) -> usize {
        let columns: usize = self.columns.iter().map(|c| c.len() + 8).sum();
        let rows: usize = self
            .rows
            .iter()
            .map(|row| 24 + row.iter().map(value_size).sum::<usize>())
            .sum();
        std::mem::size_of::<Self>() + columns + rows
    }
}

fn value_size(v: &Value) -> usize {
    match v {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len() + 8,
        Value::Array(items) => 8 + items.iter().map(value_size).sum::<usize>(),
        Value::Object(map) => {
            8 + map
                .iter()
                .map(|(k, v)| k.len() + value_size(v))
                .sum::<usize>()
        }
    }
}

// ── Alerts ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighUtilization,
    SlowAcquire,
    QueueBacklog,
    HighErrorRate,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::HighUtilization => write!(f, "high_utilization"),
            AlertKind::SlowAcquire => write!(f, "slow_acquire"),
            AlertKind::QueueBacklog => write!(f, "queue_backlog"),
            AlertKind::HighErrorRate => write!(f, "high_error_rate"),
        }
    }
}

/// A threshold breach raised by the performance monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub pool_id: PoolId,
    pub observed: f64,
    pub threshold: f64,
    pub timestamp: u64,
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} on pool {}: observed {:.2} > threshold {:.2}",
            self.kind, self.pool_id, self.observed, self.threshold
        )
    }
}

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
