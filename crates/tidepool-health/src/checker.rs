//! Periodic pool health checking.
//!
//! Each tick visits every registered pool:
//!
//! ```text
//! Healthy    ── validate idle batch ──► failure ratio ≥ threshold ──► Unhealthy
//! Unhealthy  ─┐
//!             ├─ probe ──► N consecutive successes ──► Healthy
//! Degraded   ─┘
//! (every pool) ── reap idle / expired connections, top up to min_size
//! ```
//!
//! The balancer reads pool health on every selection, so a transition here
//! takes effect on the next routed request.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tidepool_balancer::PoolGroup;
use tidepool_core::{HealthConfig, PoolHealth, PoolId};
use tidepool_pool::{Pool, ValidationReport};

use crate::tracker::{ValidationTracker, Verdict};

/// Callback invoked when the checker changes a pool's health.
pub type HealthCallback = Arc<dyn Fn(PoolId, PoolHealth) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Outcome of checking one pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolCheck {
    pub pool_id: PoolId,
    pub health: PoolHealth,
    pub validation: ValidationReport,
    /// Set when the pool was probed for recovery instead of validated.
    pub probe: Option<bool>,
    pub reaped: usize,
}

pub struct HealthChecker {
    group: Arc<PoolGroup>,
    config: HealthConfig,
    trackers: Mutex<HashMap<PoolId, ValidationTracker>>,
    on_status_change: Option<HealthCallback>,
}

impl HealthChecker {
    pub fn new(group: Arc<PoolGroup>, config: HealthConfig) -> Self {
        Self {
            group,
            config,
            trackers: Mutex::new(HashMap::new()),
            on_status_change: None,
        }
    }

    pub fn with_callback(mut self, callback: HealthCallback) -> Self {
        self.on_status_change = Some(callback);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Check every registered pool once.
    pub async fn check_all(&self) -> Vec<PoolCheck> {
        let pools = self.group.pools();
        {
            let mut trackers = self.trackers.lock();
            trackers.retain(|id, _| pools.iter().any(|p| p.id() == id));
        }
        let mut checks = Vec::with_capacity(pools.len());
        for pool in &pools {
            if let Some(check) = self.check_pool(pool).await {
                checks.push(check);
            }
        }
        checks
    }

    /// Check one pool. Closed pools are skipped.
    pub async fn check_pool(&self, pool: &Pool) -> Option<PoolCheck> {
        if pool.is_closed() {
            return None;
        }
        let mut check = PoolCheck {
            pool_id: pool.id().to_string(),
            health: pool.health(),
            ..PoolCheck::default()
        };

        let transition = match check.health {
            PoolHealth::Healthy => {
                let report = pool
                    .validate_idle(self.config.validation_batch, self.config.ping_timeout)
                    .await;
                check.validation = report;
                let verdict = self.with_tracker(pool.id(), |t| {
                    t.record_validation(report.checked, report.failed)
                });
                (verdict == Verdict::Unhealthy).then_some(PoolHealth::Unhealthy)
            }
            PoolHealth::Unhealthy | PoolHealth::Degraded => {
                let ok = pool.probe(self.config.ping_timeout).await;
                check.probe = Some(ok);
                let verdict = self.with_tracker(pool.id(), |t| t.record_probe(ok));
                if !ok {
                    debug!(pool = %pool.id(), health = %check.health, "recovery probe failed");
                }
                (verdict == Verdict::Recovered).then_some(PoolHealth::Healthy)
            }
        };

        if let Some(next) = transition {
            // A concurrent close or manual override may have raced this check.
            if !pool.is_closed() {
                pool.set_health(next);
                self.with_tracker(pool.id(), ValidationTracker::reset);
                check.health = next;
                match next {
                    PoolHealth::Unhealthy => {
                        warn!(pool = %pool.id(), "pool marked unhealthy, removed from routing")
                    }
                    _ => info!(pool = %pool.id(), "pool recovered, back in routing"),
                }
                if let Some(cb) = &self.on_status_change {
                    cb(pool.id().to_string(), next).await;
                }
            }
        }

        check.reaped = pool.reap_idle();
        Some(check)
    }

    /// Tick until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, "health checker started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    let checks = self.check_all().await;
                    debug!(pools = checks.len(), "health check tick");
                }
                _ = shutdown.changed() => {
                    info!("health checker stopping");
                    break;
                }
            }
        }
    }

    fn with_tracker<R>(&self, pool_id: &str, f: impl FnOnce(&mut ValidationTracker) -> R) -> R {
        let mut trackers = self.trackers.lock();
        let tracker = trackers
            .entry(pool_id.to_string())
            .or_insert_with(|| ValidationTracker::new(&self.config));
        f(tracker)
    }
}
