//! Pool sizer — metrics-driven target resizing.
//!
//! Decision rule per pool, evaluated once per tick:
//!
//! ```text
//! grow    util > grow_threshold   && target < max && acquire > latency threshold
//! shrink  util < shrink_threshold && target > min
//! ```
//!
//! A condition must hold for `sustain_windows` consecutive ticks, and no
//! two adjustments of the same pool happen within `adjustment_interval`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use tidepool_balancer::PoolGroup;
use tidepool_core::{PoolConfig, PoolId};
use tidepool_metrics::PerformanceMonitor;
use tidepool_pool::Pool;

/// A sizing decision for a single pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SizeDecision {
    Grow { from: usize, to: usize },
    Shrink { from: usize, to: usize },
    NoChange,
}

/// What the sizer saw for one pool during one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowObservation {
    pub utilization: f64,
    pub acquire_latency_ms: f64,
    pub samples: usize,
}

#[derive(Debug, Default)]
struct SizerState {
    /// Monitor cursor: samples up to here were already consumed.
    cursor: u64,
    grow_streak: u32,
    shrink_streak: u32,
    last_adjustment: Option<Instant>,
}

pub struct PoolSizer {
    group: Arc<PoolGroup>,
    monitor: Arc<PerformanceMonitor>,
    states: Mutex<HashMap<PoolId, SizerState>>,
}

impl PoolSizer {
    pub fn new(group: Arc<PoolGroup>, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            group,
            monitor,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Decide for one pool given one window's observation. Updates streaks
    /// and cooldown bookkeeping but does not touch the pool.
    pub fn evaluate(
        &self,
        pool_id: &str,
        config: &PoolConfig,
        target: usize,
        observed: &WindowObservation,
    ) -> SizeDecision {
        let mut states = self.states.lock();
        let state = states.entry(pool_id.to_string()).or_default();
        decide(state, config, target, observed, Instant::now())
    }

    /// Observe, decide, and apply for one pool.
    pub fn evaluate_pool(&self, pool: &Pool) -> SizeDecision {
        if pool.is_closed() {
            return SizeDecision::NoChange;
        }
        let observed = self.observe(pool);
        let decision = self.evaluate(pool.id(), pool.config(), pool.target_size(), &observed);
        match decision {
            SizeDecision::Grow { from, to } => {
                pool.resize(to);
                info!(
                    pool = %pool.id(),
                    from,
                    to,
                    utilization = observed.utilization,
                    acquire_ms = observed.acquire_latency_ms,
                    samples = observed.samples,
                    "sizer grew pool"
                );
            }
            SizeDecision::Shrink { from, to } => {
                pool.resize(to);
                info!(
                    pool = %pool.id(),
                    from,
                    to,
                    utilization = observed.utilization,
                    samples = observed.samples,
                    "sizer shrank pool"
                );
            }
            SizeDecision::NoChange => {}
        }
        decision
    }

    /// Evaluate every registered pool.
    pub fn evaluate_all(&self) -> Vec<(PoolId, SizeDecision)> {
        let pools = self.group.pools();
        self.states
            .lock()
            .retain(|id, _| pools.iter().any(|p| p.id() == id));
        pools
            .iter()
            .map(|pool| (pool.id().to_string(), self.evaluate_pool(pool)))
            .collect()
    }

    /// Tick every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?interval, "pool sizer started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let decisions = self.evaluate_all();
                    debug!(pools = decisions.len(), "sizer tick");
                }
                _ = shutdown.changed() => {
                    info!("pool sizer stopping");
                    break;
                }
            }
        }
    }

    /// Samples recorded since the previous tick. A quiet pool falls back
    /// to its live utilization with no acquire latency.
    fn observe(&self, pool: &Pool) -> WindowObservation {
        let cursor = {
            let mut states = self.states.lock();
            states.entry(pool.id().to_string()).or_default().cursor
        };
        match self.monitor.aggregate_since(pool.id(), cursor) {
            Some((agg, next)) => {
                if let Some(state) = self.states.lock().get_mut(pool.id()) {
                    state.cursor = next;
                }
                WindowObservation {
                    utilization: agg.avg_utilization,
                    acquire_latency_ms: agg.avg_acquire_ms,
                    samples: agg.samples,
                }
            }
            None => WindowObservation {
                utilization: pool.utilization(),
                acquire_latency_ms: 0.0,
                samples: 0,
            },
        }
    }
}

fn decide(
    state: &mut SizerState,
    config: &PoolConfig,
    target: usize,
    observed: &WindowObservation,
    now: Instant,
) -> SizeDecision {
    let latency_threshold_ms = config.acquire_latency_threshold.as_secs_f64() * 1000.0;
    let wants_grow = observed.utilization > config.grow_threshold
        && target < config.max_size
        && observed.acquire_latency_ms > latency_threshold_ms;
    let wants_shrink = observed.utilization < config.shrink_threshold && target > config.min_size;

    state.grow_streak = if wants_grow { state.grow_streak + 1 } else { 0 };
    state.shrink_streak = if wants_shrink { state.shrink_streak + 1 } else { 0 };

    let sustain = config.sustain_windows.max(1);
    let cooling = state
        .last_adjustment
        .is_some_and(|at| now.duration_since(at) < config.adjustment_interval);

    let decision = if state.grow_streak >= sustain {
        let step = config.grow_step.max(1).min(config.max_size - target);
        SizeDecision::Grow {
            from: target,
            to: target + step,
        }
    } else if state.shrink_streak >= sustain {
        let step = config.shrink_step.max(1).min(target - config.min_size);
        SizeDecision::Shrink {
            from: target,
            to: target - step,
        }
    } else {
        return SizeDecision::NoChange;
    };

    if cooling {
        debug!(?decision, "resize suppressed by cooldown");
        return SizeDecision::NoChange;
    }
    state.grow_streak = 0;
    state.shrink_streak = 0;
    state.last_adjustment = Some(now);
    decision
}
