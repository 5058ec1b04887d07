//! Per-pool validation bookkeeping.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use tidepool_core::HealthConfig;

/// What the tracker concluded from the latest observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not enough evidence either way.
    Unchanged,
    /// Failure ratio within the window reached the threshold.
    Unhealthy,
    /// Enough consecutive successful probes to re-admit the pool.
    Recovered,
}

/// Tracks validation outcomes inside a sliding time window and consecutive
/// recovery probe results for one pool.
#[derive(Debug)]
pub struct ValidationTracker {
    window: Duration,
    failure_ratio: f64,
    min_validations: usize,
    recovery_successes: u32,
    outcomes: VecDeque<(Instant, usize, usize)>,
    consecutive_successes: u32,
}

impl ValidationTracker {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            window: config.window,
            failure_ratio: config.failure_ratio,
            min_validations: config.min_validations.max(1),
            recovery_successes: config.recovery_successes.max(1),
            outcomes: VecDeque::new(),
            consecutive_successes: 0,
        }
    }

    /// Record one validation pass of `checked` connections, `failed` of
    /// which failed.
    pub fn record_validation(&mut self, checked: usize, failed: usize) -> Verdict {
        let now = Instant::now();
        self.prune(now);
        if checked > 0 {
            self.outcomes.push_back((now, checked, failed));
        }
        let (checked, failed) = self.totals();
        if checked < self.min_validations {
            return Verdict::Unchanged;
        }
        let ratio = failed as f64 / checked as f64;
        if ratio >= self.failure_ratio {
            warn!(checked, failed, ratio, threshold = self.failure_ratio, "validation failure ratio exceeded");
            return Verdict::Unhealthy;
        }
        Verdict::Unchanged
    }

    /// Record one recovery probe.
    pub fn record_probe(&mut self, ok: bool) -> Verdict {
        if !ok {
            self.consecutive_successes = 0;
            return Verdict::Unchanged;
        }
        self.consecutive_successes += 1;
        debug!(successes = self.consecutive_successes, needed = self.recovery_successes, "recovery probe succeeded");
        if self.consecutive_successes >= self.recovery_successes {
            return Verdict::Recovered;
        }
        Verdict::Unchanged
    }

    /// Validations and failures currently inside the window.
    pub fn totals(&self) -> (usize, usize) {
        self.outcomes
            .iter()
            .fold((0, 0), |(c, f), (_, checked, failed)| (c + checked, f + failed))
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Forget all history, after a state transition.
    pub fn reset(&mut self) {
        self.outcomes.clear();
        self.consecutive_successes = 0;
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _, _)) = self.outcomes.front() {
            if now.duration_since(*at) > self.window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }
}
