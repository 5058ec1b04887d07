//! Pool selection strategies.
//!
//! Each strategy picks one index into a slice of eligible [`Candidate`]s,
//! which the group supplies in registration order.

use std::sync::atomic::{AtomicUsize, Ordering};

use tidepool_core::BalanceStrategy;

use crate::group::Candidate;

const UTILIZATION_PENALTY: f64 = 0.5;
const ERROR_RATE_PENALTY: f64 = 1.0;
const LATENCY_PENALTY: f64 = 0.5;

pub trait Strategy: Send + Sync {
    /// Index of the chosen candidate, or `None` when `candidates` is empty.
    fn select(&self, candidates: &[Candidate]) -> Option<usize>;

    fn name(&self) -> &'static str;
}

/// Build the strategy configured for a deployment.
pub fn strategy_for(kind: BalanceStrategy) -> Box<dyn Strategy> {
    match kind {
        BalanceStrategy::RoundRobin => Box::new(RoundRobin::new()),
        BalanceStrategy::LeastConnections => Box::new(LeastConnections),
        BalanceStrategy::Weighted => Box::new(Weighted),
    }
}

// ── Round robin ──────────────────────────────────────────────────────

/// Cycles through candidates with a lock-free counter. The counter wraps
/// modulo the current candidate count, so it adapts as pools drop in and
/// out of eligibility.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next index modulo `count`.
    pub fn next(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(idx % count)
    }

    pub fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }

    pub fn current(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Strategy for RoundRobin {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        self.next(candidates.len())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

// ── Least connections ────────────────────────────────────────────────

/// Fewest active connections wins; ties go to the earliest registered.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastConnections;

impl Strategy for LeastConnections {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(i, c)| (c.active, *i))
            .map(|(i, _)| i)
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

// ── Weighted ─────────────────────────────────────────────────────────

/// Highest score wins:
///
/// ```text
/// score = weight − 0.5·utilization − 1.0·error_rate − 0.5·(latency / max latency)
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct Weighted;

impl Weighted {
    pub fn score(candidate: &Candidate, max_latency_ms: f64) -> f64 {
        let latency = if max_latency_ms > 0.0 {
            candidate.latency_ms / max_latency_ms
        } else {
            0.0
        };
        candidate.weight
            - UTILIZATION_PENALTY * candidate.utilization
            - ERROR_RATE_PENALTY * candidate.error_rate
            - LATENCY_PENALTY * latency
    }
}

impl Strategy for Weighted {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        let max_latency = candidates
            .iter()
            .map(|c| c.latency_ms)
            .fold(0.0_f64, f64::max);
        let mut best: Option<(usize, f64)> = None;
        for (i, c) in candidates.iter().enumerate() {
            let score = Self::score(c, max_latency);
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((i, score));
            }
        }
        best.map(|(i, _)| i)
    }

    fn name(&self) -> &'static str {
        "weighted"
    }
}
