//! The set of pools a balancer routes across, with per-pool routing state.
//!
//! Read-mostly: selection takes a read lock and snapshots the eligible
//! members; outcome feedback and registration take the write lock briefly.

use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use tidepool_core::{PoolHealth, PoolId};
use tidepool_pool::Pool;

use crate::error::{BalancerError, BalancerResult};

pub const MIN_WEIGHT: f64 = 0.1;
pub const MAX_WEIGHT: f64 = 2.0;

const WEIGHT_STEP_UP: f64 = 0.05;
const WEIGHT_STEP_DOWN: f64 = 0.1;
/// Smoothing factor for latency and error moving averages.
const EWMA_ALPHA: f64 = 0.2;

struct Member {
    pool: Pool,
    weight: f64,
    latency_ms: f64,
    error_rate: f64,
    /// Outcomes folded into the averages so far.
    observed: u64,
}

/// Routing inputs for one eligible pool, captured at selection time.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub pool: Pool,
    pub weight: f64,
    pub latency_ms: f64,
    pub error_rate: f64,
    pub active: usize,
    pub utilization: f64,
}

/// Serializable view of a member, for status endpoints and logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberStatus {
    pub id: PoolId,
    pub health: PoolHealth,
    pub closed: bool,
    pub weight: f64,
    pub latency_ms: f64,
    pub error_rate: f64,
}

#[derive(Default)]
pub struct PoolGroup {
    members: RwLock<Vec<Member>>,
}

impl std::fmt::Debug for PoolGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self.members.read().iter().map(|m| m.pool.id().to_string()).collect();
        f.debug_struct("PoolGroup").field("pools", &ids).finish()
    }
}

impl PoolGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pool with its initial weight (clamped to the weight bounds).
    /// Registration order is the round-robin order.
    pub fn register(&self, pool: Pool, weight: f64) -> BalancerResult<()> {
        let mut members = self.members.write();
        if members.iter().any(|m| m.pool.id() == pool.id()) {
            return Err(BalancerError::DuplicatePool(pool.id().to_string()));
        }
        let weight = weight.clamp(MIN_WEIGHT, MAX_WEIGHT);
        info!(pool = %pool.id(), weight, "pool registered");
        members.push(Member {
            pool,
            weight,
            latency_ms: 0.0,
            error_rate: 0.0,
            observed: 0,
        });
        Ok(())
    }

    pub fn deregister(&self, pool_id: &str) -> BalancerResult<Pool> {
        let mut members = self.members.write();
        let pos = members
            .iter()
            .position(|m| m.pool.id() == pool_id)
            .ok_or_else(|| BalancerError::UnknownPool(pool_id.to_string()))?;
        info!(pool = %pool_id, "pool deregistered");
        Ok(members.remove(pos).pool)
    }

    pub fn get(&self, pool_id: &str) -> Option<Pool> {
        self.members
            .read()
            .iter()
            .find(|m| m.pool.id() == pool_id)
            .map(|m| m.pool.clone())
    }

    /// All pools in registration order.
    pub fn pools(&self) -> Vec<Pool> {
        self.members.read().iter().map(|m| m.pool.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pools that may receive new requests, in registration order.
    pub fn eligible(&self) -> Vec<Candidate> {
        self.members
            .read()
            .iter()
            .filter(|m| is_eligible(&m.pool))
            .map(|m| {
                let stats = m.pool.stats();
                Candidate {
                    pool: m.pool.clone(),
                    weight: m.weight,
                    latency_ms: m.latency_ms,
                    error_rate: m.error_rate,
                    active: stats.active,
                    utilization: stats.utilization(),
                }
            })
            .collect()
    }

    /// Feed one request outcome back into the pool's routing state.
    ///
    /// Weight rises by a small step on a fast success and falls otherwise,
    /// bounded to `[0.1, 2.0]`.
    pub fn record_outcome(
        &self,
        pool_id: &str,
        latency: Duration,
        success: bool,
        latency_target: Duration,
    ) {
        let mut members = self.members.write();
        let Some(member) = members.iter_mut().find(|m| m.pool.id() == pool_id) else {
            return;
        };
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let error = if success { 0.0 } else { 1.0 };
        if member.observed == 0 {
            member.latency_ms = latency_ms;
            member.error_rate = error;
        } else {
            member.latency_ms = ewma(member.latency_ms, latency_ms);
            member.error_rate = ewma(member.error_rate, error);
        }
        member.observed += 1;

        let previous = member.weight;
        let delta = if success && latency <= latency_target {
            WEIGHT_STEP_UP
        } else {
            -WEIGHT_STEP_DOWN
        };
        member.weight = (member.weight + delta).clamp(MIN_WEIGHT, MAX_WEIGHT);
        if (member.weight - previous).abs() > f64::EPSILON {
            debug!(pool = %pool_id, weight = member.weight, latency_ms, success, "pool weight adjusted");
        }
    }

    pub fn weight(&self, pool_id: &str) -> Option<f64> {
        self.members
            .read()
            .iter()
            .find(|m| m.pool.id() == pool_id)
            .map(|m| m.weight)
    }

    pub fn set_weight(&self, pool_id: &str, weight: f64) -> BalancerResult<()> {
        let mut members = self.members.write();
        let member = members
            .iter_mut()
            .find(|m| m.pool.id() == pool_id)
            .ok_or_else(|| BalancerError::UnknownPool(pool_id.to_string()))?;
        member.weight = weight.clamp(MIN_WEIGHT, MAX_WEIGHT);
        Ok(())
    }

    pub fn status(&self) -> Vec<MemberStatus> {
        self.members
            .read()
            .iter()
            .map(|m| MemberStatus {
                id: m.pool.id().to_string(),
                health: m.pool.health(),
                closed: m.pool.is_closed(),
                weight: m.weight,
                latency_ms: m.latency_ms,
                error_rate: m.error_rate,
            })
            .collect()
    }
}

pub(crate) fn is_eligible(pool: &Pool) -> bool {
    pool.health().is_routable() && !pool.is_closed()
}

fn ewma(current: f64, observed: f64) -> f64 {
    current + EWMA_ALPHA * (observed - current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tidepool_core::PoolConfig;
    use tidepool_pool::MockDriver;

    fn pool(id: &str) -> Pool {
        Pool::new(id, format!("mock://{id}"), PoolConfig::default(), Arc::new(MockDriver::new()))
    }

    #[test]
    fn rejects_duplicate_registration() {
        let group = PoolGroup::new();
        group.register(pool("a"), 1.0).unwrap();
        assert_eq!(
            group.register(pool("a"), 1.0),
            Err(BalancerError::DuplicatePool("a".into()))
        );
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn weight_is_clamped_on_register() {
        let group = PoolGroup::new();
        group.register(pool("a"), 10.0).unwrap();
        group.register(pool("b"), 0.0).unwrap();
        assert_eq!(group.weight("a"), Some(MAX_WEIGHT));
        assert_eq!(group.weight("b"), Some(MIN_WEIGHT));
    }

    #[test]
    fn unhealthy_and_degraded_pools_are_not_eligible() {
        let group = PoolGroup::new();
        let a = pool("a");
        let b = pool("b");
        let c = pool("c");
        group.register(a.clone(), 1.0).unwrap();
        group.register(b.clone(), 1.0).unwrap();
        group.register(c, 1.0).unwrap();
        a.set_health(PoolHealth::Unhealthy);
        b.set_health(PoolHealth::Degraded);

        let ids: Vec<String> = group.eligible().iter().map(|c| c.pool.id().to_string()).collect();
        assert_eq!(ids, vec!["c".to_string()]);
    }

    #[test]
    fn outcomes_move_weight_within_bounds() {
        let group = PoolGroup::new();
        group.register(pool("a"), 1.0).unwrap();
        let target = Duration::from_millis(100);

        for _ in 0..100 {
            group.record_outcome("a", Duration::from_millis(5), true, target);
        }
        assert_eq!(group.weight("a"), Some(MAX_WEIGHT));

        for _ in 0..100 {
            group.record_outcome("a", Duration::from_millis(5), false, target);
        }
        assert_eq!(group.weight("a"), Some(MIN_WEIGHT));
    }

    #[test]
    fn slow_success_lowers_weight() {
        let group = PoolGroup::new();
        group.register(pool("a"), 1.0).unwrap();
        group.record_outcome("a", Duration::from_millis(500), true, Duration::from_millis(100));
        let weight = group.weight("a").unwrap();
        assert!((weight - 0.9).abs() < 1e-9);
        let status = group.status();
        assert!((status[0].latency_ms - 500.0).abs() < 1e-9);
    }

    #[test]
    fn first_failure_after_clean_run_moves_error_rate_by_alpha() {
        let group = PoolGroup::new();
        group.register(pool("a"), 1.0).unwrap();
        let target = Duration::from_millis(100);
        for _ in 0..1000 {
            group.record_outcome("a", Duration::ZERO, true, target);
        }
        group.record_outcome("a", Duration::from_millis(10), false, target);

        let status = &group.status()[0];
        assert!((status.error_rate - EWMA_ALPHA).abs() < 1e-9);
        assert!((status.latency_ms - 10.0 * EWMA_ALPHA).abs() < 1e-9);
    }

    #[test]
    fn first_outcome_seeds_the_averages() {
        let group = PoolGroup::new();
        group.register(pool("a"), 1.0).unwrap();
        group.record_outcome("a", Duration::from_millis(40), false, Duration::from_millis(100));
        let status = &group.status()[0];
        assert!((status.error_rate - 1.0).abs() < 1e-9);
        assert!((status.latency_ms - 40.0).abs() < 1e-9);
    }

    #[test]
    fn deregister_removes_pool() {
        let group = PoolGroup::new();
        group.register(pool("a"), 1.0).unwrap();
        assert_eq!(group.deregister("a").unwrap().id(), "a");
        assert!(group.is_empty());
        assert!(matches!(group.deregister("a"), Err(BalancerError::UnknownPool(_))));
    }
}
