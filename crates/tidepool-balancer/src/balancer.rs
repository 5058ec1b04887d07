//! Health-aware pool selection.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use tidepool_core::{BalancerConfig, PoolId};
use tidepool_pool::Pool;

use crate::error::{BalancerError, BalancerResult};
use crate::group::PoolGroup;
use crate::strategy::{Strategy, strategy_for};

/// Per-request routing hint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionHint {
    /// Route to this pool if it is eligible; otherwise fall back to the
    /// configured strategy.
    pub prefer: Option<PoolId>,
}

impl SelectionHint {
    pub fn prefer(pool_id: impl Into<PoolId>) -> Self {
        Self {
            prefer: Some(pool_id.into()),
        }
    }
}

/// Routes requests to one of a group's pools. Only `Healthy`, open pools
/// are eligible; selection is a stateless per-request decision.
pub struct LoadBalancer {
    group: Arc<PoolGroup>,
    strategy: Box<dyn Strategy>,
    latency_target: Duration,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.strategy.name())
            .field("group", &self.group)
            .finish()
    }
}

impl LoadBalancer {
    pub fn new(group: Arc<PoolGroup>, config: &BalancerConfig) -> Self {
        Self::with_strategy(group, strategy_for(config.strategy), config.latency_target)
    }

    pub fn with_strategy(
        group: Arc<PoolGroup>,
        strategy: Box<dyn Strategy>,
        latency_target: Duration,
    ) -> Self {
        Self {
            group,
            strategy,
            latency_target,
        }
    }

    pub fn group(&self) -> &Arc<PoolGroup> {
        &self.group
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Pick a pool for one request.
    pub fn select(&self, hint: &SelectionHint) -> BalancerResult<Pool> {
        let candidates = self.group.eligible();
        if let Some(preferred) = hint.prefer.as_deref() {
            if let Some(c) = candidates.iter().find(|c| c.pool.id() == preferred) {
                return Ok(c.pool.clone());
            }
            debug!(pool = %preferred, "preferred pool not eligible, using strategy");
        }
        match self.strategy.select(&candidates) {
            Some(i) => Ok(candidates[i].pool.clone()),
            None => {
                let registered = self.group.len();
                warn!(registered, strategy = self.strategy.name(), "no healthy pool available");
                Err(BalancerError::NoHealthyPool { registered })
            }
        }
    }

    /// Feed a request outcome back for weighted routing.
    pub fn record_outcome(&self, pool_id: &str, latency: Duration, success: bool) {
        self.group
            .record_outcome(pool_id, latency, success, self.latency_target);
    }
}
