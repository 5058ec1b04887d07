//! tidepool-api — HTTP surface for Tidepool.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Overall and per-pool health as JSON; 503 when no pool is routable |
//! | GET | `/metrics` | Prometheus exposition of pool, monitor, and cache metrics |
//! | POST | `/query` | Run a statement through the balancer, cache, and pools |
//! | POST | `/cache/invalidate` | Drop cached results by key, tag, or glob pattern |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use tidepool_cache::QueryCache;
use tidepool_executor::Executor;

/// Shared state for API handlers. Pools and metrics are reached through
/// the executor's balancer and monitor.
#[derive(Clone)]
pub struct ApiState {
    pub executor: Arc<Executor>,
    pub cache: Option<Arc<QueryCache>>,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/query", post(handlers::run_query))
        .route("/cache/invalidate", post(handlers::invalidate_cache))
        .with_state(state)
}
