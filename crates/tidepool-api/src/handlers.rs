//! HTTP handlers.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use tidepool_balancer::SelectionHint;
use tidepool_core::{PoolHealth, PoolId, QueryResult, Value, parse_duration};
use tidepool_executor::{ExecuteError, ExecuteOptions};
use tidepool_pool::{PoolError, PoolStats};

use crate::ApiState;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pool: Option<String>,
}

fn error_response(status: StatusCode, error: String, retryable: bool, pool: Option<&str>) -> Response {
    (
        status,
        Json(ErrorBody {
            error,
            retryable,
            pool: pool.map(str::to_string),
        }),
    )
        .into_response()
}

// ── Health ─────────────────────────────────────────────────────

/// Overall service status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Every pool is healthy.
    Healthy,
    /// Some pools are out of routing but at least one is serving.
    Degraded,
    /// No pool can take requests.
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct PoolReport {
    pub id: PoolId,
    pub status: PoolHealth,
    pub closed: bool,
    pub active: usize,
    pub idle: usize,
    pub target: usize,
    pub waiting: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: ServiceStatus,
    pub pools: Vec<PoolReport>,
}

pub fn service_status(pools: &[PoolReport]) -> ServiceStatus {
    let routable = pools
        .iter()
        .filter(|p| !p.closed && p.status.is_routable())
        .count();
    if routable == 0 {
        ServiceStatus::Unhealthy
    } else if routable == pools.len() {
        ServiceStatus::Healthy
    } else {
        ServiceStatus::Degraded
    }
}

/// GET /health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let pools: Vec<PoolReport> = state
        .executor
        .balancer()
        .group()
        .pools()
        .iter()
        .map(|pool| {
            let stats = pool.stats();
            PoolReport {
                id: stats.id,
                status: stats.health,
                closed: pool.is_closed(),
                active: stats.active,
                idle: stats.idle,
                target: stats.target,
                waiting: stats.waiting,
            }
        })
        .collect();
    let status = service_status(&pools);
    let code = match status {
        ServiceStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(HealthReport { status, pools }))
}

// ── Metrics ────────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let stats: Vec<PoolStats> = state
        .executor
        .balancer()
        .group()
        .pools()
        .iter()
        .map(|p| p.stats())
        .collect();
    let aggregates = state.executor.monitor().aggregates();
    let cache = state.cache.as_ref().map(|c| c.stats());
    let body = tidepool_metrics::render_prometheus(&stats, &aggregates, cache.as_ref());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

// ── Query ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub params: Vec<Value>,
    /// Cache TTL as a duration string ("500ms", "30s").
    pub ttl: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Pool to prefer when it is routable.
    pub prefer: Option<PoolId>,
    #[serde(default)]
    pub bypass_cache: bool,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub pool: PoolId,
    pub from_cache: bool,
    pub result: QueryResult,
}

/// POST /query
pub async fn run_query(State(state): State<ApiState>, Json(req): Json<QueryRequest>) -> Response {
    let ttl = match req.ttl.as_deref().map(|s| (s, parse_duration(s))) {
        None => None,
        Some((_, Some(ttl))) => Some(ttl),
        Some((raw, None)) => {
            return error_response(StatusCode::BAD_REQUEST, format!("invalid ttl: {raw:?}"), false, None);
        }
    };
    let opts = ExecuteOptions {
        ttl,
        tags: req.tags,
        hint: SelectionHint { prefer: req.prefer },
        cancel: None,
        bypass_cache: req.bypass_cache,
    };
    match state.executor.execute_with(&req.query, &req.params, opts).await {
        Ok(done) => Json(QueryResponse {
            pool: done.pool_id,
            from_cache: done.from_cache,
            result: (*done.result).clone(),
        })
        .into_response(),
        Err(err) => {
            debug!(error = %err, "query failed");
            let status = match &err {
                ExecuteError::Pool(PoolError::Query { .. }) => StatusCode::BAD_REQUEST,
                ExecuteError::Pool(PoolError::AcquireTimeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            error_response(status, err.to_string(), err.is_retryable(), err.pool())
        }
    }
}

// ── Cache invalidation ─────────────────────────────────────────

/// Exactly one selector is expected; when several are given all are applied.
#[derive(Debug, Default, Deserialize)]
pub struct InvalidateRequest {
    pub key: Option<String>,
    pub tag: Option<String>,
    pub pattern: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

/// POST /cache/invalidate
pub async fn invalidate_cache(
    State(state): State<ApiState>,
    Json(req): Json<InvalidateRequest>,
) -> Response {
    let Some(cache) = state.cache.as_ref() else {
        return error_response(StatusCode::NOT_FOUND, "cache is disabled".into(), false, None);
    };
    if req.key.is_none() && req.tag.is_none() && req.pattern.is_none() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "one of key, tag, or pattern is required".into(),
            false,
            None,
        );
    }
    let mut removed = 0;
    if let Some(key) = &req.key {
        removed += usize::from(cache.invalidate(key));
    }
    if let Some(tag) = &req.tag {
        removed += cache.invalidate_by_tag(tag);
    }
    if let Some(pattern) = &req.pattern {
        match cache.invalidate_by_pattern(pattern) {
            Ok(n) => removed += n,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string(), false, None),
        }
    }
    Json(InvalidateResponse { removed }).into_response()
}
