//! Query execution across balanced, cached pools.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tidepool_balancer::{LoadBalancer, SelectionHint};
use tidepool_cache::{Cacheable, derive_key, is_write_statement};
use tidepool_core::{MetricSample, PoolId, QueryResult, Value};
use tidepool_metrics::PerformanceMonitor;
use tidepool_pool::{AcquireOptions, Pool, PoolError};

use crate::error::ExecuteResult;

/// Per-call knobs for [`Executor::execute_with`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Cache TTL for this result; the cache default when `None`.
    pub ttl: Option<Duration>,
    /// Tags attached to the cached result, for later invalidation.
    pub tags: Vec<String>,
    pub hint: SelectionHint,
    /// Aborts the acquire wait or the running statement.
    pub cancel: Option<CancellationToken>,
    /// Skip both cache lookup and cache fill.
    pub bypass_cache: bool,
}

impl ExecuteOptions {
    pub fn tagged(tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// A completed query.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub result: Arc<QueryResult>,
    pub pool_id: PoolId,
    pub from_cache: bool,
}

/// Runs queries through the balancer, cache, and pools, feeding every
/// outcome back to the monitor and the balancer's weights.
pub struct Executor {
    balancer: Arc<LoadBalancer>,
    monitor: Arc<PerformanceMonitor>,
    cache: Option<Arc<dyn Cacheable<QueryResult>>>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("balancer", &self.balancer)
            .field("cached", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

enum Attempt {
    Done(QueryResult),
    Retry(PoolError),
}

impl Executor {
    pub fn new(balancer: Arc<LoadBalancer>, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            balancer,
            monitor,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cacheable<QueryResult>>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub async fn execute(&self, query: &str, params: &[Value]) -> ExecuteResult<Arc<QueryResult>> {
        self.execute_with(query, params, ExecuteOptions::default())
            .await
            .map(|e| e.result)
    }

    /// Run `query` with `params`.
    ///
    /// A pool is selected first, then the cache is consulted. On a miss the
    /// statement runs on a pooled connection; a `ConnectionBroken` failure
    /// is retried once on another connection from the same pool. Read
    /// results are cached; keeping the cache coherent after writes is up
    /// to the caller.
    pub async fn execute_with(
        &self,
        query: &str,
        params: &[Value],
        opts: ExecuteOptions,
    ) -> ExecuteResult<Execution> {
        let pool = self.balancer.select(&opts.hint)?;
        let cache = self
            .cache
            .as_ref()
            .filter(|_| !opts.bypass_cache && !is_write_statement(query));
        let key = cache.map(|_| derive_key(query, params));

        if let (Some(cache), Some(key)) = (cache, key.as_deref())
            && let Some(hit) = cache.get(key)
        {
            debug!(pool = %pool.id(), "query served from cache");
            return Ok(Execution {
                result: hit,
                pool_id: pool.id().to_string(),
                from_cache: true,
            });
        }

        let result = match self.attempt(&pool, query, params, &opts).await? {
            Attempt::Done(result) => result,
            Attempt::Retry(err) => {
                warn!(pool = %pool.id(), error = %err, "connection broke mid-query, retrying once");
                match self.attempt(&pool, query, params, &opts).await? {
                    Attempt::Done(result) => result,
                    Attempt::Retry(err) => return Err(err.into()),
                }
            }
        };

        if let (Some(cache), Some(key)) = (cache, key.as_deref()) {
            let stored = cache.set(key, result.clone(), opts.ttl, &opts.tags);
            debug!(pool = %pool.id(), stored, "query result offered to cache");
        }
        Ok(Execution {
            result: Arc::new(result),
            pool_id: pool.id().to_string(),
            from_cache: false,
        })
    }

    /// One acquire-execute-release round trip. A broken connection comes
    /// back as [`Attempt::Retry`]; every other failure is final.
    async fn attempt(
        &self,
        pool: &Pool,
        query: &str,
        params: &[Value],
        opts: &ExecuteOptions,
    ) -> ExecuteResult<Attempt> {
        let started = Instant::now();
        let mut acquire = AcquireOptions::with_timeout(pool.config().acquire_timeout);
        if let Some(token) = &opts.cancel {
            acquire = acquire.cancel_on(token.clone());
        }
        let mut conn = match pool.acquire_with(acquire).await {
            Ok(conn) => conn,
            Err(err) => {
                let load = Load::of(pool);
                self.observe(pool, load, started.elapsed(), Duration::ZERO, false);
                return Err(err.into());
            }
        };
        let acquired_in = started.elapsed();

        let query_started = Instant::now();
        let outcome = match &opts.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => None,
                res = conn.execute(query, params) => Some(res),
            },
            None => Some(conn.execute(query, params).await),
        };
        let query_took = query_started.elapsed();
        let outcome = outcome.unwrap_or_else(|| {
            // The session is mid-statement; it cannot be reused.
            conn.mark_broken();
            Err(PoolError::Cancelled {
                pool: pool.id().to_string(),
                waited: started.elapsed(),
            })
        });
        // Sampled while the loan is still counted as active.
        let load = Load::of(pool);
        conn.release();

        self.observe(pool, load, acquired_in, query_took, outcome.is_ok());
        match outcome {
            Ok(result) => Ok(Attempt::Done(result)),
            Err(err @ PoolError::ConnectionBroken { .. }) => Ok(Attempt::Retry(err)),
            Err(err) => Err(err.into()),
        }
    }

    fn observe(&self, pool: &Pool, load: Load, acquire: Duration, query: Duration, success: bool) {
        self.monitor.record(MetricSample {
            acquire_latency_ms: acquire.as_secs_f64() * 1000.0,
            query_latency_ms: query.as_secs_f64() * 1000.0,
            utilization: load.utilization,
            error_count: u32::from(!success),
            queue_length: load.waiting,
            ..MetricSample::new(pool.id())
        });
        self.balancer
            .record_outcome(pool.id(), acquire + query, success);
    }
}

/// Pool pressure captured at the moment a request finishes with its pool.
#[derive(Debug, Clone, Copy)]
struct Load {
    utilization: f64,
    waiting: usize,
}

impl Load {
    fn of(pool: &Pool) -> Self {
        Self {
            utilization: pool.utilization(),
            waiting: pool.waiting(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidepool_balancer::PoolGroup;
    use tidepool_cache::QueryCache;
    use tidepool_core::{
        BalanceStrategy, BalancerConfig, CacheConfig, MonitorConfig, PoolConfig, PoolHealth,
    };
    use tidepool_pool::MockDriver;

    use crate::ExecuteError;

    struct Harness {
        executor: Executor,
        cache: Arc<QueryCache>,
        monitor: Arc<PerformanceMonitor>,
        pools: Vec<(Pool, MockDriver)>,
    }

    async fn harness(ids: &[&str]) -> Harness {
        let group = Arc::new(PoolGroup::new());
        let mut pools = Vec::new();
        for id in ids {
            let driver = MockDriver::new();
            let cfg = PoolConfig {
                min_size: 2,
                max_size: 4,
                acquire_timeout: Duration::from_millis(500),
                ..PoolConfig::default()
            };
            let pool = Pool::connect(*id, format!("mock://{id}"), cfg, Arc::new(driver.clone())).await;
            group.register(pool.clone(), 1.0).unwrap();
            pools.push((pool, driver));
        }
        let balancer = Arc::new(LoadBalancer::new(
            group,
            &BalancerConfig {
                strategy: BalanceStrategy::RoundRobin,
                ..BalancerConfig::default()
            },
        ));
        let (monitor, _alerts) = PerformanceMonitor::new(MonitorConfig::default());
        let monitor = Arc::new(monitor);
        let cache = Arc::new(QueryCache::new(CacheConfig::default()));
        let executor = Executor::new(balancer, Arc::clone(&monitor)).with_cache(cache.clone());
        Harness {
            executor,
            cache,
            monitor,
            pools,
        }
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let h = harness(&["a"]).await;
        let driver = &h.pools[0].1;

        let first = h
            .executor
            .execute_with("SELECT * FROM users WHERE id = $1", &[json!(7)], ExecuteOptions::default())
            .await
            .unwrap();
        assert!(!first.from_cache);
        let second = h
            .executor
            .execute_with("SELECT *  FROM users WHERE id = $1", &[json!(7)], ExecuteOptions::default())
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(first.result, second.result);
        assert_eq!(driver.executes(), 1);
        assert_eq!(h.cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn writes_are_never_cached() {
        let h = harness(&["a"]).await;
        for _ in 0..2 {
            h.executor
                .execute("UPDATE users SET name = $1", &[json!("x")])
                .await
                .unwrap();
        }
        assert_eq!(h.pools[0].1.executes(), 2);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn tagged_results_can_be_invalidated_by_the_caller() {
        let h = harness(&["a"]).await;
        let opts = ExecuteOptions::tagged(["users"]);
        h.executor.execute_with("SELECT 1", &[], opts.clone()).await.unwrap();
        assert_eq!(h.cache.invalidate_by_tag("users"), 1);
        let again = h.executor.execute_with("SELECT 1", &[], opts).await.unwrap();
        assert!(!again.from_cache);
        assert_eq!(h.pools[0].1.executes(), 2);
    }

    #[tokio::test]
    async fn bypass_skips_the_cache() {
        let h = harness(&["a"]).await;
        let opts = ExecuteOptions {
            bypass_cache: true,
            ..ExecuteOptions::default()
        };
        h.executor.execute_with("SELECT 1", &[], opts.clone()).await.unwrap();
        h.executor.execute_with("SELECT 1", &[], opts).await.unwrap();
        assert_eq!(h.pools[0].1.executes(), 2);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn broken_connection_is_retried_once() {
        let h = harness(&["a"]).await;
        let (pool, driver) = &h.pools[0];
        driver.break_next_executes(1);

        let out = h.executor.execute("SELECT 1", &[]).await.unwrap();
        assert_eq!(out.rows.len(), 1);
        assert_eq!(pool.stats().destroyed, 1);
        assert_eq!(h.monitor.totals("a").errors, 1);
    }

    #[tokio::test]
    async fn second_broken_connection_propagates() {
        let h = harness(&["a"]).await;
        let (pool, driver) = &h.pools[0];
        driver.break_next_executes(2);

        let err = h.executor.execute("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Pool(PoolError::ConnectionBroken { .. })));
        assert!(err.is_retryable());
        assert_eq!(pool.stats().destroyed, 2);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn query_errors_are_recorded_and_not_retried() {
        let h = harness(&["a"]).await;
        let err = h.executor.execute("FAIL SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Pool(PoolError::Query { .. })));
        assert_eq!(h.pools[0].1.executes(), 1);
        assert_eq!(h.monitor.totals("a"), tidepool_metrics::PoolTotals { samples: 1, errors: 1 });
        assert!(h.executor.balancer().group().weight("a").unwrap() < 1.0);
    }

    #[tokio::test]
    async fn no_healthy_pool_is_not_retryable() {
        let h = harness(&["a"]).await;
        h.pools[0].0.set_health(PoolHealth::Unhealthy);
        let err = h.executor.execute("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Routing(_)));
        assert!(!err.is_retryable());
        assert_eq!(h.pools[0].1.executes(), 0);
    }

    #[tokio::test]
    async fn hint_pins_the_pool() {
        let h = harness(&["a", "b"]).await;
        for _ in 0..3 {
            let out = h
                .executor
                .execute_with(
                    "SELECT now()",
                    &[],
                    ExecuteOptions {
                        hint: SelectionHint::prefer("b"),
                        bypass_cache: true,
                        ..ExecuteOptions::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(out.pool_id, "b");
            assert_eq!(out.result.rows[0][1], json!("mock://b"));
        }
        assert_eq!(h.pools[0].1.executes(), 0);
    }

    #[tokio::test]
    async fn every_query_records_a_sample() {
        let h = harness(&["a"]).await;
        h.executor.execute("SELECT 1", &[]).await.unwrap();
        h.executor.execute("SELECT 2", &[]).await.unwrap();
        let window = h.monitor.window("a");
        assert_eq!(window.len(), 2);
        assert!(window.iter().all(|s| s.error_count == 0 && s.pool_id == "a"));
    }

    #[tokio::test]
    async fn sample_counts_the_connection_in_use() {
        let h = harness(&["a"]).await;
        h.executor.execute("SELECT 1", &[]).await.unwrap();
        let window = h.monitor.window("a");
        // One loan against a target of four.
        assert!((window[0].utilization - 0.25).abs() < f64::EPSILON);
        assert_eq!(h.pools[0].0.stats().active, 0);
    }

    #[tokio::test]
    async fn cancellation_mid_query_discards_the_connection() {
        let h = harness(&["a"]).await;
        let (pool, driver) = &h.pools[0];
        driver.set_query_delay(Duration::from_secs(5));
        let token = CancellationToken::new();
        let opts = ExecuteOptions {
            cancel: Some(token.clone()),
            ..ExecuteOptions::default()
        };

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = h.executor.execute_with("SELECT 1", &[], opts).await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, ExecuteError::Pool(PoolError::Cancelled { .. })));
        assert!(!err.is_retryable());
        assert_eq!(pool.stats().destroyed, 1);
        assert_eq!(pool.stats().active, 0);
    }
}
