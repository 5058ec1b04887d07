//! End-to-end scenarios across the pool, balancer, cache, health checker,
//! sizer, and HTTP API, wired the way the daemon wires them.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use tidepool_api::{ApiState, build_router};
use tidepool_autoscale::PoolSizer;
use tidepool_balancer::{LoadBalancer, PoolGroup};
use tidepool_cache::QueryCache;
use tidepool_core::{
    BalanceStrategy, BalancerConfig, CacheConfig, HealthConfig, MetricSample, MonitorConfig,
    PoolConfig, PoolHealth,
};
use tidepool_executor::{ExecuteOptions, Executor};
use tidepool_health::HealthChecker;
use tidepool_metrics::PerformanceMonitor;
use tidepool_pool::{MockDriver, Pool, PoolError};

struct Stack {
    group: Arc<PoolGroup>,
    monitor: Arc<PerformanceMonitor>,
    cache: Arc<QueryCache>,
    executor: Arc<Executor>,
    drivers: Vec<MockDriver>,
}

async fn stack(ids: &[&str], pool: PoolConfig) -> Stack {
    let group = Arc::new(PoolGroup::new());
    let mut drivers = Vec::new();
    for id in ids {
        let driver = MockDriver::new();
        let p = Pool::connect(*id, format!("mock://{id}"), pool.clone(), Arc::new(driver.clone())).await;
        group.register(p, 1.0).unwrap();
        drivers.push(driver);
    }
    let balancer = Arc::new(LoadBalancer::new(
        Arc::clone(&group),
        &BalancerConfig {
            strategy: BalanceStrategy::RoundRobin,
            ..BalancerConfig::default()
        },
    ));
    let (monitor, _alerts) = PerformanceMonitor::new(MonitorConfig::default());
    let monitor = Arc::new(monitor);
    let cache = Arc::new(QueryCache::new(CacheConfig::default()));
    let executor = Arc::new(
        Executor::new(balancer, Arc::clone(&monitor)).with_cache(cache.clone()),
    );
    Stack {
        group,
        monitor,
        cache,
        executor,
        drivers,
    }
}

fn no_cache() -> ExecuteOptions {
    ExecuteOptions {
        bypass_cache: true,
        ..ExecuteOptions::default()
    }
}

#[tokio::test]
async fn bounded_pool_serves_five_then_blocks_the_sixth() {
    let cfg = PoolConfig {
        min_size: 2,
        max_size: 5,
        acquire_timeout: Duration::from_secs(2),
        ..PoolConfig::default()
    };
    let driver = MockDriver::new();
    let pool = Pool::connect("primary", "mock://primary", cfg, Arc::new(driver.clone())).await;
    assert_eq!(driver.connects(), 2);

    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(pool.acquire().await.unwrap());
    }
    assert_eq!(driver.connects(), 5);
    assert_eq!(pool.stats().active, 5);

    let sixth = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|c| c.id()) }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!sixth.is_finished());
    assert_eq!(pool.waiting(), 1);

    let released = held.remove(0);
    let released_id = released.id();
    released.release();
    let got = tokio::time::timeout(Duration::from_secs(1), sixth)
        .await
        .expect("sixth acquire should complete")
        .unwrap()
        .unwrap();
    assert_eq!(got, released_id);
    assert_eq!(driver.connects(), 5);
}

#[tokio::test]
async fn sizer_grows_pool_after_three_busy_windows() {
    let cfg = PoolConfig {
        min_size: 2,
        max_size: 7,
        initial_size: Some(4),
        grow_threshold: 0.8,
        grow_step: 2,
        sustain_windows: 3,
        ..PoolConfig::default()
    };
    let s = stack(&["primary"], cfg).await;
    let sizer = PoolSizer::new(Arc::clone(&s.group), Arc::clone(&s.monitor));
    let pool = s.group.get("primary").unwrap();

    for _ in 0..3 {
        for _ in 0..10 {
            s.monitor.record(MetricSample {
                utilization: 0.95,
                acquire_latency_ms: 400.0,
                ..MetricSample::new("primary")
            });
        }
        sizer.evaluate_all();
    }
    assert_eq!(pool.target_size(), 6);
    let stats = pool.stats();
    assert!(stats.min_size <= stats.target && stats.target <= stats.max_size);
}

#[tokio::test]
async fn failed_validations_take_pool_out_of_rotation_until_recovery() {
    let cfg = PoolConfig {
        min_size: 3,
        max_size: 5,
        ..PoolConfig::default()
    };
    let s = stack(&["a", "b"], cfg).await;
    let checker = HealthChecker::new(
        Arc::clone(&s.group),
        HealthConfig {
            validation_batch: 3,
            min_validations: 3,
            recovery_successes: 3,
            ..HealthConfig::default()
        },
    );

    s.drivers[0].set_fail_ping(true);
    checker.check_all().await;
    let a = s.group.get("a").unwrap();
    assert_eq!(a.health(), PoolHealth::Unhealthy);

    for _ in 0..10 {
        let out = s.executor.execute_with("SELECT 1", &[], no_cache()).await.unwrap();
        assert_eq!(out.pool_id, "b");
    }
    assert_eq!(s.drivers[0].executes(), 0);

    s.drivers[0].set_fail_ping(false);
    for _ in 0..3 {
        checker.check_all().await;
    }
    assert_eq!(a.health(), PoolHealth::Healthy);
    let mut served = Vec::new();
    for _ in 0..4 {
        served.push(s.executor.execute_with("SELECT 1", &[], no_cache()).await.unwrap().pool_id);
    }
    assert!(served.iter().any(|id| id == "a"));
}

#[tokio::test]
async fn cached_result_expires_after_ttl() {
    let s = stack(&["primary"], PoolConfig::default()).await;
    let opts = ExecuteOptions {
        ttl: Some(Duration::from_millis(100)),
        ..ExecuteOptions::default()
    };

    s.executor.execute_with("SELECT 42", &[], opts.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let hit = s.executor.execute_with("SELECT 42", &[], opts.clone()).await.unwrap();
    assert!(hit.from_cache);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let miss = s.executor.execute_with("SELECT 42", &[], opts).await.unwrap();
    assert!(!miss.from_cache);
    assert_eq!(s.drivers[0].executes(), 2);
    assert_eq!(s.cache.stats().expirations, 1);
}

#[tokio::test]
async fn closing_pool_fails_waiters_and_executes() {
    let cfg = PoolConfig {
        min_size: 1,
        max_size: 1,
        acquire_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    };
    let s = stack(&["primary"], cfg).await;
    let pool = s.group.get("primary").unwrap();
    let held = pool.acquire().await.unwrap();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|c| c.id()) }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let closing = tokio::spawn({
        let pool = pool.clone();
        async move { pool.close_with_grace(Duration::from_millis(200)).await }
    });

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, PoolError::PoolClosed { .. }));
    held.release();
    assert_eq!(closing.await.unwrap(), 0);
    assert!(s.executor.execute("SELECT 1", &[]).await.is_err());
}

#[tokio::test]
async fn http_query_and_metrics_share_state() {
    let s = stack(&["primary"], PoolConfig::default()).await;
    let router = build_router(ApiState {
        executor: Arc::clone(&s.executor),
        cache: Some(Arc::clone(&s.cache)),
    });

    for _ in 0..2 {
        let req = Request::builder()
            .method("POST")
            .uri("/query")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "query": "SELECT 1" }).to_string()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = router
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("tidepool_cache_hits_total 1"));
    assert!(text.contains("tidepool_cache_misses_total 1"));
}
