//! Subsystem assembly and lifecycle.
//!
//! ```text
//!            ┌──────────── PoolGroup ────────────┐
//!            │  pool per [[endpoints]] entry      │
//!            └──┬──────────┬──────────┬──────────┘
//!     LoadBalancer   HealthChecker   PoolSizer ◄── PerformanceMonitor ──► alert dispatcher
//!            │                                          ▲
//!         Executor ── QueryCache ◄── purge loop          │
//!            └──────────────── record ──────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tidepool_api::ApiState;
use tidepool_autoscale::PoolSizer;
use tidepool_balancer::{LoadBalancer, PoolGroup};
use tidepool_cache::QueryCache;
use tidepool_core::{Alert, QueryResult, TidepoolConfig};
use tidepool_executor::Executor;
use tidepool_health::HealthChecker;
use tidepool_metrics::{AlertSink, PerformanceMonitor, TracingAlertSink, dispatch_alerts};
use tidepool_pool::{DatabaseDriver, Pool};

/// Every subsystem, wired together.
pub struct Daemon {
    pub config: TidepoolConfig,
    pub group: Arc<PoolGroup>,
    pub cache: Arc<QueryCache>,
    pub executor: Arc<Executor>,
    pub health: Arc<HealthChecker>,
    pub sizer: Arc<PoolSizer>,
    alerts: Option<mpsc::Receiver<Alert>>,
}

impl Daemon {
    /// Build every subsystem and open one warmed-up pool per endpoint.
    pub async fn assemble(
        config: TidepoolConfig,
        driver: Arc<dyn DatabaseDriver>,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;

        let group = Arc::new(PoolGroup::new());
        for endpoint in &config.endpoints {
            let pool = Pool::connect(
                endpoint.id.clone(),
                endpoint.address.clone(),
                config.pool.clone(),
                Arc::clone(&driver),
            )
            .await;
            let stats = pool.stats();
            info!(
                pool = %endpoint.id,
                address = %endpoint.address,
                idle = stats.idle,
                min = stats.min_size,
                max = stats.max_size,
                "pool opened"
            );
            group
                .register(pool, endpoint.weight)
                .with_context(|| format!("registering pool {}", endpoint.id))?;
        }

        let balancer = Arc::new(LoadBalancer::new(Arc::clone(&group), &config.balancer));
        let (monitor, alerts) = PerformanceMonitor::new(config.monitor.clone());
        let monitor = Arc::new(monitor);
        let cache = Arc::new(QueryCache::<QueryResult>::new(config.cache.clone()));
        let executor = Arc::new(
            Executor::new(Arc::clone(&balancer), Arc::clone(&monitor)).with_cache(cache.clone()),
        );
        let health = Arc::new(HealthChecker::new(Arc::clone(&group), config.health.clone()));
        let sizer = Arc::new(PoolSizer::new(Arc::clone(&group), Arc::clone(&monitor)));

        info!(
            pools = group.len(),
            strategy = balancer.strategy_name(),
            cache = config.cache.enabled,
            "subsystems initialized"
        );

        Ok(Self {
            config,
            group,
            cache,
            executor,
            health,
            sizer,
            alerts: Some(alerts),
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            executor: Arc::clone(&self.executor),
            cache: Some(Arc::clone(&self.cache)),
        }
    }

    /// Start the health, sizer, cache purge, and alert dispatch loops.
    /// Each stops when `shutdown` flips.
    pub fn spawn_background(&mut self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let health = Arc::clone(&self.health);
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { health.run(rx).await }));

        let sizer = Arc::clone(&self.sizer);
        let interval = self.config.sizer.interval;
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { sizer.run(interval, rx).await }));

        let cache = Arc::clone(&self.cache);
        let purge_every = purge_interval(self.config.cache.default_ttl);
        let rx = shutdown.clone();
        handles.push(tokio::spawn(run_cache_purge(cache, purge_every, rx)));

        if let Some(alerts) = self.alerts.take() {
            let sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(TracingAlertSink)];
            handles.push(tokio::spawn(dispatch_alerts(alerts, sinks, shutdown)));
        }
        handles
    }

    /// Close every pool, waiting up to `shutdown_grace` for loans to return.
    pub async fn close_pools(&self) {
        for pool in self.group.pools() {
            let remaining = pool.close().await;
            if remaining > 0 {
                warn!(pool = %pool.id(), remaining, "pool force-closed with connections on loan");
            } else {
                debug!(pool = %pool.id(), "pool closed");
            }
        }
    }
}

/// Sweep often enough that expired entries do not linger much past their
/// TTL, but no more than once a second.
fn purge_interval(default_ttl: Duration) -> Duration {
    default_ttl.max(Duration::from_secs(1))
}

async fn run_cache_purge(
    cache: Arc<QueryCache>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval = ?interval, "cache purge loop started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, entries = cache.len(), "expired cache entries purged");
                }
            }
            _ = shutdown.changed() => {
                info!("cache purge loop stopping");
                break;
            }
        }
    }
}

/// Run the daemon until Ctrl-C.
pub async fn run(
    config: TidepoolConfig,
    listen: String,
    driver: Arc<dyn DatabaseDriver>,
) -> anyhow::Result<()> {
    info!(endpoints = config.endpoints.len(), "tidepool daemon starting");
    let mut daemon = Daemon::assemble(config, driver).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = daemon.spawn_background(shutdown_rx);

    let router = tidepool_api::build_router(daemon.api_state());
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(addr = %listen, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("API server failed")?;

    for handle in handles {
        let _ = handle.await;
    }
    daemon.close_pools().await;

    info!("tidepool daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_core::{EndpointConfig, PoolHealth};
    use tidepool_pool::MockDriver;

    fn config() -> TidepoolConfig {
        let mut config = TidepoolConfig::default();
        config.health.interval = Duration::from_millis(20);
        config.sizer.interval = Duration::from_millis(20);
        config.endpoints = vec![
            EndpointConfig {
                id: "primary".into(),
                address: "mock://primary".into(),
                weight: 1.0,
            },
            EndpointConfig {
                id: "replica".into(),
                address: "mock://replica".into(),
                weight: 0.5,
            },
        ];
        config
    }

    #[tokio::test]
    async fn assemble_opens_every_endpoint() {
        let driver = MockDriver::new();
        let daemon = Daemon::assemble(config(), Arc::new(driver.clone())).await.unwrap();
        assert_eq!(daemon.group.len(), 2);
        assert_eq!(daemon.group.weight("replica"), Some(0.5));
        assert_eq!(driver.connects(), 4);

        let out = daemon.executor.execute("SELECT 1", &[]).await.unwrap();
        assert_eq!(out.rows.len(), 1);
    }

    #[tokio::test]
    async fn assemble_rejects_invalid_config() {
        let mut cfg = config();
        cfg.endpoints.clear();
        assert!(Daemon::assemble(cfg, Arc::new(MockDriver::new())).await.is_err());
    }

    #[tokio::test]
    async fn background_loops_run_and_stop() {
        let driver = MockDriver::new();
        let mut daemon = Daemon::assemble(config(), Arc::new(driver.clone())).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let handles = daemon.spawn_background(rx);
        assert_eq!(handles.len(), 4);

        driver.set_fail_ping(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            daemon
                .group
                .pools()
                .iter()
                .all(|p| p.health() == PoolHealth::Unhealthy)
        );

        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("loop should stop")
                .unwrap();
        }
        daemon.close_pools().await;
        assert!(daemon.group.pools().iter().all(|p| p.is_closed()));
    }

    #[test]
    fn purge_interval_has_a_floor() {
        assert_eq!(purge_interval(Duration::from_millis(10)), Duration::from_secs(1));
        assert_eq!(purge_interval(Duration::from_secs(30)), Duration::from_secs(30));
    }
}
