//! Performance monitor: per-pool sample windows, aggregates, and alerts.
//!
//! Each pool keeps a bounded ring of its most recent samples plus running
//! sums, so recording and whole-window aggregates are O(1). Threshold checks run on
//! every record; breaches are queued with `try_send` and delivered by
//! [`dispatch_alerts`](crate::dispatch_alerts), so a slow or failing sink
//! never delays a request.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tidepool_core::{Alert, AlertKind, MetricSample, MonitorConfig, PoolId, epoch_millis};

use crate::sink::MetricsSink;

const DEFAULT_ALERT_QUEUE: usize = 256;

/// Error rates over fewer samples than this are too noisy to alert on.
const MIN_SAMPLES_FOR_ERROR_RATE: usize = 10;

/// Derived view of a pool's recent samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolAggregate {
    pub pool_id: PoolId,
    pub samples: usize,
    pub avg_acquire_ms: f64,
    pub avg_query_ms: f64,
    pub avg_utilization: f64,
    pub error_rate: f64,
}

#[derive(Default)]
struct Sums {
    acquire_ms: f64,
    query_ms: f64,
    utilization: f64,
    errors: u64,
}

impl Sums {
    fn add(&mut self, s: &MetricSample) {
        self.acquire_ms += s.acquire_latency_ms;
        self.query_ms += s.query_latency_ms;
        self.utilization += s.utilization;
        self.errors += u64::from(s.error_count);
    }

    fn sub(&mut self, s: &MetricSample) {
        self.acquire_ms -= s.acquire_latency_ms;
        self.query_ms -= s.query_latency_ms;
        self.utilization -= s.utilization;
        self.errors -= u64::from(s.error_count);
    }
}

struct PoolWindow {
    samples: VecDeque<(u64, MetricSample)>,
    sums: Sums,
    recorded: u64,
    errors: u64,
}

impl PoolWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            sums: Sums::default(),
            recorded: 0,
            errors: 0,
        }
    }

    fn aggregate(&self, pool_id: &str) -> Option<PoolAggregate> {
        let n = self.samples.len();
        if n == 0 {
            return None;
        }
        let count = n as f64;
        Some(PoolAggregate {
            pool_id: pool_id.to_string(),
            samples: n,
            avg_acquire_ms: self.sums.acquire_ms.max(0.0) / count,
            avg_query_ms: self.sums.query_ms.max(0.0) / count,
            avg_utilization: self.sums.utilization.max(0.0) / count,
            error_rate: self.sums.errors as f64 / count,
        })
    }
}

/// Lifetime counters per pool, for counter-type exposition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolTotals {
    pub samples: u64,
    pub errors: u64,
}

pub struct PerformanceMonitor {
    config: MonitorConfig,
    windows: Mutex<HashMap<PoolId, PoolWindow>>,
    sinks: RwLock<Vec<Arc<dyn MetricsSink>>>,
    alerts: mpsc::Sender<Alert>,
    last_alert: Mutex<HashMap<(PoolId, AlertKind), Instant>>,
    next_seq: AtomicU64,
    alerts_dropped: AtomicU64,
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("pools", &self.windows.lock().len())
            .field("sinks", &self.sinks.read().len())
            .finish_non_exhaustive()
    }
}

impl PerformanceMonitor {
    /// Create a monitor and the receiving end of its alert queue.
    pub fn new(config: MonitorConfig) -> (Self, mpsc::Receiver<Alert>) {
        Self::with_alert_capacity(config, DEFAULT_ALERT_QUEUE)
    }

    pub fn with_alert_capacity(
        config: MonitorConfig,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let monitor = Self {
            config,
            windows: Mutex::new(HashMap::new()),
            sinks: RwLock::new(Vec::new()),
            alerts: tx,
            last_alert: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            alerts_dropped: AtomicU64::new(0),
        };
        (monitor, rx)
    }

    pub fn add_sink(&self, sink: Arc<dyn MetricsSink>) {
        self.sinks.write().push(sink);
    }

    /// Record one sample and check it against the alert thresholds.
    pub fn record(&self, sample: MetricSample) {
        for sink in self.sinks.read().iter() {
            if let Err(e) = sink.emit(&sample) {
                debug!(sink = sink.name(), error = %e, "metrics sink failed");
            }
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let aggregate = {
            let mut windows = self.windows.lock();
            let window = windows
                .entry(sample.pool_id.clone())
                .or_insert_with(|| PoolWindow::new(self.config.window_size));
            window.recorded += 1;
            window.errors += u64::from(sample.error_count);
            window.sums.add(&sample);
            window.samples.push_back((seq, sample.clone()));
            while window.samples.len() > self.config.window_size.max(1) {
                if let Some((_, old)) = window.samples.pop_front() {
                    window.sums.sub(&old);
                }
            }
            window.aggregate(&sample.pool_id)
        };

        if let Some(aggregate) = aggregate {
            self.check_thresholds(&aggregate, &sample);
        }
    }

    /// Aggregate over the current window.
    pub fn aggregate(&self, pool_id: &str) -> Option<PoolAggregate> {
        self.windows.lock().get(pool_id)?.aggregate(pool_id)
    }

    /// Aggregate over samples recorded after `cursor`, returning the cursor
    /// to pass next time. `None` when nothing new arrived.
    pub fn aggregate_since(&self, pool_id: &str, cursor: u64) -> Option<(PoolAggregate, u64)> {
        let windows = self.windows.lock();
        let window = windows.get(pool_id)?;
        let mut sums = Sums::default();
        let mut count = 0usize;
        let mut last = cursor;
        for (seq, sample) in window.samples.iter().rev() {
            if *seq <= cursor {
                break;
            }
            sums.add(sample);
            count += 1;
            last = last.max(*seq);
        }
        if count == 0 {
            return None;
        }
        let n = count as f64;
        Some((
            PoolAggregate {
                pool_id: pool_id.to_string(),
                samples: count,
                avg_acquire_ms: sums.acquire_ms / n,
                avg_query_ms: sums.query_ms / n,
                avg_utilization: sums.utilization / n,
                error_rate: sums.errors as f64 / n,
            },
            last,
        ))
    }

    /// Aggregates for every pool with samples, sorted by pool id.
    pub fn aggregates(&self) -> Vec<PoolAggregate> {
        let windows = self.windows.lock();
        let mut out: Vec<PoolAggregate> = windows
            .iter()
            .filter_map(|(id, w)| w.aggregate(id))
            .collect();
        out.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        out
    }

    pub fn totals(&self, pool_id: &str) -> PoolTotals {
        self.windows
            .lock()
            .get(pool_id)
            .map(|w| PoolTotals {
                samples: w.recorded,
                errors: w.errors,
            })
            .unwrap_or_default()
    }

    /// Samples currently held for `pool_id`, oldest first.
    pub fn window(&self, pool_id: &str) -> Vec<MetricSample> {
        self.windows
            .lock()
            .get(pool_id)
            .map(|w| w.samples.iter().map(|(_, s)| s.clone()).collect())
            .unwrap_or_default()
    }

    /// Alerts discarded because the queue was full.
    pub fn alerts_dropped(&self) -> u64 {
        self.alerts_dropped.load(Ordering::Relaxed)
    }

    fn check_thresholds(&self, agg: &PoolAggregate, latest: &MetricSample) {
        let cfg = &self.config;
        if agg.avg_utilization > cfg.utilization_alert {
            self.raise(AlertKind::HighUtilization, &agg.pool_id, agg.avg_utilization, cfg.utilization_alert);
        }
        if agg.avg_acquire_ms > cfg.acquire_latency_alert_ms {
            self.raise(AlertKind::SlowAcquire, &agg.pool_id, agg.avg_acquire_ms, cfg.acquire_latency_alert_ms);
        }
        if latest.queue_length > cfg.queue_length_alert {
            self.raise(
                AlertKind::QueueBacklog,
                &agg.pool_id,
                latest.queue_length as f64,
                cfg.queue_length_alert as f64,
            );
        }
        if agg.samples >= MIN_SAMPLES_FOR_ERROR_RATE && agg.error_rate > cfg.error_rate_alert {
            self.raise(AlertKind::HighErrorRate, &agg.pool_id, agg.error_rate, cfg.error_rate_alert);
        }
    }

    fn raise(&self, kind: AlertKind, pool_id: &str, observed: f64, threshold: f64) {
        let now = Instant::now();
        {
            let mut last = self.last_alert.lock();
            let key = (pool_id.to_string(), kind);
            if let Some(at) = last.get(&key)
                && now.duration_since(*at) < self.config.alert_cooldown
            {
                return;
            }
            last.insert(key, now);
        }

        let alert = Alert {
            kind,
            pool_id: pool_id.to_string(),
            observed,
            threshold,
            timestamp: epoch_millis(),
        };
        if let Err(e) = self.alerts.try_send(alert) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    self.alerts_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(pool = %pool_id, %kind, "alert queue full, alert dropped");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!(pool = %pool_id, %kind, "alert queue closed");
                }
            }
        }
    }
}
