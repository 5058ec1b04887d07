//! Outbound sinks for samples and alerts.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tidepool_core::{Alert, MetricSample};

/// Receives every recorded sample. Called on the request path, so
/// implementations must not block; errors are logged and dropped.
pub trait MetricsSink: Send + Sync {
    fn name(&self) -> &str {
        "metrics-sink"
    }

    fn emit(&self, sample: &MetricSample) -> anyhow::Result<()>;
}

/// Receives alerts from the dispatcher task, off the request path.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str {
        "alert-sink"
    }

    async fn notify(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Logs each alert as a warning.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        warn!(
            kind = %alert.kind,
            pool = %alert.pool_id,
            observed = alert.observed,
            threshold = alert.threshold,
            "performance alert"
        );
        Ok(())
    }
}

/// Forward queued alerts to every sink until the queue closes or shutdown
/// is signalled. A failing sink never stops delivery to the others.
pub async fn dispatch_alerts(
    mut alerts: mpsc::Receiver<Alert>,
    sinks: Vec<Arc<dyn AlertSink>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(sinks = sinks.len(), "alert dispatcher started");
    loop {
        tokio::select! {
            next = alerts.recv() => {
                let Some(alert) = next else {
                    debug!("alert queue closed");
                    break;
                };
                for sink in &sinks {
                    if let Err(e) = sink.notify(&alert).await {
                        warn!(sink = sink.name(), error = %e, "alert sink failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("alert dispatcher shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tidepool_core::AlertKind;

    struct Collect(Arc<Mutex<Vec<Alert>>>);

    #[async_trait]
    impl AlertSink for Collect {
        async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
            self.0.lock().push(alert.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl AlertSink for Broken {
        async fn notify(&self, _alert: &Alert) -> anyhow::Result<()> {
            anyhow::bail!("webhook unreachable")
        }
    }

    fn alert() -> Alert {
        Alert {
            kind: AlertKind::QueueBacklog,
            pool_id: "replica-1".into(),
            observed: 12.0,
            threshold: 10.0,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sinks: Vec<Arc<dyn AlertSink>> = vec![
            Arc::new(Broken),
            Arc::new(Collect(Arc::clone(&seen))),
            Arc::new(TracingAlertSink),
        ];
        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(dispatch_alerts(rx, sinks, shutdown_rx));

        tx.send(alert()).await.unwrap();
        tx.send(alert()).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let (_tx, rx) = mpsc::channel::<Alert>(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(dispatch_alerts(rx, Vec::new(), shutdown_rx));
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
