//! In-memory driver with failure injection.
//!
//! Executes echo the statement back as a single row, so callers can tell
//! which endpoint served a query:
//!
//! ```text
//! columns: ["query", "endpoint", "params"]
//! rows:    [["SELECT 1", "mock://primary", []]]
//! ```
//!
//! Statements starting with `FAIL` return a query error without breaking
//! the connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use tidepool_core::{QueryResult, Value};

use crate::driver::{DatabaseDriver, RawConnection};
use crate::error::DriverError;

/// Knobs shared by a [`MockDriver`] and every connection it opened.
#[derive(Debug, Default)]
pub struct MockControls {
    pub fail_connect: AtomicBool,
    pub fail_ping: AtomicBool,
    /// Upcoming executes that fail with an I/O error.
    pub broken_executes: AtomicU32,
    pub connect_delay_ms: AtomicU64,
    pub query_delay_ms: AtomicU64,
    pub connects: AtomicU64,
    pub closes: AtomicU64,
    pub executes: AtomicU64,
    pub pings: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    controls: Arc<MockControls>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controls(&self) -> Arc<MockControls> {
        Arc::clone(&self.controls)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.controls.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.controls.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn break_next_executes(&self, n: u32) {
        self.controls.broken_executes.store(n, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.controls
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_query_delay(&self, delay: Duration) {
        self.controls
            .query_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u64 {
        self.controls.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.controls.closes.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> u64 {
        self.controls.executes.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> u64 {
        self.controls.pings.load(Ordering::SeqCst)
    }
}

async fn pause(ms: &AtomicU64) {
    let ms = ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl DatabaseDriver for MockDriver {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn RawConnection>, DriverError> {
        pause(&self.controls.connect_delay_ms).await;
        if self.controls.fail_connect.load(Ordering::SeqCst) {
            return Err(DriverError::Connect(format!("{endpoint}: connection refused")));
        }
        self.controls.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            controls: Arc::clone(&self.controls),
            endpoint: endpoint.to_string(),
        }))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[derive(Debug)]
pub struct MockConnection {
    controls: Arc<MockControls>,
    endpoint: String,
}

#[async_trait]
impl RawConnection for MockConnection {
    async fn execute(&mut self, query: &str, params: &[Value]) -> Result<QueryResult, DriverError> {
        pause(&self.controls.query_delay_ms).await;
        self.controls.executes.fetch_add(1, Ordering::SeqCst);
        let broken = self
            .controls
            .broken_executes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if broken {
            return Err(DriverError::Io("connection reset by peer".into()));
        }
        if query.trim_start().starts_with("FAIL") {
            return Err(DriverError::Query(format!("syntax error near {query:?}")));
        }
        Ok(QueryResult {
            columns: vec!["query".into(), "endpoint".into(), "params".into()],
            rows: vec![vec![json!(query), json!(self.endpoint), Value::Array(params.to_vec())]],
            rows_affected: 0,
        })
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        self.controls.pings.fetch_add(1, Ordering::SeqCst);
        if self.controls.fail_ping.load(Ordering::SeqCst) {
            return Err(DriverError::Io("ping failed".into()));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.controls.closes.fetch_add(1, Ordering::SeqCst);
    }
}
