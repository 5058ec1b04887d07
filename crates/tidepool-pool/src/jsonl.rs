//! Line-delimited JSON driver over TCP.
//!
//! A minimal wire protocol used by `tidepoold` and the integration tests.
//! Each request is one JSON object per line; each response is one line
//! holding either a result or an error.
//!
//! ```text
//! client → {"query":"SELECT 1","params":[]}\n
//! server ← {"columns":["?column?"],"rows":[[1]],"rows_affected":0}\n
//!      or ← {"error":"relation \"users\" does not exist"}\n
//! ```
//!
//! A closed socket or malformed line is an I/O error and breaks the
//! connection; an `error` response is a query error and does not.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use tidepool_core::{DriverConfig, QueryResult, Value};

use crate::driver::{DatabaseDriver, RawConnection};
use crate::error::DriverError;

// ── Driver ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct JsonLinesDriver {
    connect_timeout: Duration,
    validation_query: String,
}

impl JsonLinesDriver {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            validation_query: config.validation_query.clone(),
        }
    }
}

impl Default for JsonLinesDriver {
    fn default() -> Self {
        Self::new(&DriverConfig::default())
    }
}

#[async_trait]
impl DatabaseDriver for JsonLinesDriver {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn RawConnection>, DriverError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| {
                DriverError::Connect(format!(
                    "{endpoint}: timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| DriverError::Connect(format!("{endpoint}: {e}")))?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Ok(Box::new(JsonLinesConnection {
            endpoint: endpoint.to_string(),
            reader: BufReader::new(read),
            writer: write,
            validation_query: self.validation_query.clone(),
            line: String::new(),
        }))
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

// ── Connection ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct Request<'a> {
    query: &'a str,
    params: &'a [Value],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Response {
    Error { error: String },
    Rows(QueryResult),
}

pub struct JsonLinesConnection {
    endpoint: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    validation_query: String,
    line: String,
}

impl std::fmt::Debug for JsonLinesConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesConnection")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl JsonLinesConnection {
    async fn round_trip(&mut self, query: &str, params: &[Value]) -> Result<QueryResult, DriverError> {
        let mut frame = serde_json::to_vec(&Request { query, params })
            .map_err(|e| DriverError::Query(format!("encode request: {e}")))?;
        frame.push(b'\n');
        self.writer
            .write_all(&frame)
            .await
            .map_err(|e| DriverError::Io(format!("{}: write: {e}", self.endpoint)))?;

        self.line.clear();
        let n = self
            .reader
            .read_line(&mut self.line)
            .await
            .map_err(|e| DriverError::Io(format!("{}: read: {e}", self.endpoint)))?;
        if n == 0 {
            return Err(DriverError::Io(format!("{}: connection closed", self.endpoint)));
        }
        match serde_json::from_str::<Response>(self.line.trim_end()) {
            Ok(Response::Rows(rows)) => Ok(rows),
            Ok(Response::Error { error }) => Err(DriverError::Query(error)),
            Err(e) => Err(DriverError::Io(format!("{}: bad response: {e}", self.endpoint))),
        }
    }
}

#[async_trait]
impl RawConnection for JsonLinesConnection {
    async fn execute(&mut self, query: &str, params: &[Value]) -> Result<QueryResult, DriverError> {
        self.round_trip(query, params).await
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        let query = std::mem::take(&mut self.validation_query);
        let result = self.round_trip(&query, &[]).await;
        self.validation_query = query;
        result.map(|_| ())
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Serve one connection: echo the query back, or fail on `FAIL`, or hang
    /// up on `QUIT`.
    async fn fake_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                let query = req["query"].as_str().unwrap_or_default().to_string();
                let reply = if query == "QUIT" {
                    break;
                } else if query.starts_with("FAIL") {
                    json!({ "error": "syntax error" })
                } else {
                    json!({ "columns": ["q"], "rows": [[query]], "rows_affected": 0 })
                };
                let mut out = reply.to_string();
                out.push('\n');
                write.write_all(out.as_bytes()).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn executes_and_parses_rows() {
        let addr = fake_server().await;
        let mut conn = JsonLinesDriver::default().connect(&addr).await.unwrap();
        let result = conn.execute("SELECT 1", &[json!(7)]).await.unwrap();
        assert_eq!(result.columns, vec!["q".to_string()]);
        assert_eq!(result.rows, vec![vec![json!("SELECT 1")]]);
        conn.ping().await.unwrap();
    }

    #[tokio::test]
    async fn error_line_is_a_query_error() {
        let addr = fake_server().await;
        let mut conn = JsonLinesDriver::default().connect(&addr).await.unwrap();
        let err = conn.execute("FAIL me", &[]).await.unwrap_err();
        assert_eq!(err, DriverError::Query("syntax error".into()));
        // Still usable afterwards.
        assert!(conn.execute("SELECT 2", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn hangup_is_an_io_error() {
        let addr = fake_server().await;
        let mut conn = JsonLinesDriver::default().connect(&addr).await.unwrap();
        let err = conn.execute("QUIT", &[]).await.unwrap_err();
        assert!(matches!(err, DriverError::Io(_)));
    }

    #[tokio::test]
    async fn refused_connect_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = JsonLinesDriver::default().connect(&addr).await.unwrap_err();
        assert!(matches!(err, DriverError::Connect(_)));
    }
}
