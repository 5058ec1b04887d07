//! Pooled connections and the RAII loan handed to callers.

use std::time::Duration;

use tokio::time::Instant;

use tidepool_core::{QueryResult, Value};

use crate::driver::RawConnection;
use crate::error::{DriverError, PoolError, PoolResult};
use crate::pool::Pool;

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Active,
    Validating,
    Broken,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Active => write!(f, "active"),
            ConnectionState::Validating => write!(f, "validating"),
            ConnectionState::Broken => write!(f, "broken"),
        }
    }
}

/// A physical session plus tracking metadata. Owned by exactly one pool.
#[derive(Debug)]
pub struct Connection {
    pub(crate) id: u64,
    pub(crate) state: ConnectionState,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
    pub(crate) use_count: u64,
    pub(crate) raw: Box<dyn RawConnection>,
}

impl Connection {
    pub(crate) fn new(id: u64, raw: Box<dyn RawConnection>) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: ConnectionState::Idle,
            created_at: now,
            last_used_at: now,
            use_count: 0,
            raw,
        }
    }

    pub(crate) fn mark_active(&mut self) {
        self.state = ConnectionState::Active;
        self.last_used_at = Instant::now();
        self.use_count += 1;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = ConnectionState::Idle;
        self.last_used_at = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub(crate) fn lifetime_exceeded(&self, max: Duration) -> bool {
        !max.is_zero() && self.created_at.elapsed() >= max
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

/// A connection on loan to a single caller.
///
/// Dropping the loan releases the connection back to its pool; calling
/// [`release`](Self::release) does the same explicitly. Both consume the
/// loan, so a connection cannot be returned twice.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Pool,
}

impl PooledConnection {
    pub(crate) fn new(conn: Connection, pool: Pool) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// Run a statement on this connection.
    ///
    /// Transport failures mark the connection broken so it is destroyed on
    /// release instead of returning to the idle set.
    pub async fn execute(&mut self, query: &str, params: &[Value]) -> PoolResult<QueryResult> {
        let pool_id = self.pool.id().to_string();
        if self.pool.is_force_closed() {
            self.mark_broken();
            return Err(PoolError::PoolClosed { pool: pool_id });
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(PoolError::PoolClosed { pool: pool_id });
        };
        match conn.raw.execute(query, params).await {
            Ok(rows) => Ok(rows),
            Err(DriverError::Query(message)) => Err(PoolError::Query {
                pool: pool_id,
                message,
            }),
            Err(DriverError::Io(message)) | Err(DriverError::Connect(message)) => {
                conn.state = ConnectionState::Broken;
                tracing::debug!(
                    pool = %pool_id,
                    conn_id = conn.id,
                    error = %message,
                    "connection marked broken"
                );
                Err(PoolError::ConnectionBroken {
                    pool: pool_id,
                    message,
                })
            }
        }
    }

    /// Liveness check on the loaned connection; failures mark it broken.
    pub async fn ping(&mut self) -> PoolResult<()> {
        let pool_id = self.pool.id().to_string();
        let Some(conn) = self.conn.as_mut() else {
            return Err(PoolError::PoolClosed { pool: pool_id });
        };
        conn.raw.ping().await.map_err(|e| {
            conn.state = ConnectionState::Broken;
            PoolError::ConnectionBroken {
                pool: pool_id,
                message: e.to_string(),
            }
        })
    }

    /// Flag the connection as unusable; it is destroyed on release.
    pub fn mark_broken(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.state = ConnectionState::Broken;
        }
    }

    pub fn is_broken(&self) -> bool {
        self.conn
            .as_ref()
            .is_none_or(|c| c.state == ConnectionState::Broken)
    }

    pub fn id(&self) -> u64 {
        self.conn.as_ref().map(|c| c.id).unwrap_or_default()
    }

    pub fn use_count(&self) -> u64 {
        self.conn.as_ref().map(|c| c.use_count).unwrap_or_default()
    }

    pub fn created_at(&self) -> Option<Instant> {
        self.conn.as_ref().map(|c| c.created_at)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Return the connection to its pool.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}
