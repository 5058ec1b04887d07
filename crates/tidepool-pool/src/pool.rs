//! Adaptive connection pool for a single database endpoint.
//!
//! A [`Pool`] owns every connection it creates. Callers borrow one through
//! [`Pool::acquire`] and get a [`PooledConnection`] back; dropping or
//! releasing that loan checks the connection back in.
//!
//! ```text
//!  acquire ──► idle (LIFO) ──hit──► PooledConnection ──drop──► checkin
//!     │                                                          │
//!     ├─ total < target ─► create (bounded by create permits)    │
//!     │                                                          ▼
//!     └─ otherwise ─► FIFO waiter ◄──────── hand-off ──── oldest waiter
//!                                                              or idle
//! ```
//!
//! Accounting lives under a single lock: `idle + active + validating +
//! creating` never exceeds the current target, and every waiter in the
//! queue is a caller that is still waiting. A connection returned while
//! callers are queued goes straight to the oldest waiter, so later arrivals
//! cannot overtake it.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tidepool_core::{PoolConfig, PoolHealth, PoolId};

use crate::connection::{Connection, ConnectionState, PooledConnection};
use crate::driver::DatabaseDriver;
use crate::error::{DriverError, PoolError, PoolResult};

/// Pause before a failed background create retries for queued callers.
const CREATE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Per-call overrides for [`Pool::acquire_with`].
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Absolute deadline; defaults to now + `acquire_timeout`.
    pub deadline: Option<Instant>,
    /// Aborts the wait when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl AcquireOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(deadline_after(Instant::now(), timeout)),
            cancel: None,
        }
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Point-in-time view of a pool's accounting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub id: PoolId,
    pub health: PoolHealth,
    pub active: usize,
    pub idle: usize,
    pub validating: usize,
    pub creating: usize,
    pub total: usize,
    pub target: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub waiting: usize,
    pub wait_count: u64,
    pub created: u64,
    pub destroyed: u64,
    pub creation_failures: u64,
}

impl PoolStats {
    /// Active connections over the current target.
    pub fn utilization(&self) -> f64 {
        if self.target == 0 {
            return 0.0;
        }
        self.active as f64 / self.target as f64
    }
}

/// Outcome of one [`Pool::validate_idle`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub checked: usize,
    pub failed: usize,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Connection>,
}

struct PoolState {
    /// Most recently used at the back.
    idle: VecDeque<Connection>,
    active: HashSet<u64>,
    validating: usize,
    creating: usize,
    target: usize,
    waiters: VecDeque<Waiter>,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.outstanding()
    }

    /// Connections not sitting in the idle set.
    fn outstanding(&self) -> usize {
        self.active.len() + self.validating + self.creating
    }
}

struct PoolInner {
    id: PoolId,
    endpoint: String,
    config: PoolConfig,
    driver: Arc<dyn DatabaseDriver>,
    state: Mutex<PoolState>,
    create_permits: Semaphore,
    health: AtomicU8,
    closed: AtomicBool,
    force_closed: AtomicBool,
    drained: Notify,
    next_conn_id: AtomicU64,
    next_waiter_id: AtomicU64,
    failure_streak: AtomicU32,
    created: AtomicU64,
    destroyed: AtomicU64,
    creation_failures: AtomicU64,
    wait_count: AtomicU64,
}

/// Cheaply cloneable handle to a connection pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("driver", &self.inner.driver.name())
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

enum Step {
    Ready(Connection),
    Create,
    Wait(u64, oneshot::Receiver<Connection>),
    Exhausted,
}

enum Interrupt {
    Timeout,
    Cancelled,
}

impl Pool {
    /// Build an empty pool. Call [`warm_up`](Self::warm_up) (or use
    /// [`connect`](Self::connect)) to open the first `min_size` connections.
    pub fn new(
        id: impl Into<PoolId>,
        endpoint: impl Into<String>,
        config: PoolConfig,
        driver: Arc<dyn DatabaseDriver>,
    ) -> Self {
        let target = config.initial_target();
        let permits = config.max_concurrent_creates.max(1);
        Self {
            inner: Arc::new(PoolInner {
                id: id.into(),
                endpoint: endpoint.into(),
                driver,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    active: HashSet::new(),
                    validating: 0,
                    creating: 0,
                    target,
                    waiters: VecDeque::new(),
                }),
                create_permits: Semaphore::new(permits),
                health: AtomicU8::new(PoolHealth::Healthy.as_u8()),
                closed: AtomicBool::new(false),
                force_closed: AtomicBool::new(false),
                drained: Notify::new(),
                next_conn_id: AtomicU64::new(1),
                next_waiter_id: AtomicU64::new(1),
                failure_streak: AtomicU32::new(0),
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
                creation_failures: AtomicU64::new(0),
                wait_count: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// Build a pool and open its minimum connections.
    pub async fn connect(
        id: impl Into<PoolId>,
        endpoint: impl Into<String>,
        config: PoolConfig,
        driver: Arc<dyn DatabaseDriver>,
    ) -> Self {
        let pool = Self::new(id, endpoint, config, driver);
        pool.warm_up().await;
        pool
    }

    /// Open connections until the pool holds `min_size`. Stops at the first
    /// failure; the health checker and reaper keep retrying later.
    pub async fn warm_up(&self) -> usize {
        let mut warmed = 0;
        loop {
            {
                let mut st = self.inner.state.lock();
                let floor = self.inner.config.min_size.min(st.target);
                if self.is_closed() || st.total() >= floor {
                    break;
                }
                st.creating += 1;
            }
            let opened = self.open().await;
            let mut doomed = Vec::new();
            let ok = {
                let mut st = self.inner.state.lock();
                st.creating -= 1;
                match opened {
                    Ok(conn) => {
                        self.settle(&mut st, conn, &mut doomed);
                        true
                    }
                    Err(_) => false,
                }
            };
            self.destroy(doomed);
            if !ok {
                break;
            }
            warmed += 1;
        }
        info!(
            pool = %self.inner.id,
            warmed,
            min = self.inner.config.min_size,
            "pool warmed up"
        );
        warmed
    }

    // ── Acquire / release ──────────────────────────────────────────

    /// Borrow a connection, waiting up to `acquire_timeout`.
    pub async fn acquire(&self) -> PoolResult<PooledConnection> {
        self.acquire_with(AcquireOptions::default()).await
    }

    /// Borrow a connection with an explicit deadline and/or cancellation.
    ///
    /// Dropping the returned future at any point leaves no waiter behind and
    /// loses no connection.
    pub async fn acquire_with(&self, opts: AcquireOptions) -> PoolResult<PooledConnection> {
        let started = Instant::now();
        let deadline = opts
            .deadline
            .unwrap_or_else(|| deadline_after(started, self.inner.config.acquire_timeout));
        let cancel = opts.cancel.as_ref();

        let mut doomed = Vec::new();
        let step = {
            let mut st = self.inner.state.lock();
            if self.is_closed() {
                return Err(self.closed_error());
            }
            let mut step = None;
            // Queued callers have priority over idle connections.
            if st.waiters.is_empty() {
                while let Some(mut conn) = st.idle.pop_back() {
                    if conn.lifetime_exceeded(self.inner.config.max_connection_lifetime) {
                        doomed.push(conn);
                        continue;
                    }
                    conn.mark_active();
                    st.active.insert(conn.id);
                    step = Some(Step::Ready(conn));
                    break;
                }
                if step.is_none() && st.total() < st.target {
                    st.creating += 1;
                    step = Some(Step::Create);
                }
            }
            match step {
                Some(step) => step,
                None if self.inner.config.zero_wait => Step::Exhausted,
                None => {
                    let id = self.inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel();
                    st.waiters.push_back(Waiter { id, tx });
                    self.inner.wait_count.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        pool = %self.inner.id,
                        waiting = st.waiters.len(),
                        "acquire queued"
                    );
                    // Earlier waiters may be ahead of a create that failed.
                    self.replenish(&mut st);
                    Step::Wait(id, rx)
                }
            }
        };
        self.destroy(doomed);

        match step {
            Step::Ready(conn) => Ok(PooledConnection::new(conn, self.clone())),
            Step::Exhausted => Err(PoolError::PoolExhausted {
                pool: self.inner.id.clone(),
            }),
            Step::Create => self.create_for_caller(started, deadline, cancel).await,
            Step::Wait(id, rx) => self.wait_for_handoff(id, rx, started, deadline, cancel).await,
        }
    }

    async fn create_for_caller(
        &self,
        started: Instant,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> PoolResult<PooledConnection> {
        let mut slot = CreateSlot {
            pool: self,
            armed: true,
        };
        let opened = match bounded(self.open(), deadline, cancel).await {
            Ok(opened) => opened,
            Err(interrupt) => return Err(self.interrupted(interrupt, started)),
        };
        let mut conn = opened.map_err(|e| PoolError::Connect {
            pool: self.inner.id.clone(),
            message: e.to_string(),
        })?;

        slot.armed = false;
        let mut st = self.inner.state.lock();
        st.creating -= 1;
        if self.is_closed() {
            self.notify_if_drained(&st);
            drop(st);
            self.destroy(vec![conn]);
            return Err(self.closed_error());
        }
        conn.mark_active();
        st.active.insert(conn.id);
        drop(st);
        Ok(PooledConnection::new(conn, self.clone()))
    }

    async fn wait_for_handoff(
        &self,
        id: u64,
        rx: oneshot::Receiver<Connection>,
        started: Instant,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> PoolResult<PooledConnection> {
        let mut pending = PendingAcquire {
            pool: self,
            id,
            rx,
            armed: true,
        };
        let outcome = bounded(&mut pending.rx, deadline, cancel).await;
        pending.armed = false;
        match outcome {
            Ok(Ok(conn)) => Ok(PooledConnection::new(conn, self.clone())),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(interrupt) => {
                // A release may have raced the deadline.
                if let Some(conn) = pending.withdraw() {
                    return Ok(PooledConnection::new(conn, self.clone()));
                }
                Err(self.interrupted(interrupt, started))
            }
        }
    }

    /// Take a connection back from a loan. Broken, expired, and surplus
    /// connections are destroyed; the rest go to the oldest waiter or idle.
    pub(crate) fn checkin(&self, mut conn: Connection) {
        let mut doomed = Vec::new();
        {
            let mut st = self.inner.state.lock();
            if !st.active.remove(&conn.id) {
                drop(st);
                warn!(
                    pool = %self.inner.id,
                    conn_id = conn.id,
                    "released connection is not on loan from this pool"
                );
                close_detached(conn);
                return;
            }
            let expired = conn.lifetime_exceeded(self.inner.config.max_connection_lifetime);
            if conn.state == ConnectionState::Broken || expired {
                debug!(
                    pool = %self.inner.id,
                    conn_id = conn.id,
                    broken = !expired,
                    "destroying connection on release"
                );
                doomed.push(conn);
                self.replenish(&mut st);
            } else {
                conn.mark_idle();
                self.settle(&mut st, conn, &mut doomed);
            }
            self.notify_if_drained(&st);
        }
        self.destroy(doomed);
    }

    // ── Sizing ─────────────────────────────────────────────────────

    /// Move the target size, clamped to `[min_size, max_size]`.
    ///
    /// Shrinking closes idle connections first; active ones above the new
    /// target are destroyed as they come back. Growing immediately opens
    /// connections for any queued callers. Returns the applied target.
    pub fn resize(&self, new_target: usize) -> usize {
        let target = self.inner.config.clamp_target(new_target);
        let mut doomed = Vec::new();
        let previous = {
            let mut st = self.inner.state.lock();
            let previous = st.target;
            st.target = target;
            if target < previous {
                while st.total() > target {
                    match st.idle.pop_front() {
                        Some(conn) => doomed.push(conn),
                        None => break,
                    }
                }
            } else if target > previous {
                self.replenish(&mut st);
            }
            previous
        };
        if previous != target {
            info!(
                pool = %self.inner.id,
                from = previous,
                to = target,
                shed = doomed.len(),
                "pool target resized"
            );
        }
        self.destroy(doomed);
        target
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// Ping up to `batch` of the longest-idle connections. Failures are
    /// destroyed; active connections are never touched.
    pub async fn validate_idle(&self, batch: usize, ping_timeout: Duration) -> ValidationReport {
        let taken: Vec<Connection> = {
            let mut st = self.inner.state.lock();
            if self.is_closed() {
                return ValidationReport::default();
            }
            let n = batch.min(st.idle.len());
            let taken: Vec<Connection> = st
                .idle
                .drain(..n)
                .map(|mut conn| {
                    conn.state = ConnectionState::Validating;
                    conn
                })
                .collect();
            st.validating += taken.len();
            taken
        };

        let mut report = ValidationReport {
            checked: taken.len(),
            failed: 0,
        };
        let mut checked = Vec::with_capacity(taken.len());
        for mut conn in taken {
            let alive = matches!(
                tokio::time::timeout(ping_timeout, conn.raw.ping()).await,
                Ok(Ok(()))
            );
            if !alive {
                conn.state = ConnectionState::Broken;
                report.failed += 1;
            }
            checked.push(conn);
        }

        let mut doomed = Vec::new();
        {
            let mut st = self.inner.state.lock();
            st.validating -= checked.len();
            for conn in checked {
                if conn.state == ConnectionState::Broken {
                    debug!(pool = %self.inner.id, conn_id = conn.id, "idle connection failed validation");
                    doomed.push(conn);
                } else {
                    self.settle(&mut st, conn, &mut doomed);
                }
            }
            if report.failed > 0 {
                self.replenish(&mut st);
            }
            self.notify_if_drained(&st);
        }
        self.destroy(doomed);
        report
    }

    /// Recovery probe: validate one idle connection, or dial a fresh one
    /// when none is idle. A fresh connection is kept if there is room.
    pub async fn probe(&self, timeout: Duration) -> bool {
        if self.is_closed() {
            return false;
        }
        let report = self.validate_idle(1, timeout).await;
        if report.checked > 0 {
            return report.failed == 0;
        }

        let reserved = {
            let mut st = self.inner.state.lock();
            if st.total() < st.target {
                st.creating += 1;
                true
            } else {
                false
            }
        };
        let mut conn = match tokio::time::timeout(timeout, self.open()).await {
            Ok(Ok(conn)) => Some(conn),
            _ => None,
        };
        let mut alive = false;
        if let Some(c) = conn.as_mut() {
            alive = matches!(tokio::time::timeout(timeout, c.raw.ping()).await, Ok(Ok(())));
        }

        let mut doomed = Vec::new();
        {
            let mut st = self.inner.state.lock();
            if reserved {
                st.creating -= 1;
            }
            if let Some(c) = conn {
                if alive && reserved {
                    self.settle(&mut st, c, &mut doomed);
                } else {
                    doomed.push(c);
                }
            }
            self.notify_if_drained(&st);
        }
        self.destroy(doomed);
        alive
    }

    /// Destroy connections past their lifetime, and idle ones past
    /// `idle_timeout` while the pool is above `min_size`. Then top the pool
    /// back up to `min_size`. Returns the number destroyed.
    pub fn reap_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let max_lifetime = self.inner.config.max_connection_lifetime;
        let mut doomed = Vec::new();
        {
            let mut st = self.inner.state.lock();
            let min = self.inner.config.min_size;
            let mut spare = st.total().saturating_sub(min);
            let idle = std::mem::take(&mut st.idle);
            for conn in idle {
                if conn.lifetime_exceeded(max_lifetime) {
                    spare = spare.saturating_sub(1);
                    doomed.push(conn);
                } else if spare > 0 && !idle_timeout.is_zero() && conn.idle_for() >= idle_timeout
                {
                    spare -= 1;
                    doomed.push(conn);
                } else {
                    st.idle.push_back(conn);
                }
            }
            if !self.is_closed() {
                let floor = min.min(st.target);
                let deficit = floor.saturating_sub(st.total());
                self.spawn_creates(&mut st, deficit);
                self.replenish(&mut st);
            }
        }
        let reaped = doomed.len();
        if reaped > 0 {
            debug!(pool = %self.inner.id, reaped, "reaped idle connections");
        }
        self.destroy(doomed);
        reaped
    }

    // ── Shutdown ───────────────────────────────────────────────────

    /// Close using the configured `shutdown_grace`.
    pub async fn close(&self) -> usize {
        self.close_with_grace(self.inner.config.shutdown_grace).await
    }

    /// Stop lending: queued callers fail with `PoolClosed`, idle connections
    /// are closed, and loans are awaited up to `grace`. After that the pool
    /// is force-closed and outstanding loans fail on their next use.
    /// Returns how many connections were still outstanding.
    pub async fn close_with_grace(&self, grace: Duration) -> usize {
        let first = !self.inner.closed.swap(true, Ordering::SeqCst);
        let (waiters, idle) = {
            let mut st = self.inner.state.lock();
            (std::mem::take(&mut st.waiters), std::mem::take(&mut st.idle))
        };
        if first {
            info!(
                pool = %self.inner.id,
                waiters = waiters.len(),
                idle = idle.len(),
                "pool closing"
            );
        }
        // Dropping the senders wakes every waiter with PoolClosed.
        drop(waiters);
        self.inner
            .destroyed
            .fetch_add(idle.len() as u64, Ordering::Relaxed);
        for mut conn in idle {
            conn.raw.close().await;
        }

        let deadline = deadline_after(Instant::now(), grace);
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().outstanding() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let remaining = self.inner.state.lock().outstanding();
        if remaining > 0 {
            self.inner.force_closed.store(true, Ordering::SeqCst);
            warn!(
                pool = %self.inner.id,
                remaining,
                "shutdown grace expired; outstanding connections force-closed"
            );
        } else if first {
            info!(pool = %self.inner.id, "pool closed");
        }
        remaining
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn health(&self) -> PoolHealth {
        PoolHealth::from_u8(self.inner.health.load(Ordering::SeqCst))
    }

    /// Set routing health, returning the previous value. Marking a pool
    /// healthy also clears its creation-failure streak.
    pub fn set_health(&self, health: PoolHealth) -> PoolHealth {
        let previous = PoolHealth::from_u8(self.inner.health.swap(health.as_u8(), Ordering::SeqCst));
        if health == PoolHealth::Healthy {
            self.inner.failure_streak.store(0, Ordering::SeqCst);
        }
        if previous != health {
            info!(pool = %self.inner.id, from = %previous, to = %health, "pool health changed");
        }
        previous
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn is_force_closed(&self) -> bool {
        self.inner.force_closed.load(Ordering::SeqCst)
    }

    pub fn target_size(&self) -> usize {
        self.inner.state.lock().target
    }

    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Active connections over the current target.
    pub fn utilization(&self) -> f64 {
        let st = self.inner.state.lock();
        if st.target == 0 {
            return 0.0;
        }
        st.active.len() as f64 / st.target as f64
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.inner.state.lock();
        PoolStats {
            id: self.inner.id.clone(),
            health: self.health(),
            active: st.active.len(),
            idle: st.idle.len(),
            validating: st.validating,
            creating: st.creating,
            total: st.total(),
            target: st.target,
            min_size: self.inner.config.min_size,
            max_size: self.inner.config.max_size,
            waiting: st.waiters.len(),
            wait_count: self.inner.wait_count.load(Ordering::Relaxed),
            created: self.inner.created.load(Ordering::Relaxed),
            destroyed: self.inner.destroyed.load(Ordering::Relaxed),
            creation_failures: self.inner.creation_failures.load(Ordering::Relaxed),
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Open one physical connection under the creation permit.
    async fn open(&self) -> Result<Connection, DriverError> {
        let _permit = self
            .inner
            .create_permits
            .acquire()
            .await
            .map_err(|_| DriverError::Connect("creation permits closed".into()))?;
        match self.inner.driver.connect(&self.inner.endpoint).await {
            Ok(raw) => {
                self.inner.failure_streak.store(0, Ordering::SeqCst);
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                let id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %self.inner.id, conn_id = id, "connection opened");
                Ok(Connection::new(id, raw))
            }
            Err(e) => {
                self.record_creation_failure(&e);
                Err(e)
            }
        }
    }

    fn record_creation_failure(&self, error: &DriverError) {
        self.inner.creation_failures.fetch_add(1, Ordering::Relaxed);
        let streak = self.inner.failure_streak.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            pool = %self.inner.id,
            endpoint = %self.inner.endpoint,
            streak,
            error = %error,
            "connection attempt failed"
        );
        if streak >= self.inner.config.degraded_after_failures
            && self
                .inner
                .health
                .compare_exchange(
                    PoolHealth::Healthy.as_u8(),
                    PoolHealth::Degraded.as_u8(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
        {
            warn!(pool = %self.inner.id, streak, "pool marked degraded");
        }
    }

    /// Place a connection that is not counted in `st`: hand it to the oldest
    /// waiter, park it idle, or destroy it if the pool is over target.
    fn settle(&self, st: &mut PoolState, mut conn: Connection, doomed: &mut Vec<Connection>) {
        if self.is_closed() || st.total() >= st.target {
            doomed.push(conn);
            return;
        }
        while let Some(waiter) = st.waiters.pop_front() {
            conn.mark_active();
            st.active.insert(conn.id);
            match waiter.tx.send(conn) {
                Ok(()) => {
                    debug!(pool = %self.inner.id, waiter = waiter.id, "connection handed to waiter");
                    return;
                }
                Err(returned) => {
                    st.active.remove(&returned.id);
                    conn = returned;
                    conn.use_count = conn.use_count.saturating_sub(1);
                }
            }
        }
        conn.state = ConnectionState::Idle;
        st.idle.push_back(conn);
    }

    /// Open replacements for queued callers, up to the target.
    fn replenish(&self, st: &mut PoolState) -> usize {
        if self.is_closed() {
            return 0;
        }
        let room = st.target.saturating_sub(st.total());
        let unserved = st.waiters.len().saturating_sub(st.creating);
        self.spawn_creates(st, room.min(unserved))
    }

    fn spawn_creates(&self, st: &mut PoolState, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return 0;
        };
        for _ in 0..count {
            st.creating += 1;
            let pool = self.clone();
            handle.spawn(async move { pool.create_in_background().await });
        }
        count
    }

    async fn create_in_background(self) {
        let opened = self.open().await;
        if opened.is_err() && !self.is_closed() {
            tokio::time::sleep(CREATE_RETRY_BACKOFF).await;
        }
        let mut doomed = Vec::new();
        {
            let mut st = self.inner.state.lock();
            st.creating -= 1;
            match opened {
                Ok(conn) => self.settle(&mut st, conn, &mut doomed),
                Err(_) => {
                    self.replenish(&mut st);
                }
            }
            self.notify_if_drained(&st);
        }
        self.destroy(doomed);
    }

    fn destroy(&self, doomed: Vec<Connection>) {
        if doomed.is_empty() {
            return;
        }
        self.inner
            .destroyed
            .fetch_add(doomed.len() as u64, Ordering::Relaxed);
        for conn in doomed {
            close_detached(conn);
        }
    }

    fn notify_if_drained(&self, st: &PoolState) {
        if self.is_closed() && st.outstanding() == 0 {
            self.inner.drained.notify_waiters();
        }
    }

    fn closed_error(&self) -> PoolError {
        PoolError::PoolClosed {
            pool: self.inner.id.clone(),
        }
    }

    fn interrupted(&self, interrupt: Interrupt, started: Instant) -> PoolError {
        let pool = self.inner.id.clone();
        let waited = started.elapsed();
        match interrupt {
            Interrupt::Timeout => {
                debug!(pool = %pool, ?waited, "acquire timed out");
                PoolError::AcquireTimeout { pool, waited }
            }
            Interrupt::Cancelled => PoolError::Cancelled { pool, waited },
        }
    }
}

/// Reserved `creating` slot for an in-flight caller-side create. Released
/// on failure or abandonment, handing the slot to any queued caller.
struct CreateSlot<'a> {
    pool: &'a Pool,
    armed: bool,
}

impl Drop for CreateSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut st = self.pool.inner.state.lock();
            st.creating -= 1;
            self.pool.replenish(&mut st);
            self.pool.notify_if_drained(&st);
        }
    }
}

/// A queued caller. Dropped mid-wait, it removes itself from the queue or
/// returns a connection that was handed over concurrently.
struct PendingAcquire<'a> {
    pool: &'a Pool,
    id: u64,
    rx: oneshot::Receiver<Connection>,
    armed: bool,
}

impl PendingAcquire<'_> {
    fn withdraw(&mut self) -> Option<Connection> {
        {
            let mut st = self.pool.inner.state.lock();
            if let Some(pos) = st.waiters.iter().position(|w| w.id == self.id) {
                st.waiters.remove(pos);
                return None;
            }
        }
        // Hand-offs are sent under the lock, so anything sent is visible now.
        self.rx.try_recv().ok()
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.armed
            && let Some(conn) = self.withdraw()
        {
            self.pool.checkin(conn);
        }
    }
}

/// `from + wait`, saturating at a distant deadline instead of overflowing.
fn deadline_after(from: Instant, wait: Duration) -> Instant {
    from.checked_add(wait)
        .unwrap_or_else(|| from + Duration::from_secs(100 * 365 * 24 * 60 * 60))
}

async fn bounded<F: Future>(
    fut: F,
    deadline: Instant,
    cancel: Option<&CancellationToken>,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        out = fut => Ok(out),
        _ = tokio::time::sleep_until(deadline) => Err(Interrupt::Timeout),
        _ = cancelled(cancel) => Err(Interrupt::Cancelled),
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn close_detached(mut conn: Connection) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { conn.raw.close().await });
    }
}
