//! Per-server connection pool.
//!
//! # Architecture
//!
//! ```text
//! acquire(timeout)
//!   → wait for a checkout permit (FIFO semaphore, max_size permits)
//!     → idle connection available → liveness policy → hand out or discard
//!     → none idle → open a new connection via the Connector
//! release(conn) → back to the idle queue (or closed if unusable)
//! discard(conn) → closed, total decremented once
//! ```
//!
//! Bookkeeping lives behind one `parking_lot` mutex that is never held
//! across an await. A checked-out connection is owned by a
//! [`PooledConnection`] guard; dropping the guard without releasing it closes
//! the socket, so a cancelled operation never returns a half-read connection.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tidepool_core::{ClientOptions, DriverError, LivenessCheck, Result, ServerAddress};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;

use crate::connection::{Connection, Connector};

/// Pool sizing and health policy.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolOptions {
    pub max_size: u32,
    /// How long `acquire` waits for a permit. `None` waits indefinitely.
    pub wait_queue_timeout: Option<Duration>,
    /// Idle connections older than this are reaped.
    pub max_idle_time: Option<Duration>,
    pub liveness_check: LivenessCheck,
    pub socket_keepalive: bool,
}

impl PoolOptions {
    pub fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            max_size: options.max_pool_size,
            wait_queue_timeout: options.wait_queue_timeout,
            max_idle_time: options.max_idle_time,
            liveness_check: options.liveness_check,
            socket_keepalive: options.socket_keepalive,
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from_client_options(&ClientOptions::default())
    }
}

/// Point-in-time pool counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub checked_out: usize,
    pub idle: usize,
    /// Open connections, idle plus checked out.
    pub total: usize,
    pub max_size: usize,
    /// Acquires that had to wait for a permit.
    pub wait_count: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
    checked_out: usize,
    closed: bool,
    wait_count: u64,
}

struct PoolInner {
    address: ServerAddress,
    options: PoolOptions,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
}

/// Bounded pool of connections to one server. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("address", &self.inner.address)
            .field("options", &self.inner.options)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Pool {
    pub fn new(address: ServerAddress, options: PoolOptions, connector: Arc<dyn Connector>) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_size as usize));
        tracing::info!(address = %address, max_size = options.max_size, "connection pool created");
        Self {
            inner: Arc::new(PoolInner {
                address,
                options,
                connector,
                state: Mutex::new(PoolState::default()),
                permits,
            }),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn max_size(&self) -> usize {
        self.inner.options.max_size as usize
    }

    pub fn wait_queue_timeout(&self) -> Option<Duration> {
        self.inner.options.wait_queue_timeout
    }

    pub fn socket_keepalive(&self) -> bool {
        self.inner.options.socket_keepalive
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Whether two handles refer to the same pool.
    pub fn ptr_eq(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Check out a connection, waiting up to `timeout` for one to free up.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let permit = self.wait_for_permit(timeout).await?;

        loop {
            let reused = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(self.closed_error());
                }
                state.checked_out += 1;
                match state.idle.pop_back() {
                    Some(conn) => Some(conn),
                    None => {
                        // Reserve the slot before connecting outside the lock.
                        state.total += 1;
                        None
                    }
                }
            };

            match reused {
                Some(conn) => {
                    let idle_for = conn.idle_for();
                    if self.inner.options.liveness_check.is_due(idle_for) && !conn.is_alive() {
                        tracing::warn!(
                            conn_id = conn.id(),
                            address = %self.inner.address,
                            idle = ?idle_for,
                            "idle connection failed liveness check"
                        );
                        self.forget(conn);
                        continue;
                    }
                    tracing::debug!(
                        conn_id = conn.id(),
                        address = %self.inner.address,
                        idle = ?idle_for,
                        "reused idle connection"
                    );
                    return Ok(self.guard(conn, permit));
                }
                None => {
                    let mut reservation = Reservation { pool: self, armed: true };
                    return match self.inner.connector.connect(&self.inner.address).await {
                        Ok(conn) => {
                            reservation.armed = false;
                            let total = self.inner.state.lock().total;
                            tracing::debug!(
                                conn_id = conn.id(),
                                address = %self.inner.address,
                                total,
                                "created new connection"
                            );
                            Ok(self.guard(conn, permit))
                        }
                        Err(err) => {
                            drop(reservation);
                            tracing::warn!(address = %self.inner.address, error = %err, "connect failed");
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    async fn wait_for_permit(&self, timeout: Option<Duration>) -> Result<OwnedSemaphorePermit> {
        match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(self.closed_error()),
            Err(TryAcquireError::NoPermits) => {}
        }

        self.inner.state.lock().wait_count += 1;
        tracing::debug!(address = %self.inner.address, "pool exhausted, waiting for a connection");

        let acquire = Arc::clone(&self.inner.permits).acquire_owned();
        let acquired = match timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(acquired) => acquired,
                Err(_) => {
                    return Err(DriverError::PoolExhausted {
                        address: self.inner.address.to_string(),
                        timeout: limit,
                    });
                }
            },
            None => acquire.await,
        };
        acquired.map_err(|_| self.closed_error())
    }

    fn guard(&self, conn: Connection, permit: OwnedSemaphorePermit) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
            _permit: permit,
        }
    }

    fn closed_error(&self) -> DriverError {
        DriverError::PoolClosed(self.inner.address.to_string())
    }

    /// Return a checked-out connection to the idle set.
    pub fn release(&self, conn: PooledConnection) {
        conn.release();
    }

    /// Close a checked-out connection and drop it from the pool.
    pub fn discard(&self, conn: PooledConnection) {
        conn.discard();
    }

    fn check_in(&self, mut conn: Connection) {
        let mut state = self.inner.state.lock();
        let reason = if conn.is_closed() {
            Some("closed")
        } else if conn.exhaust_cursor().is_some() {
            Some("exhaust stream in progress")
        } else if state.closed {
            Some("pool closed")
        } else {
            None
        };

        state.checked_out -= 1;
        match reason {
            None => {
                conn.touch();
                let conn_id = conn.id();
                state.idle.push_back(conn);
                let (idle, total) = (state.idle.len(), state.total);
                drop(state);
                tracing::debug!(conn_id, address = %self.inner.address, idle, total, "returned connection to pool");
            }
            Some(reason) => {
                state.total -= 1;
                let total = state.total;
                drop(state);
                conn.close();
                tracing::debug!(conn_id = conn.id(), address = %self.inner.address, total, reason, "closed connection on release");
            }
        }
    }

    fn remove_checked_out(&self, mut conn: Connection, reason: &str) {
        conn.close();
        let total = {
            let mut state = self.inner.state.lock();
            state.checked_out -= 1;
            state.total -= 1;
            state.total
        };
        tracing::debug!(conn_id = conn.id(), address = %self.inner.address, total, reason, "discarded connection");
    }

    /// Drop a connection that failed its liveness probe during acquire.
    fn forget(&self, mut conn: Connection) {
        conn.close();
        let mut state = self.inner.state.lock();
        state.checked_out -= 1;
        state.total -= 1;
    }

    /// Shut the pool down. Idle connections close now, waiters get
    /// `PoolClosed`, checked-out connections close when released.
    pub fn close_all(&self) {
        let idle: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.total -= idle.len();
            idle
        };
        self.inner.permits.close();
        let closed = idle.len();
        for mut conn in idle {
            conn.close();
        }
        tracing::info!(address = %self.inner.address, closed, "connection pool closed");
    }

    /// Close idle connections that sat unused longer than `max_idle_time`.
    /// Returns the number reaped.
    pub fn reap_idle(&self) -> usize {
        let Some(max_idle) = self.inner.options.max_idle_time else {
            return 0;
        };
        let reaped: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) =
                state.idle.drain(..).partition(|c| c.idle_for() >= max_idle);
            state.idle = fresh;
            state.total -= stale.len();
            stale.into_iter().collect()
        };
        let count = reaped.len();
        for mut conn in reaped {
            conn.close();
        }
        if count > 0 {
            tracing::info!(address = %self.inner.address, reaped = count, "reaped idle connections");
        }
        count
    }

    /// Spawn a task that calls [`Pool::reap_idle`] every `interval` until the
    /// pool is closed or dropped.
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let pool = Pool { inner };
                if pool.is_closed() {
                    break;
                }
                pool.reap_idle();
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            checked_out: state.checked_out,
            idle: state.idle.len(),
            total: state.total,
            max_size: self.max_size(),
            wait_count: state.wait_count,
        }
    }

    /// Ids of connections currently in the idle set.
    pub fn idle_connection_ids(&self) -> Vec<u64> {
        self.inner.state.lock().idle.iter().map(|c| c.id()).collect()
    }
}

/// A slot reserved for a connection still being opened. Dropping it
/// unreserved (connect failed or the acquire was cancelled) frees the slot.
struct Reservation<'a> {
    pool: &'a Pool,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.inner.state.lock();
            state.total -= 1;
            state.checked_out -= 1;
        }
    }
}

// ── PooledConnection ─────────────────────────────────────────────────

/// A connection checked out of a [`Pool`].
///
/// Call [`release`](Self::release) when the connection is healthy and idle,
/// [`discard`](Self::discard) when it is not. Dropping the guard discards.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Pool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").field("conn", &self.conn).finish()
    }
}

impl PooledConnection {
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn);
        }
    }

    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.remove_checked_out(conn, "discarded");
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection taken before guard was consumed"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection taken before guard was consumed"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.remove_checked_out(conn, "dropped while checked out");
        }
    }
}
