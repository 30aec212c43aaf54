//! Connection pool management.
//!
//! The pool owns every physical connection to one endpoint and lends them to
//! sessions. Capacity is a fair `Semaphore` with one permit per connection
//! slot, so waiters are served in FIFO order. Idle connections sit in a
//! `std::sync::Mutex<VecDeque>` that is never held across an await point.
//!
//! Invariants:
//! - `leased + idle <= max_size`; a new connection is only opened when the
//!   idle set is empty and the caller holds a permit
//! - a lease is moved, never shared, so a leased connection belongs to
//!   exactly one session
//! - a connection that reported a connectivity failure is closed on release

use crate::auth::AuthToken;
use crate::config::{PoolOptions, ServerAddress};
use crate::connection::{BeginRequest, Connection, Connector, PullResponse, RunResponse};
use crate::error::{DriverError, DriverResult};
use crate::models::{AccessMode, Bookmark, Query};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Snapshot of pool usage.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolMetrics {
    pub address: String,
    pub max_size: u32,
    /// Connections currently lent to sessions.
    pub in_use: usize,
    pub idle: usize,
    /// Physical connections opened over the pool's lifetime.
    pub created: u64,
    /// Physical connections closed over the pool's lifetime.
    pub closed: u64,
}

struct IdleConnection {
    id: u64,
    connection: Box<dyn Connection>,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolInner {
    address: ServerAddress,
    auth: AuthToken,
    connector: Arc<dyn Connector>,
    options: PoolOptions,
    user_agent: String,
    connect_timeout: Duration,
    max_size: u32,
    permits: Arc<Semaphore>,
    /// Uses std::sync::Mutex (not tokio) since it is never held across await.
    idle: std::sync::Mutex<VecDeque<IdleConnection>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    created: AtomicU64,
    closed_count: AtomicU64,
    in_use: AtomicUsize,
    returned: Notify,
}

impl PoolInner {
    fn take_idle(&self) -> Option<IdleConnection> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop_back())
    }

    fn drain_idle(&self) -> Vec<IdleConnection> {
        self.idle
            .lock()
            .map(|mut idle| idle.drain(..).collect())
            .unwrap_or_default()
    }

    async fn close_connection(&self, id: u64, mut connection: Box<dyn Connection>, reason: &str) {
        connection.close().await;
        self.closed_count.fetch_add(1, Ordering::AcqRel);
        debug!(
            address = %self.address,
            pool_connection = id,
            reason = reason,
            "Closed pooled connection"
        );
    }

    fn lease_returned(&self) {
        let prev = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });
        if let Ok(0) = prev {
            warn!(address = %self.address, "In-use count underflow detected - extra release call");
        }
        self.returned.notify_waiters();
    }
}

/// Bounded pool of connections to one server endpoint.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.address)
            .field("max_size", &self.inner.max_size)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create a pool. No connection is opened until the first acquisition.
    pub fn new(
        address: ServerAddress,
        auth: AuthToken,
        connector: Arc<dyn Connector>,
        options: PoolOptions,
        user_agent: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        let max_size = options.max_size_or_default();
        Self {
            inner: Arc::new(PoolInner {
                address,
                auth,
                connector,
                options,
                user_agent: user_agent.into(),
                connect_timeout,
                max_size,
                permits: Arc::new(Semaphore::new(max_size as usize)),
                idle: std::sync::Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                created: AtomicU64::new(0),
                closed_count: AtomicU64::new(0),
                in_use: AtomicUsize::new(0),
                returned: Notify::new(),
            }),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Lend a connection, waiting up to the configured acquisition timeout.
    pub async fn acquire(
        &self,
        database: Option<&str>,
        mode: AccessMode,
    ) -> DriverResult<PooledConnection> {
        let timeout = self.inner.options.acquire_timeout_or_default();
        self.acquire_with_timeout(database, mode, timeout).await
    }

    /// Lend a connection, waiting at most `timeout` for a free slot.
    ///
    /// Waiters are served in arrival order. Idle connections are reused
    /// before new ones are opened.
    pub async fn acquire_with_timeout(
        &self,
        database: Option<&str>,
        mode: AccessMode,
        timeout: Duration,
    ) -> DriverResult<PooledConnection> {
        if self.is_closed() {
            return Err(DriverError::DriverClosed);
        }

        let started = Instant::now();
        let permits = Arc::clone(&self.inner.permits);
        let permit = match tokio::time::timeout(timeout, permits.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DriverError::DriverClosed),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(
                    address = %self.inner.address,
                    database = ?database,
                    max_size = self.inner.max_size,
                    waited_ms = waited_ms,
                    "Connection acquisition timed out"
                );
                return Err(DriverError::pool_exhausted(
                    database.unwrap_or("<default>"),
                    self.inner.max_size,
                    waited_ms,
                ));
            }
        };

        while let Some(candidate) = self.inner.take_idle() {
            if candidate.created_at.elapsed() >= self.inner.options.max_connection_lifetime_or_default() {
                self.inner
                    .close_connection(candidate.id, candidate.connection, "lifetime exceeded")
                    .await;
                continue;
            }

            let mut candidate = candidate;
            if let Some(threshold) = self.inner.options.liveness_check_timeout() {
                if candidate.idle_since.elapsed() >= threshold {
                    if let Err(e) = candidate.connection.reset().await {
                        debug!(
                            pool_connection = candidate.id,
                            error = %e,
                            "Liveness check failed"
                        );
                        self.inner
                            .close_connection(candidate.id, candidate.connection, "liveness check failed")
                            .await;
                        continue;
                    }
                }
            }

            debug!(
                address = %self.inner.address,
                pool_connection = candidate.id,
                database = ?database,
                mode = %mode,
                "Reusing idle connection"
            );
            return Ok(self.lease(
                candidate.id,
                candidate.connection,
                candidate.created_at,
                permit,
                database,
                mode,
            ));
        }

        let connection = self.open_connection().await?;
        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel);
        debug!(
            address = %self.inner.address,
            pool_connection = id,
            database = ?database,
            mode = %mode,
            "Opened new connection"
        );
        Ok(self.lease(id, connection, Instant::now(), permit, database, mode))
    }

    /// Open and authenticate one connection without lending it, then close it.
    ///
    /// Authentication failures surface as `Authentication`, everything else
    /// that prevents a handshake as `Connectivity`.
    pub async fn verify_connectivity(&self) -> DriverResult<()> {
        if self.is_closed() {
            return Err(DriverError::DriverClosed);
        }
        let mut connection = self.open_connection().await?;
        connection.close().await;
        self.inner.closed_count.fetch_add(1, Ordering::AcqRel);
        info!(address = %self.inner.address, "Connectivity verified");
        Ok(())
    }

    /// Return a connection to the pool. Equivalent to `lease.release()`.
    pub async fn release(&self, lease: PooledConnection) {
        lease.release().await;
    }

    pub fn metrics(&self) -> PoolMetrics {
        let idle = self.inner.idle.lock().map(|idle| idle.len()).unwrap_or(0);
        PoolMetrics {
            address: self.inner.address.to_string(),
            max_size: self.inner.max_size,
            in_use: self.inner.in_use.load(Ordering::Acquire),
            idle,
            created: self.inner.created.load(Ordering::Acquire),
            closed: self.inner.closed_count.load(Ordering::Acquire),
        }
    }

    /// Close the pool.
    ///
    /// Idle connections are closed immediately and new acquisitions fail with
    /// `DriverClosed`. Leased connections are closed as they are released;
    /// this waits up to the drain timeout for all of them to come back and
    /// returns how many were still out when it gave up.
    pub async fn close(&self) -> usize {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return self.inner.in_use.load(Ordering::Acquire);
        }
        self.inner.permits.close();

        for idle in self.inner.drain_idle() {
            self.inner
                .close_connection(idle.id, idle.connection, "pool closed")
                .await;
        }

        let deadline = Instant::now() + self.inner.options.drain_timeout_or_default();
        loop {
            let notified = self.inner.returned.notified();
            let outstanding = self.inner.in_use.load(Ordering::Acquire);
            if outstanding == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                warn!(
                    address = %self.inner.address,
                    outstanding = outstanding,
                    "Pool closed with connections still leased"
                );
                return outstanding;
            }
        }

        info!(
            address = %self.inner.address,
            created = self.inner.created.load(Ordering::Acquire),
            closed = self.inner.closed_count.load(Ordering::Acquire),
            "Connection pool drained"
        );
        0
    }

    async fn open_connection(&self) -> DriverResult<Box<dyn Connection>> {
        let connect = self.inner.connector.connect(
            &self.inner.address,
            &self.inner.auth,
            &self.inner.user_agent,
        );
        let connection = match tokio::time::timeout(self.inner.connect_timeout, connect).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                warn!(
                    address = %self.inner.address,
                    principal = ?self.inner.auth.principal(),
                    error = %e,
                    "Failed to open connection"
                );
                return Err(e);
            }
            Err(_) => {
                return Err(DriverError::connectivity(
                    format!(
                        "Timed out after {}ms connecting to {}",
                        self.inner.connect_timeout.as_millis(),
                        self.inner.address
                    ),
                    "Check that the server is running and reachable",
                ));
            }
        };
        self.inner.created.fetch_add(1, Ordering::AcqRel);
        Ok(connection)
    }

    fn lease(
        &self,
        id: u64,
        connection: Box<dyn Connection>,
        created_at: Instant,
        permit: OwnedSemaphorePermit,
        database: Option<&str>,
        mode: AccessMode,
    ) -> PooledConnection {
        self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        PooledConnection {
            id,
            connection: Some(connection),
            created_at,
            broken: false,
            database: database.map(String::from),
            mode,
            permit: Some(permit),
            pool: Arc::clone(&self.inner),
        }
    }
}

/// A connection lent to one session.
///
/// Prefer `release().await`. Dropping a lease without releasing it discards
/// the connection, since its protocol state is unknown.
///
/// # Runtime Shutdown Behavior
///
/// The `Drop` implementation spawns a tokio task to close the connection. If
/// no runtime is available the connection is dropped without a goodbye.
pub struct PooledConnection {
    id: u64,
    connection: Option<Box<dyn Connection>>,
    created_at: Instant,
    broken: bool,
    database: Option<String>,
    mode: AccessMode,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("mode", &self.mode)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Flag the connection so it is closed instead of recycled.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn connection(&mut self) -> DriverResult<&mut Box<dyn Connection>> {
        self.connection.as_mut().ok_or_else(|| {
            DriverError::connectivity(
                "Connection was already returned to the pool",
                "Acquire a new connection",
            )
        })
    }

    fn observe<T>(&mut self, result: DriverResult<T>) -> DriverResult<T> {
        if let Err(e) = &result {
            if e.is_connectivity() {
                self.broken = true;
            }
        }
        result
    }

    pub async fn begin(&mut self, request: &BeginRequest) -> DriverResult<()> {
        let result = self.connection()?.begin(request).await;
        self.observe(result)
    }

    pub async fn run(
        &mut self,
        query: &Query,
        autocommit: Option<&BeginRequest>,
    ) -> DriverResult<RunResponse> {
        let result = self.connection()?.run(query, autocommit).await;
        self.observe(result)
    }

    pub async fn pull(&mut self, n: usize) -> DriverResult<PullResponse> {
        let result = self.connection()?.pull(n).await;
        self.observe(result)
    }

    pub async fn commit(&mut self) -> DriverResult<Option<Bookmark>> {
        let result = self.connection()?.commit().await;
        self.observe(result)
    }

    pub async fn rollback(&mut self) -> DriverResult<()> {
        let result = self.connection()?.rollback().await;
        self.observe(result)
    }

    pub async fn reset(&mut self) -> DriverResult<()> {
        let result = self.connection()?.reset().await;
        self.observe(result)
    }

    /// Return the connection to the pool, or close it if it is broken, too
    /// old, or the pool is closed.
    pub async fn release(mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };

        let expired =
            self.created_at.elapsed() >= self.pool.options.max_connection_lifetime_or_default();
        let pool_closed = self.pool.closed.load(Ordering::Acquire);

        if self.broken || !connection.is_open() || expired || pool_closed {
            let reason = if self.broken || !connection.is_open() {
                "broken"
            } else if expired {
                "lifetime exceeded"
            } else {
                "pool closed"
            };
            self.pool.close_connection(self.id, connection, reason).await;
        } else {
            let pushed = match self.pool.idle.lock() {
                Ok(mut idle) => {
                    idle.push_back(IdleConnection {
                        id: self.id,
                        connection,
                        created_at: self.created_at,
                        idle_since: Instant::now(),
                    });
                    None
                }
                Err(_) => Some(connection),
            };
            if let Some(connection) = pushed {
                connection_dropped(&self.pool, self.id, connection);
            }
        }

        // Idle entry is visible before the permit wakes the next waiter.
        self.permit.take();
        self.pool.lease_returned();
    }

    /// Close the connection without recycling it.
    pub async fn discard(mut self) {
        self.broken = true;
        self.release().await;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        warn!(
            address = %self.pool.address,
            pool_connection = self.id,
            "Connection dropped without release - discarding it"
        );
        connection_dropped(&self.pool, self.id, connection);
        self.permit.take();
        self.pool.lease_returned();
    }
}

/// Close a connection from a synchronous context.
fn connection_dropped(pool: &Arc<PoolInner>, id: u64, connection: Box<dyn Connection>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let pool = Arc::clone(pool);
            handle.spawn(async move {
                pool.close_connection(id, connection, "dropped").await;
            });
        }
        Err(_) => {
            pool.closed_count.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Fault, MemoryConnector, MemoryGraph};

    fn pool_with(connector: MemoryConnector, options: PoolOptions) -> ConnectionPool {
        ConnectionPool::new(
            ServerAddress::new("localhost", 7687),
            AuthToken::none(),
            Arc::new(connector),
            options,
            "test",
            Duration::from_secs(5),
        )
    }

    fn options(max_size: u32, acquire_timeout_ms: u64) -> PoolOptions {
        PoolOptions {
            max_size: Some(max_size),
            acquire_timeout_ms: Some(acquire_timeout_ms),
            drain_timeout_secs: Some(1),
            ..PoolOptions::default()
        }
    }

    #[tokio::test]
    async fn test_pool_creation_is_lazy() {
        let pool = pool_with(MemoryConnector::new(MemoryGraph::new()), options(2, 100));
        let metrics = pool.metrics();
        assert_eq!(metrics.created, 0);
        assert_eq!(metrics.in_use, 0);
        assert_eq!(metrics.max_size, 2);
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let pool = pool_with(MemoryConnector::new(MemoryGraph::new()), options(2, 100));
        let lease = pool.acquire(None, AccessMode::Write).await.unwrap();
        let first_id = lease.id();
        pool.release(lease).await;
        assert_eq!(pool.metrics().idle, 1);

        let lease = pool.acquire(None, AccessMode::Read).await.unwrap();
        assert_eq!(lease.id(), first_id);
        assert_eq!(pool.metrics().created, 1);
        lease.release().await;
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let pool = pool_with(MemoryConnector::new(MemoryGraph::new()), options(1, 50));
        let held = pool.acquire(Some("neo4j"), AccessMode::Write).await.unwrap();

        let result = pool.acquire(Some("neo4j"), AccessMode::Write).await;
        match result {
            Err(DriverError::PoolExhausted {
                database, max_size, ..
            }) => {
                assert_eq!(database, "neo4j");
                assert_eq!(max_size, 1);
            }
            other => panic!("expected PoolExhausted, got {other:?}"),
        }
        held.release().await;
    }

    #[tokio::test]
    async fn test_broken_connection_is_closed_on_release() {
        let pool = pool_with(MemoryConnector::new(MemoryGraph::new()), options(1, 100));
        let mut lease = pool.acquire(None, AccessMode::Write).await.unwrap();
        lease.mark_broken();
        lease.release().await;

        let metrics = pool.metrics();
        assert_eq!(metrics.idle, 0);
        assert_eq!(metrics.closed, 1);
        assert_eq!(metrics.in_use, 0);
    }

    #[tokio::test]
    async fn test_connectivity_error_marks_lease_broken() {
        let connector = MemoryConnector::new(MemoryGraph::new());
        connector.fail_next_statements(Fault::Disconnect, 1);
        let pool = pool_with(connector, options(1, 100));

        let mut lease = pool.acquire(None, AccessMode::Write).await.unwrap();
        let result = lease
            .run(&Query::new("RETURN 1"), Some(&BeginRequest::default()))
            .await;
        assert!(matches!(result, Err(DriverError::Connectivity { .. })));
        assert!(lease.is_broken());
        lease.release().await;
        assert_eq!(pool.metrics().idle, 0);
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_its_slot() {
        let pool = pool_with(MemoryConnector::new(MemoryGraph::new()), options(1, 200));
        let lease = pool.acquire(None, AccessMode::Write).await.unwrap();
        drop(lease);

        let lease = pool.acquire(None, AccessMode::Write).await.unwrap();
        assert_eq!(pool.metrics().created, 2);
        lease.release().await;
    }

    #[tokio::test]
    async fn test_verify_connectivity_does_not_lend() {
        let pool = pool_with(MemoryConnector::new(MemoryGraph::new()), options(1, 100));
        pool.verify_connectivity().await.unwrap();
        let metrics = pool.metrics();
        assert_eq!(metrics.created, 1);
        assert_eq!(metrics.closed, 1);
        assert_eq!(metrics.in_use, 0);
        assert_eq!(metrics.idle, 0);
    }

    #[tokio::test]
    async fn test_expired_idle_connection_is_replaced() {
        let opts = PoolOptions {
            max_connection_lifetime_secs: Some(1),
            ..options(1, 100)
        };
        let pool = pool_with(MemoryConnector::new(MemoryGraph::new()), opts);
        let lease = pool.acquire(None, AccessMode::Write).await.unwrap();
        let first_id = lease.id();
        lease.release().await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let lease = pool.acquire(None, AccessMode::Write).await.unwrap();
        assert_ne!(lease.id(), first_id);
        lease.release().await;
    }

    #[tokio::test]
    async fn test_close_rejects_new_acquisitions() {
        let pool = pool_with(MemoryConnector::new(MemoryGraph::new()), options(1, 100));
        assert_eq!(pool.close().await, 0);
        assert!(matches!(
            pool.acquire(None, AccessMode::Write).await,
            Err(DriverError::DriverClosed)
        ));
        assert!(matches!(
            pool.verify_connectivity().await,
            Err(DriverError::DriverClosed)
        ));
    }
}
