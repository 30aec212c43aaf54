//! Sessions: sequential units of work against one database.
//!
//! A session never owns a connection between units of work. Each auto-commit
//! statement or transaction borrows one from the pool and gives it back when
//! it ends, so a session is cheap to open and keep around.
//!
//! Only one unit of work may be in flight per session. Overlapping calls fail
//! fast with `DriverError::ConcurrentAccess` instead of waiting.

pub mod retry;
pub mod transaction;

use crate::connection::{BeginRequest, ConnectionPool};
use crate::error::{DriverError, DriverResult};
use crate::models::{
    AccessMode, Bookmark, Query, ResultStream, SessionConfig, TransactionConfig, TransactionKind,
};
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{debug, info, warn};

pub use retry::{RetryPolicy, Retryability};
pub use transaction::{ManagedTransaction, Transaction};

use transaction::{TxCore, TxHandle, execute_statement, release_after_failure};

fn generate_session_id() -> String {
    format!("session_{}", uuid::Uuid::new_v4().simple())
}

struct SessionState {
    /// Explicit or managed transaction started by this session, if any.
    active_tx: Option<Arc<Mutex<TxCore>>>,
}

/// State shared between a session and the transactions it started.
pub(crate) struct SessionShared {
    id: String,
    config: SessionConfig,
    database: Option<String>,
    fetch_size: usize,
    pool: ConnectionPool,
    retry: RetryPolicy,
    state: Mutex<SessionState>,
    /// Uses std::sync::Mutex (not tokio) since it is never held across await.
    bookmarks: std::sync::Mutex<Vec<Bookmark>>,
    closed: watch::Sender<bool>,
}

impl SessionShared {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub(crate) fn fetch_size(&self) -> usize {
        self.fetch_size
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub(crate) fn bookmarks(&self) -> Vec<Bookmark> {
        self.bookmarks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The latest bookmark supersedes all earlier ones.
    pub(crate) fn update_bookmark(&self, bookmark: Bookmark) {
        debug!(session_id = %self.id, bookmark = %bookmark, "Session bookmark updated");
        *self.bookmarks.lock().unwrap_or_else(PoisonError::into_inner) = vec![bookmark];
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn guard_open(&self) -> DriverResult<()> {
        if self.is_closed() {
            Err(DriverError::session_closed(&self.id))
        } else {
            Ok(())
        }
    }

    /// Run `fut` until it completes or the session is closed.
    ///
    /// When the session closes first, `fut` is dropped, which discards any
    /// connection it had taken out of the pool.
    pub(crate) async fn cancellable<T>(
        &self,
        fut: impl Future<Output = DriverResult<T>>,
    ) -> DriverResult<T> {
        let mut closed = self.closed.subscribe();
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => Err(DriverError::session_closed(&self.id)),
            result = fut => result,
        }
    }

    fn begin_request(&self, mode: AccessMode, config: TransactionConfig) -> BeginRequest {
        BeginRequest {
            database: self.database.clone(),
            access_mode: mode,
            bookmarks: self.bookmarks(),
            config,
        }
    }

    async fn auto_commit(&self, query: Query, config: TransactionConfig) -> DriverResult<ResultStream> {
        let mode = self.config.default_access_mode;
        let request = self.begin_request(mode, config);
        let mut lease = self.pool.acquire(self.database(), mode).await?;

        debug!(
            session_id = %self.id,
            pool_connection = lease.id(),
            query = %query.text(),
            params = query.params().len(),
            "Running auto-commit statement"
        );

        match execute_statement(
            &mut lease,
            &query,
            Some(&request),
            self.fetch_size,
            self.database.clone(),
        )
        .await
        {
            Ok((stream, bookmark)) => {
                lease.release().await;
                if let Some(bookmark) = bookmark {
                    self.update_bookmark(bookmark);
                }
                Ok(stream)
            }
            Err(e) => {
                release_after_failure(lease, &e).await;
                Err(e)
            }
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    if closed.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// A session against one database.
///
/// Created by `Driver::session`. The configuration is fixed for the life of
/// the session. Call `close` when done: it cancels in-flight work and rolls
/// back an open explicit transaction.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("database", &self.shared.database)
            .field("mode", &self.shared.config.default_access_mode)
            .field("closed", &self.shared.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// `database` is the resolved target: the session's own database, else
    /// the driver default, else None for the server default.
    pub(crate) fn new(
        config: SessionConfig,
        database: Option<String>,
        fetch_size: usize,
        pool: ConnectionPool,
        retry: RetryPolicy,
    ) -> Self {
        let id = generate_session_id();
        let (closed, _) = watch::channel(false);
        let fetch_size = config.fetch_size.unwrap_or(fetch_size).max(1);

        debug!(
            session_id = %id,
            database = ?database,
            mode = %config.default_access_mode,
            bookmarks = config.bookmarks.len(),
            "Session opened"
        );

        Self {
            shared: Arc::new(SessionShared {
                id,
                bookmarks: std::sync::Mutex::new(config.bookmarks.clone()),
                config,
                database,
                fetch_size,
                pool,
                retry,
                state: Mutex::new(SessionState { active_tx: None }),
                closed,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Target database. None means the server default.
    pub fn database(&self) -> Option<&str> {
        self.shared.database()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Bookmark of the last transaction committed by this session, or the
    /// bookmarks it was opened with if nothing has been committed yet.
    pub fn last_bookmarks(&self) -> Vec<Bookmark> {
        self.shared.bookmarks()
    }

    fn enter(&self, operation: &str) -> DriverResult<MutexGuard<'_, SessionState>> {
        self.shared.guard_open()?;
        self.shared
            .state
            .try_lock()
            .map_err(|_| DriverError::concurrent_access(&self.shared.id, operation))
    }

    /// Fail if a transaction started earlier is still open.
    ///
    /// A transaction whose handle was dropped while open is rolled back here.
    async fn ensure_no_open_transaction(
        &self,
        state: &mut SessionState,
        operation: &str,
    ) -> DriverResult<()> {
        let Some(active) = state.active_tx.take() else {
            return Ok(());
        };
        let abandoned = Arc::strong_count(&active) == 1;

        let result = match active.try_lock() {
            Err(_) => Err(DriverError::concurrent_access(&self.shared.id, operation)),
            Ok(mut core) => {
                if !core.is_open() {
                    Ok(())
                } else if abandoned {
                    warn!(
                        session_id = %self.shared.id,
                        transaction_id = %core.id(),
                        "Transaction dropped while open, rolling back"
                    );
                    core.close_for_session().await;
                    Ok(())
                } else {
                    Err(DriverError::transaction(
                        format!(
                            "Cannot {operation}: session already has an open transaction; commit or roll it back first"
                        ),
                        core.id(),
                    ))
                }
            }
        };

        if result.is_err() {
            state.active_tx = Some(active);
        }
        result
    }

    /// Run one statement in an auto-commit transaction.
    ///
    /// The statement is sent immediately and all records are fetched before
    /// the connection goes back to the pool. Never retried: every failure,
    /// connectivity loss included, is returned to the caller.
    pub async fn run(&self, query: impl Into<Query>) -> DriverResult<ResultStream> {
        self.run_with_config(query, TransactionConfig::default())
            .await
    }

    pub async fn run_with_config(
        &self,
        query: impl Into<Query>,
        config: TransactionConfig,
    ) -> DriverResult<ResultStream> {
        let query = query.into();
        let mut state = self.enter("run")?;
        self.ensure_no_open_transaction(&mut state, "run").await?;
        self.shared
            .cancellable(self.shared.auto_commit(query, config))
            .await
    }

    /// Start an explicit transaction in the session's default access mode.
    pub async fn begin_transaction(&self) -> DriverResult<Transaction> {
        self.begin_transaction_with_config(TransactionConfig::default())
            .await
    }

    pub async fn begin_transaction_with_config(
        &self,
        config: TransactionConfig,
    ) -> DriverResult<Transaction> {
        let mut state = self.enter("begin_transaction")?;
        self.ensure_no_open_transaction(&mut state, "begin_transaction")
            .await?;

        let mode = self.shared.config.default_access_mode;
        let core = self
            .shared
            .cancellable(TxCore::begin(&self.shared, TransactionKind::Explicit, mode, config))
            .await?;
        let handle = TxHandle::new(core, Arc::clone(&self.shared));
        state.active_tx = Some(handle.core());
        Ok(Transaction::new(handle))
    }

    /// Run `work` in a managed read transaction, retrying transient failures.
    ///
    /// `work` may be invoked more than once and must be idempotent. It is
    /// committed when it returns `Ok` and rolled back when it returns `Err`.
    /// Non-retryable errors, and the last error once retries are exhausted,
    /// are returned unchanged.
    ///
    /// ```no_run
    /// # use graph_session::{Session, DriverResult};
    /// # async fn example(session: &Session) -> DriverResult<()> {
    /// let count = session
    ///     .read_transaction(|tx| async move {
    ///         let record = tx
    ///             .run("MATCH (p:Person) RETURN count(p) AS n")
    ///             .await?
    ///             .single()?;
    ///         Ok(record.get("n").and_then(|v| v.as_i64()).unwrap_or(0))
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn read_transaction<F, Fut, T>(&self, work: F) -> DriverResult<T>
    where
        F: FnMut(ManagedTransaction) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        self.execute_managed(AccessMode::Read, TransactionConfig::default(), work)
            .await
    }

    pub async fn read_transaction_with_config<F, Fut, T>(
        &self,
        config: TransactionConfig,
        work: F,
    ) -> DriverResult<T>
    where
        F: FnMut(ManagedTransaction) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        self.execute_managed(AccessMode::Read, config, work).await
    }

    /// Run `work` in a managed write transaction, retrying transient failures.
    ///
    /// Same contract as `read_transaction`: `work` must be idempotent.
    pub async fn write_transaction<F, Fut, T>(&self, work: F) -> DriverResult<T>
    where
        F: FnMut(ManagedTransaction) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        self.execute_managed(AccessMode::Write, TransactionConfig::default(), work)
            .await
    }

    pub async fn write_transaction_with_config<F, Fut, T>(
        &self,
        config: TransactionConfig,
        work: F,
    ) -> DriverResult<T>
    where
        F: FnMut(ManagedTransaction) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        self.execute_managed(AccessMode::Write, config, work).await
    }

    /// Alias of `read_transaction`.
    pub async fn execute_read<F, Fut, T>(&self, work: F) -> DriverResult<T>
    where
        F: FnMut(ManagedTransaction) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        self.read_transaction(work).await
    }

    /// Alias of `write_transaction`.
    pub async fn execute_write<F, Fut, T>(&self, work: F) -> DriverResult<T>
    where
        F: FnMut(ManagedTransaction) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        self.write_transaction(work).await
    }

    async fn execute_managed<F, Fut, T>(
        &self,
        mode: AccessMode,
        config: TransactionConfig,
        mut work: F,
    ) -> DriverResult<T>
    where
        F: FnMut(ManagedTransaction) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        let (operation, kind) = match mode {
            AccessMode::Read => ("read_transaction", TransactionKind::ManagedRead),
            AccessMode::Write => ("write_transaction", TransactionKind::ManagedWrite),
        };
        let mut state = self.enter(operation)?;
        self.ensure_no_open_transaction(&mut state, operation).await?;

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self
                .shared
                .cancellable(self.managed_attempt(&mut state, kind, mode, &config, &mut work))
                .await;
            if let Err(DriverError::SessionClosed { .. }) = &outcome {
                // `close` cleans up the interrupted transaction.
                return outcome;
            }
            state.active_tx = None;

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            session_id = %self.shared.id,
                            attempts = attempt,
                            "Managed transaction succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            match self
                .shared
                .retry
                .next_delay(attempt, started.elapsed(), &err)
            {
                Some(delay) => {
                    warn!(
                        session_id = %self.shared.id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Managed transaction failed, retrying"
                    );
                    self.shared
                        .cancellable(async {
                            tokio::time::sleep(delay).await;
                            Ok(())
                        })
                        .await?;
                }
                None => {
                    if err.is_retryable() {
                        warn!(
                            session_id = %self.shared.id,
                            attempts = attempt,
                            error = %err,
                            "Managed transaction retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn managed_attempt<F, Fut, T>(
        &self,
        state: &mut SessionState,
        kind: TransactionKind,
        mode: AccessMode,
        config: &TransactionConfig,
        work: &mut F,
    ) -> DriverResult<T>
    where
        F: FnMut(ManagedTransaction) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        let core = TxCore::begin(&self.shared, kind, mode, config.clone()).await?;
        let handle = TxHandle::new(core, Arc::clone(&self.shared));
        state.active_tx = Some(handle.core());

        match work(ManagedTransaction::new(handle.clone())).await {
            Ok(value) => {
                handle.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = handle.rollback().await {
                    debug!(error = %rollback_err, "Rollback after failed work failed");
                }
                Err(e)
            }
        }
    }

    /// Close the session. Idempotent.
    ///
    /// In-flight work is cancelled and its connection discarded. An open
    /// explicit transaction is rolled back. Every later operation fails with
    /// `DriverError::SessionClosed`.
    pub async fn close(&self) {
        if self.shared.closed.send_replace(true) {
            return;
        }

        let mut state = self.shared.state.lock().await;
        if let Some(active) = state.active_tx.take() {
            let mut core = active.lock().await;
            core.close_for_session().await;
        }
        info!(session_id = %self.shared.id, "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthToken;
    use crate::config::{PoolOptions, RetryConfig, ServerAddress};
    use crate::connection::{MemoryConnector, MemoryGraph};
    use crate::models::{TransactionState, Value};
    use std::time::Duration;

    fn session_with(connector: MemoryConnector, config: SessionConfig) -> Session {
        let pool = ConnectionPool::new(
            ServerAddress::new("localhost", 7687),
            AuthToken::none(),
            Arc::new(connector),
            PoolOptions {
                max_size: Some(2),
                acquire_timeout_ms: Some(200),
                ..PoolOptions::default()
            },
            "test",
            Duration::from_secs(1),
        );
        let retry = RetryPolicy::new(RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryConfig::default()
        });
        Session::new(config, None, 2, pool, retry)
    }

    #[tokio::test]
    async fn test_auto_commit_returns_records() {
        let session = session_with(MemoryConnector::new(MemoryGraph::new()), SessionConfig::default());
        let record = session.run("RETURN 1 AS one").await.unwrap().single().unwrap();
        assert_eq!(record.get("one"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_second_transaction_is_rejected_while_open() {
        let session = session_with(MemoryConnector::new(MemoryGraph::new()), SessionConfig::default());
        let tx = session.begin_transaction().await.unwrap();

        let err = session.begin_transaction().await.unwrap_err();
        assert!(matches!(err, DriverError::Transaction { .. }));
        assert!(matches!(
            session.run("RETURN 1").await,
            Err(DriverError::Transaction { .. })
        ));

        tx.rollback().await.unwrap();
        assert!(session.begin_transaction().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_transaction_is_rolled_back() {
        let graph = MemoryGraph::new();
        let session = session_with(MemoryConnector::new(Arc::clone(&graph)), SessionConfig::default());
        let tx = session.begin_transaction().await.unwrap();
        tx.run("CREATE (p:Person {name: 'Ann'})").await.unwrap();
        drop(tx);

        session.run("RETURN 1").await.unwrap();
        assert_eq!(graph.node_count("neo4j"), 0);
    }

    #[tokio::test]
    async fn test_commit_updates_bookmarks() {
        let session = session_with(MemoryConnector::new(MemoryGraph::new()), SessionConfig::default());
        assert!(session.last_bookmarks().is_empty());
        let tx = session.begin_transaction().await.unwrap();
        tx.run("CREATE (p:Person)").await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(session.last_bookmarks().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_size_batches_are_reassembled() {
        let session = session_with(MemoryConnector::new(MemoryGraph::new()), SessionConfig::default());
        for i in 0..5 {
            session
                .run(Query::new("CREATE (p:Item {n: $n})").param("n", i))
                .await
                .unwrap();
        }
        let stream = session.run("MATCH (p:Item) RETURN p").await.unwrap();
        assert_eq!(stream.len(), 5);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations() {
        let session = session_with(MemoryConnector::new(MemoryGraph::new()), SessionConfig::default());
        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        assert!(matches!(
            session.run("RETURN 1").await,
            Err(DriverError::SessionClosed { .. })
        ));
        assert!(matches!(
            session.begin_transaction().await,
            Err(DriverError::SessionClosed { .. })
        ));
    }
}
