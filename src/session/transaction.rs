//! Transactions: one unit of work over a borrowed connection.
//!
//! A transaction moves through `open -> committed | rolled back | failed`.
//! `Failed` is terminal and means nothing the transaction sent is durable;
//! the whole unit must be re-run, not resumed.
//!
//! The lease is taken out of the transaction for the duration of every
//! protocol exchange. If that exchange is cancelled the lease is dropped,
//! which discards the connection, and the transaction is left open without a
//! connection. Closing the session then marks it failed.

use crate::connection::{BeginRequest, PooledConnection};
use crate::error::{DriverError, DriverResult};
use crate::models::{
    AccessMode, Bookmark, Query, Record, ResultStream, ResultSummary, TransactionConfig,
    TransactionInfo, TransactionKind, TransactionState,
};
use crate::session::SessionShared;
use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// Immutable facts about a transaction plus its current state.
///
/// Shared between the core and every handle so accessors never wait on an
/// in-flight statement.
#[derive(Debug)]
struct TxMeta {
    id: String,
    session_id: String,
    kind: TransactionKind,
    database: Option<String>,
    mode: AccessMode,
    started_at: DateTime<Utc>,
    state: std::sync::Mutex<TransactionState>,
}

impl TxMeta {
    fn state(&self) -> TransactionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TransactionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            kind: self.kind,
            database: self.database.clone(),
            access_mode: self.mode,
            started_at: self.started_at,
            state: self.state(),
        }
    }
}

/// Protocol state of one transaction.
pub(crate) struct TxCore {
    meta: Arc<TxMeta>,
    lease: Option<PooledConnection>,
    fetch_size: usize,
}

impl TxCore {
    /// Acquire a connection and start a transaction on it.
    pub(crate) async fn begin(
        shared: &SessionShared,
        kind: TransactionKind,
        mode: AccessMode,
        config: TransactionConfig,
    ) -> DriverResult<Self> {
        let database = shared.database().map(String::from);
        let mut lease = shared.pool().acquire(database.as_deref(), mode).await?;
        let request = BeginRequest {
            database: database.clone(),
            access_mode: mode,
            bookmarks: shared.bookmarks(),
            config,
        };

        if let Err(e) = lease.begin(&request).await {
            release_after_failure(lease, &e).await;
            return Err(e);
        }

        let meta = TxMeta {
            id: generate_transaction_id(),
            session_id: shared.id().to_string(),
            kind,
            database,
            mode,
            started_at: Utc::now(),
            state: std::sync::Mutex::new(TransactionState::Open),
        };

        info!(
            transaction_id = %meta.id,
            session_id = %meta.session_id,
            kind = ?kind,
            mode = %mode,
            database = ?meta.database,
            pool_connection = lease.id(),
            "Transaction started"
        );

        Ok(Self {
            meta: Arc::new(meta),
            lease: Some(lease),
            fetch_size: shared.fetch_size(),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.meta.id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.meta.state().is_open()
    }

    fn ensure_open(&self, operation: &str) -> DriverResult<()> {
        let state = self.meta.state();
        if state.is_open() {
            Ok(())
        } else {
            Err(DriverError::transaction(
                format!("Cannot {operation}: transaction is {state}"),
                &self.meta.id,
            ))
        }
    }

    /// Take the lease out for one exchange.
    fn take_lease(&mut self, operation: &str) -> DriverResult<PooledConnection> {
        self.lease.take().ok_or_else(|| {
            self.meta.set_state(TransactionState::Failed);
            DriverError::transaction(
                format!("Cannot {operation}: a previous operation was interrupted"),
                &self.meta.id,
            )
        })
    }

    pub(crate) async fn run(&mut self, query: Query) -> DriverResult<ResultStream> {
        self.ensure_open("run")?;
        let mut lease = self.take_lease("run")?;

        debug!(
            transaction_id = %self.meta.id,
            query = %query.text(),
            params = query.params().len(),
            "Running statement"
        );

        match execute_statement(
            &mut lease,
            &query,
            None,
            self.fetch_size,
            self.meta.database.clone(),
        )
        .await
        {
            Ok((stream, _)) => {
                self.lease = Some(lease);
                Ok(stream)
            }
            Err(e) => {
                self.meta.set_state(TransactionState::Failed);
                warn!(
                    transaction_id = %self.meta.id,
                    error = %e,
                    "Statement failed, transaction marked failed"
                );
                release_after_failure(lease, &e).await;
                Err(e)
            }
        }
    }

    pub(crate) async fn commit(&mut self) -> DriverResult<Option<Bookmark>> {
        self.ensure_open("commit")?;
        let mut lease = self.take_lease("commit")?;
        let elapsed_ms = (Utc::now() - self.meta.started_at).num_milliseconds();

        match lease.commit().await {
            Ok(bookmark) => {
                self.meta.set_state(TransactionState::Committed);
                lease.release().await;
                info!(
                    transaction_id = %self.meta.id,
                    duration_ms = elapsed_ms,
                    bookmark = ?bookmark.as_ref().map(Bookmark::as_str),
                    "Transaction committed"
                );
                Ok(bookmark)
            }
            Err(e) if e.is_connectivity() => {
                self.meta.set_state(TransactionState::Failed);
                lease.release().await;
                warn!(
                    transaction_id = %self.meta.id,
                    error = %e,
                    "Connection lost during commit"
                );
                Err(DriverError::transaction_caused_by(
                    "Connection lost during commit; commit outcome unknown",
                    &self.meta.id,
                    e,
                ))
            }
            // The server rolled back, so the whole unit may be re-run.
            Err(e @ DriverError::Transient { .. }) => {
                self.meta.set_state(TransactionState::Failed);
                release_after_failure(lease, &e).await;
                warn!(
                    transaction_id = %self.meta.id,
                    error = %e,
                    "Commit failed with a transient error"
                );
                Err(e)
            }
            Err(e) => {
                self.meta.set_state(TransactionState::Failed);
                release_after_failure(lease, &e).await;
                warn!(
                    transaction_id = %self.meta.id,
                    error = %e,
                    "Commit rejected"
                );
                Err(DriverError::transaction_caused_by(
                    "Commit rejected by server",
                    &self.meta.id,
                    e,
                ))
            }
        }
    }

    /// Idempotent once rolled back or failed; an error after commit.
    pub(crate) async fn rollback(&mut self) -> DriverResult<()> {
        match self.meta.state() {
            TransactionState::Committed => {
                return Err(DriverError::transaction(
                    "Cannot rollback: transaction is committed",
                    &self.meta.id,
                ));
            }
            TransactionState::RolledBack | TransactionState::Failed => return Ok(()),
            TransactionState::Open => {}
        }

        let Some(mut lease) = self.lease.take() else {
            self.meta.set_state(TransactionState::Failed);
            return Ok(());
        };
        self.meta.set_state(TransactionState::RolledBack);

        match lease.rollback().await {
            Ok(()) => lease.release().await,
            Err(e) => {
                warn!(
                    transaction_id = %self.meta.id,
                    error = %e,
                    "Rollback failed, discarding connection"
                );
                lease.discard().await;
            }
        }
        info!(transaction_id = %self.meta.id, "Transaction rolled back");
        Ok(())
    }

    /// Called when the owning session closes.
    pub(crate) async fn close_for_session(&mut self) {
        if !self.is_open() {
            return;
        }
        if self.lease.is_none() {
            self.meta.set_state(TransactionState::Failed);
            warn!(
                transaction_id = %self.meta.id,
                "Session closed during an in-flight operation; transaction failed"
            );
            return;
        }
        if let Err(e) = self.rollback().await {
            warn!(transaction_id = %self.meta.id, error = %e, "Rollback on session close failed");
        }
    }
}

/// Send one statement and pull every record in `fetch_size` batches.
///
/// Returns the bookmark issued for auto-commit statements.
pub(crate) async fn execute_statement(
    lease: &mut PooledConnection,
    query: &Query,
    autocommit: Option<&BeginRequest>,
    fetch_size: usize,
    database: Option<String>,
) -> DriverResult<(ResultStream, Option<Bookmark>)> {
    let started = Instant::now();
    let run = lease
        .run(query, autocommit)
        .await
        .map_err(|e| e.with_query(query))?;

    let mut records = Vec::new();
    loop {
        let batch = lease
            .pull(fetch_size)
            .await
            .map_err(|e| e.with_query(query))?;
        records.extend(
            batch
                .records
                .into_iter()
                .map(|values| Record::new(run.keys.clone(), values)),
        );

        if !batch.has_more {
            let mut summary = ResultSummary::new(query.clone(), database);
            summary.query_type = batch.query_type;
            summary.counters = batch.counters;
            summary.result_consumed_after = started.elapsed();
            return Ok((ResultStream::new(run.keys, records, summary), batch.bookmark));
        }
    }
}

/// Return a connection after a failed exchange.
///
/// A connection that saw a server failure is reset before reuse; one that
/// lost connectivity, or fails the reset, is closed.
pub(crate) async fn release_after_failure(mut lease: PooledConnection, err: &DriverError) {
    if err.is_connectivity() {
        lease.discard().await;
        return;
    }
    match lease.reset().await {
        Ok(()) => lease.release().await,
        Err(reset_err) => {
            debug!(error = %reset_err, "Reset after failure failed");
            lease.discard().await;
        }
    }
}

/// Shared handle used by both public transaction types.
#[derive(Clone)]
pub(crate) struct TxHandle {
    meta: Arc<TxMeta>,
    core: Arc<Mutex<TxCore>>,
    shared: Arc<SessionShared>,
}

impl TxHandle {
    pub(crate) fn new(core: TxCore, shared: Arc<SessionShared>) -> Self {
        Self {
            meta: Arc::clone(&core.meta),
            core: Arc::new(Mutex::new(core)),
            shared,
        }
    }

    pub(crate) fn core(&self) -> Arc<Mutex<TxCore>> {
        Arc::clone(&self.core)
    }

    fn lock(&self, operation: &str) -> DriverResult<tokio::sync::MutexGuard<'_, TxCore>> {
        self.core
            .try_lock()
            .map_err(|_| DriverError::concurrent_access(self.shared.id(), operation))
    }

    async fn run(&self, query: Query) -> DriverResult<ResultStream> {
        self.shared.guard_open()?;
        self.shared
            .cancellable(async {
                let mut core = self.lock("run")?;
                core.run(query).await
            })
            .await
    }

    pub(crate) async fn commit(&self) -> DriverResult<()> {
        self.shared.guard_open()?;
        let bookmark = self
            .shared
            .cancellable(async {
                let mut core = self.lock("commit")?;
                core.commit().await
            })
            .await?;
        if let Some(bookmark) = bookmark {
            self.shared.update_bookmark(bookmark);
        }
        Ok(())
    }

    pub(crate) async fn rollback(&self) -> DriverResult<()> {
        if self.meta.state().is_terminated() {
            let mut core = self.lock("rollback")?;
            return core.rollback().await;
        }
        self.shared.guard_open()?;
        self.shared
            .cancellable(async {
                let mut core = self.lock("rollback")?;
                core.rollback().await
            })
            .await
    }
}

/// An explicit transaction. Never retried.
///
/// The caller must `commit` or `rollback`. A transaction whose handle is
/// dropped while open is rolled back by the next operation on its session,
/// or when the session closes.
pub struct Transaction {
    handle: TxHandle,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.handle.meta.id)
            .field("state", &self.handle.meta.state())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(handle: TxHandle) -> Self {
        Self { handle }
    }

    /// Run a statement. Statements apply in the order they are issued.
    pub async fn run(&self, query: impl Into<Query>) -> DriverResult<ResultStream> {
        self.handle.run(query.into()).await
    }

    /// Commit everything sent since begin.
    ///
    /// Fails with `DriverError::Transaction` if the transaction already
    /// ended or the server rejects the commit.
    pub async fn commit(&self) -> DriverResult<()> {
        self.handle.commit().await
    }

    pub async fn rollback(&self) -> DriverResult<()> {
        self.handle.rollback().await
    }

    pub fn id(&self) -> &str {
        &self.handle.meta.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.handle.meta.kind
    }

    pub fn state(&self) -> TransactionState {
        self.handle.meta.state()
    }

    pub fn info(&self) -> TransactionInfo {
        self.handle.meta.info()
    }
}

/// Transaction handed to the work function of a managed transaction.
///
/// Only statements can be run; commit and rollback belong to the session.
#[derive(Clone)]
pub struct ManagedTransaction {
    handle: TxHandle,
}

impl std::fmt::Debug for ManagedTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedTransaction")
            .field("id", &self.handle.meta.id)
            .field("kind", &self.handle.meta.kind)
            .finish_non_exhaustive()
    }
}

impl ManagedTransaction {
    pub(crate) fn new(handle: TxHandle) -> Self {
        Self { handle }
    }

    pub async fn run(&self, query: impl Into<Query>) -> DriverResult<ResultStream> {
        self.handle.run(query.into()).await
    }

    pub fn id(&self) -> &str {
        &self.handle.meta.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.handle.meta.kind
    }

    pub fn info(&self) -> TransactionInfo {
        self.handle.meta.info()
    }
}
