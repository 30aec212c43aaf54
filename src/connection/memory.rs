//! In-process reference backend.
//!
//! `MemoryGraph` keeps nodes per database behind a `std::sync::Mutex`;
//! `MemoryConnector` hands out `MemoryConnection`s that speak the same
//! begin/run/pull/commit protocol a network connection would. It exists so the
//! session manager can be exercised end to end without a server, and it can
//! inject connectivity and transient faults on demand.

use crate::auth::AuthToken;
use crate::config::ServerAddress;
use crate::connection::statement::{MatchAction, Pattern, Statement, StatementError};
use crate::connection::{BeginRequest, Connection, Connector, PullResponse, RunResponse};
use crate::error::{DriverError, DriverResult};
use crate::models::{AccessMode, Bookmark, Counters, Node, Query, QueryType, Value};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Database used when a request does not name one.
pub const DEFAULT_DATABASE: &str = "neo4j";

const REQUEST_INVALID: &str = "Neo.ClientError.Request.Invalid";
const ACCESS_MODE: &str = "Neo.ClientError.Statement.AccessMode";
const DATABASE_NOT_FOUND: &str = "Neo.ClientError.Database.DatabaseNotFound";
const CONSTRAINT_VALIDATION_FAILED: &str = "Neo.ClientError.Schema.ConstraintValidationFailed";
const UNAUTHORIZED: &str = "Neo.ClientError.Security.Unauthorized";
const DEADLOCK_DETECTED: &str = "Neo.TransientError.Transaction.DeadlockDetected";
const NOT_A_LEADER: &str = "Neo.ClientError.Cluster.NotALeader";
const TRANSACTION_TIMED_OUT: &str = "Neo.ClientError.Transaction.TransactionTimedOut";

#[derive(Debug, Default)]
struct GraphState {
    databases: BTreeMap<String, Vec<Node>>,
    next_id: i64,
    bookmark_seq: u64,
    /// (label, property) pairs that must be unique.
    unique: Vec<(String, String)>,
}

/// Shared node store backing every `MemoryConnection`.
#[derive(Debug)]
pub struct MemoryGraph {
    state: Mutex<GraphState>,
}

impl MemoryGraph {
    /// Create a graph with the default database.
    pub fn new() -> Arc<Self> {
        let mut databases = BTreeMap::new();
        databases.insert(DEFAULT_DATABASE.to_string(), Vec::new());
        Arc::new(Self {
            state: Mutex::new(GraphState {
                databases,
                ..GraphState::default()
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GraphState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_database(&self, name: impl Into<String>) {
        self.state().databases.entry(name.into()).or_default();
    }

    /// Reject commits that would leave two `label` nodes sharing `property`.
    pub fn add_unique_constraint(&self, label: impl Into<String>, property: impl Into<String>) {
        self.state().unique.push((label.into(), property.into()));
    }

    /// Committed nodes in a database.
    pub fn node_count(&self, database: &str) -> usize {
        self.state()
            .databases
            .get(database)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Committed nodes carrying `label`.
    pub fn nodes(&self, database: &str, label: &str) -> Vec<Node> {
        self.state()
            .databases
            .get(database)
            .map(|nodes| nodes.iter().filter(|n| n.has_label(label)).cloned().collect())
            .unwrap_or_default()
    }
}

/// Failure injected into the next statement or commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The connection drops; reported as a connectivity error.
    Disconnect,
    /// `Neo.TransientError.Transaction.DeadlockDetected`
    Deadlock,
    /// `Neo.ClientError.Cluster.NotALeader`
    LeaderSwitch,
}

#[derive(Debug, Default)]
struct FaultPlan {
    statements: VecDeque<Fault>,
    commits: VecDeque<Fault>,
    refused_connections: usize,
}

/// Counters shared by a connector and every connection it opened.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    opened: AtomicU64,
    closed: AtomicU64,
    statements: AtomicU64,
    commits: AtomicU64,
    last_bookmarks: Mutex<Vec<Bookmark>>,
}

impl ConnectionStats {
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Acquire)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Acquire)
    }

    /// Statements received, including failed ones.
    pub fn statements(&self) -> u64 {
        self.statements.load(Ordering::Acquire)
    }

    /// Successful commits, explicit and auto-commit.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Acquire)
    }

    /// Bookmarks sent with the most recent transaction start.
    pub fn last_bookmarks(&self) -> Vec<Bookmark> {
        self.last_bookmarks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Opens connections to a `MemoryGraph`.
///
/// Cloning shares the graph, the stats and the fault plan, so a test can keep
/// a handle after giving the connector to a driver.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    graph: Arc<MemoryGraph>,
    users: Vec<(String, String)>,
    stats: Arc<ConnectionStats>,
    faults: Arc<Mutex<FaultPlan>>,
    statement_delay: Duration,
    next_id: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Connector that accepts any auth token.
    pub fn new(graph: Arc<MemoryGraph>) -> Self {
        Self {
            graph,
            users: Vec::new(),
            stats: Arc::new(ConnectionStats::default()),
            faults: Arc::new(Mutex::new(FaultPlan::default())),
            statement_delay: Duration::ZERO,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Require basic credentials. Once a user is added, other tokens are refused.
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.push((username.into(), password.into()));
        self
    }

    /// Delay every statement, to keep units of work in flight.
    pub fn with_statement_delay(mut self, delay: Duration) -> Self {
        self.statement_delay = delay;
        self
    }

    pub fn graph(&self) -> &Arc<MemoryGraph> {
        &self.graph
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    /// Fail the next `count` statements, on any connection, with `fault`.
    pub fn fail_next_statements(&self, fault: Fault, count: usize) {
        let mut plan = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        plan.statements.extend(std::iter::repeat_n(fault, count));
    }

    /// Fail the next `count` commits with `fault`.
    pub fn fail_next_commits(&self, fault: Fault, count: usize) {
        let mut plan = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        plan.commits.extend(std::iter::repeat_n(fault, count));
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next_connections(&self, count: usize) {
        let mut plan = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        plan.refused_connections += count;
    }

    fn authenticate(&self, auth: &AuthToken) -> DriverResult<()> {
        if self.users.is_empty() {
            return Ok(());
        }
        // Check every user so timing does not depend on which one matched.
        let matched = self
            .users
            .iter()
            .fold(false, |acc, (user, pass)| acc | auth.matches_basic(user, pass));
        if matched {
            Ok(())
        } else {
            Err(DriverError::from_server(
                UNAUTHORIZED,
                "The client is unauthorized due to authentication failure.",
                None,
            ))
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        address: &ServerAddress,
        auth: &AuthToken,
        user_agent: &str,
    ) -> DriverResult<Box<dyn Connection>> {
        {
            let mut plan = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
            if plan.refused_connections > 0 {
                plan.refused_connections -= 1;
                return Err(DriverError::connectivity(
                    format!("Connection refused by {address}"),
                    "Check that the server is running and reachable",
                ));
            }
        }

        self.authenticate(auth)?;

        let id = format!("memory-{}", self.next_id.fetch_add(1, Ordering::AcqRel));
        self.stats.opened.fetch_add(1, Ordering::AcqRel);
        debug!(
            connection_id = %id,
            address = %address,
            scheme = auth.scheme(),
            user_agent = user_agent,
            "Memory connection opened"
        );

        Ok(Box::new(MemoryConnection {
            id,
            graph: Arc::clone(&self.graph),
            stats: Arc::clone(&self.stats),
            faults: Arc::clone(&self.faults),
            statement_delay: self.statement_delay,
            open: true,
            failed: false,
            tx: None,
            result: None,
        }))
    }
}

#[derive(Debug)]
enum PendingOp {
    Create(Node),
    Delete(Vec<i64>),
}

#[derive(Debug)]
struct PendingTx {
    database: String,
    mode: AccessMode,
    ops: Vec<PendingOp>,
    /// Set from the transaction timeout.
    deadline: Option<Instant>,
}

impl PendingTx {
    fn check_deadline(&self) -> DriverResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(DriverError::from_server(
                TRANSACTION_TIMED_OUT,
                "The transaction has been terminated because it exceeded its timeout",
                None,
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
struct PendingResult {
    records: VecDeque<Vec<Value>>,
    query_type: QueryType,
    counters: Counters,
    bookmark: Option<Bookmark>,
}

struct MemoryConnection {
    id: String,
    graph: Arc<MemoryGraph>,
    stats: Arc<ConnectionStats>,
    faults: Arc<Mutex<FaultPlan>>,
    statement_delay: Duration,
    open: bool,
    /// Set by a failure; cleared by `reset`.
    failed: bool,
    tx: Option<PendingTx>,
    result: Option<PendingResult>,
}

impl MemoryConnection {
    fn ensure_usable(&self) -> DriverResult<()> {
        if !self.open {
            return Err(DriverError::connectivity(
                format!("Connection {} is closed", self.id),
                "Acquire a new connection",
            ));
        }
        if self.failed {
            return Err(DriverError::from_server(
                REQUEST_INVALID,
                "Connection must be reset after a failure",
                None,
            ));
        }
        Ok(())
    }

    fn fail(&mut self, err: DriverError) -> DriverError {
        if err.is_connectivity() {
            self.open = false;
            self.stats.closed.fetch_add(1, Ordering::AcqRel);
        } else {
            self.failed = true;
        }
        self.tx = None;
        self.result = None;
        err
    }

    fn next_fault(&self, commit: bool) -> Option<Fault> {
        let mut plan = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        if commit {
            plan.commits.pop_front()
        } else {
            plan.statements.pop_front()
        }
    }

    fn fault_error(&self, fault: Fault, query: Option<&Query>) -> DriverError {
        match fault {
            Fault::Disconnect => DriverError::connectivity(
                format!("Connection {} reset by peer", self.id),
                "Retry the unit of work on a new connection",
            ),
            Fault::Deadlock => DriverError::from_server(
                DEADLOCK_DETECTED,
                "ForsetiClient can't acquire ExclusiveLock: deadlock detected",
                query,
            ),
            Fault::LeaderSwitch => DriverError::from_server(
                NOT_A_LEADER,
                "No write operations are allowed on this database; this instance is not the leader",
                query,
            ),
        }
    }

    fn start(&self, request: &BeginRequest) -> DriverResult<PendingTx> {
        let database = request
            .database
            .clone()
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string());
        if !self.graph.state().databases.contains_key(&database) {
            return Err(DriverError::from_server(
                DATABASE_NOT_FOUND,
                format!("Database does not exist. Database name: '{database}'."),
                None,
            ));
        }
        *self
            .stats
            .last_bookmarks
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = request.bookmarks.clone();
        Ok(PendingTx {
            database,
            mode: request.access_mode,
            ops: Vec::new(),
            deadline: request.config.timeout.map(|timeout| Instant::now() + timeout),
        })
    }

    fn execute(&self, query: &Query, tx: &mut PendingTx) -> DriverResult<(Vec<String>, PendingResult)> {
        let statement = Statement::parse(query.text()).map_err(|e| server_error(e, query))?;

        if statement.is_write() && tx.mode == AccessMode::Read {
            return Err(DriverError::from_server(
                ACCESS_MODE,
                "Writing in read access mode not allowed.",
                Some(query),
            ));
        }

        let params = query.params();
        let mut counters = Counters::default();
        let mut records = VecDeque::new();

        match &statement {
            Statement::Return(projections) => {
                let row = projections
                    .iter()
                    .map(|p| p.expr.eval(params))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| server_error(e, query))?;
                records.push_back(row);
            }
            Statement::Create { pattern, returns } => {
                let props = pattern.eval_props(params).map_err(|e| server_error(e, query))?;
                let id = {
                    let mut state = self.graph.state();
                    state.next_id += 1;
                    state.next_id
                };
                counters.nodes_created = 1;
                counters.labels_added = pattern.label.iter().count() as u64;
                counters.properties_set = props.len() as u64;
                let node = Node::new(id, pattern.label.iter().cloned().collect(), props);
                if returns.is_some() {
                    records.push_back(vec![Value::Node(node.clone())]);
                }
                tx.ops.push(PendingOp::Create(node));
            }
            Statement::Match { pattern, action } => {
                let props = pattern.eval_props(params).map_err(|e| server_error(e, query))?;
                let matched: Vec<Node> = self
                    .visible_nodes(tx)
                    .into_iter()
                    .filter(|node| matches_pattern(node, pattern, &props))
                    .collect();
                match action {
                    MatchAction::ReturnNode { .. } => {
                        records.extend(matched.into_iter().map(|n| vec![Value::Node(n)]));
                    }
                    MatchAction::Count { .. } => {
                        records.push_back(vec![Value::Int(matched.len() as i64)]);
                    }
                    MatchAction::Delete => {
                        counters.nodes_deleted = matched.len() as u64;
                        tx.ops
                            .push(PendingOp::Delete(matched.iter().map(|n| n.id).collect()));
                    }
                }
            }
        }

        Ok((
            statement.keys(),
            PendingResult {
                records,
                query_type: statement.query_type(),
                counters,
                bookmark: None,
            },
        ))
    }

    /// Committed nodes with the transaction's own writes applied.
    fn visible_nodes(&self, tx: &PendingTx) -> Vec<Node> {
        let committed = self
            .graph
            .state()
            .databases
            .get(&tx.database)
            .cloned()
            .unwrap_or_default();
        apply_ops(committed, &tx.ops)
    }

    fn apply(&self, tx: PendingTx) -> DriverResult<Bookmark> {
        let mut state = self.graph.state();
        let committed = state.databases.get(&tx.database).cloned().unwrap_or_default();
        let nodes = apply_ops(committed, &tx.ops);

        for (label, property) in &state.unique {
            let mut seen: Vec<&Value> = Vec::new();
            for value in nodes
                .iter()
                .filter(|n| n.has_label(label))
                .filter_map(|n| n.get(property))
            {
                if seen.contains(&value) {
                    return Err(DriverError::from_server(
                        CONSTRAINT_VALIDATION_FAILED,
                        format!(
                            "Node already exists with label `{label}` and property `{property}` = {}",
                            serde_json::to_string(value).unwrap_or_default()
                        ),
                        None,
                    ));
                }
                seen.push(value);
            }
        }

        state.databases.insert(tx.database.clone(), nodes);
        state.bookmark_seq += 1;
        self.stats.commits.fetch_add(1, Ordering::AcqRel);
        Ok(Bookmark::new(format!("memory:{}:{}", tx.database, state.bookmark_seq)))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn begin(&mut self, request: &BeginRequest) -> DriverResult<()> {
        self.ensure_usable()?;
        if self.tx.is_some() {
            return Err(self.fail(DriverError::from_server(
                REQUEST_INVALID,
                "A transaction is already open on this connection",
                None,
            )));
        }
        match self.start(request) {
            Ok(tx) => {
                self.tx = Some(tx);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn run(
        &mut self,
        query: &Query,
        autocommit: Option<&BeginRequest>,
    ) -> DriverResult<RunResponse> {
        self.ensure_usable()?;
        self.stats.statements.fetch_add(1, Ordering::AcqRel);

        if !self.statement_delay.is_zero() {
            tokio::time::sleep(self.statement_delay).await;
        }

        if let Some(fault) = self.next_fault(false) {
            let err = self.fault_error(fault, Some(query));
            return Err(self.fail(err));
        }

        let mut tx = match (autocommit, self.tx.take()) {
            (Some(request), None) => match self.start(request) {
                Ok(tx) => tx,
                Err(e) => return Err(self.fail(e.with_query(query))),
            },
            (None, Some(tx)) => {
                if let Err(e) = tx.check_deadline() {
                    return Err(self.fail(e.with_query(query)));
                }
                tx
            }
            (Some(_), Some(_)) => {
                return Err(self.fail(DriverError::from_server(
                    REQUEST_INVALID,
                    "Cannot run an auto-commit statement inside an open transaction",
                    Some(query),
                )));
            }
            (None, None) => {
                return Err(self.fail(DriverError::from_server(
                    REQUEST_INVALID,
                    "No transaction is open on this connection",
                    Some(query),
                )));
            }
        };

        let (keys, mut result) = match self.execute(query, &mut tx) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail(e)),
        };

        if autocommit.is_some() {
            match self.apply(tx) {
                Ok(bookmark) => result.bookmark = Some(bookmark),
                Err(e) => return Err(self.fail(e.with_query(query))),
            }
        } else {
            self.tx = Some(tx);
        }

        debug!(
            connection_id = %self.id,
            keys = ?keys,
            records = result.records.len(),
            "Statement executed"
        );
        self.result = Some(result);
        Ok(RunResponse { keys })
    }

    async fn pull(&mut self, n: usize) -> DriverResult<PullResponse> {
        self.ensure_usable()?;
        let Some(result) = self.result.as_mut() else {
            return Err(self.fail(DriverError::from_server(
                REQUEST_INVALID,
                "No statement to pull records from",
                None,
            )));
        };

        let take = n.min(result.records.len());
        let records: Vec<Vec<Value>> = result.records.drain(..take).collect();
        if !result.records.is_empty() {
            return Ok(PullResponse {
                records,
                has_more: true,
                ..PullResponse::default()
            });
        }

        let done = self.result.take();
        Ok(PullResponse {
            records,
            has_more: false,
            query_type: done.as_ref().map(|r| r.query_type),
            counters: done.as_ref().map(|r| r.counters.clone()).unwrap_or_default(),
            bookmark: done.and_then(|r| r.bookmark),
        })
    }

    async fn commit(&mut self) -> DriverResult<Option<Bookmark>> {
        self.ensure_usable()?;
        if let Some(fault) = self.next_fault(true) {
            let err = self.fault_error(fault, None);
            return Err(self.fail(err));
        }
        let Some(tx) = self.tx.take() else {
            return Err(self.fail(DriverError::from_server(
                REQUEST_INVALID,
                "No transaction is open on this connection",
                None,
            )));
        };
        self.result = None;
        if let Err(e) = tx.check_deadline() {
            return Err(self.fail(e));
        }
        match self.apply(tx) {
            Ok(bookmark) => Ok(Some(bookmark)),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.ensure_usable()?;
        self.tx = None;
        self.result = None;
        Ok(())
    }

    async fn reset(&mut self) -> DriverResult<()> {
        if !self.open {
            return Err(DriverError::connectivity(
                format!("Connection {} is closed", self.id),
                "Acquire a new connection",
            ));
        }
        self.failed = false;
        self.tx = None;
        self.result = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            self.tx = None;
            self.result = None;
            self.stats.closed.fetch_add(1, Ordering::AcqRel);
        }
    }
}

fn server_error(err: StatementError, query: &Query) -> DriverError {
    DriverError::from_server(err.code, err.message, Some(query))
}

fn matches_pattern(node: &Node, pattern: &Pattern, props: &BTreeMap<String, Value>) -> bool {
    pattern.label.as_deref().is_none_or(|label| node.has_label(label))
        && props.iter().all(|(key, value)| node.get(key) == Some(value))
}

fn apply_ops(mut nodes: Vec<Node>, ops: &[PendingOp]) -> Vec<Node> {
    for op in ops {
        match op {
            PendingOp::Create(node) => nodes.push(node.clone()),
            PendingOp::Delete(ids) => nodes.retain(|n| !ids.contains(&n.id)),
        }
    }
    nodes
}
