//! Connection layer.
//!
//! This module provides the seam between the session manager and the wire
//! protocol:
//! - `Connector` opens physical connections (handshake + authentication)
//! - `Connection` sends begin/run/pull/commit/rollback/reset messages
//! - `ConnectionPool` lends connections to sessions
//! - `memory` is an in-process reference backend implementing both traits

pub mod memory;
pub mod pool;
mod statement;

use crate::auth::AuthToken;
use crate::config::ServerAddress;
use crate::error::DriverResult;
use crate::models::{AccessMode, Bookmark, Counters, Query, QueryType, TransactionConfig, Value};
use async_trait::async_trait;

pub use memory::{ConnectionStats, Fault, MemoryConnector, MemoryGraph};
pub use pool::{ConnectionPool, PoolMetrics, PooledConnection};

/// Everything the server needs to start a transaction.
///
/// Sent explicitly by `Connection::begin`, or along with the statement for
/// auto-commit runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BeginRequest {
    /// None targets the server default database.
    pub database: Option<String>,
    pub access_mode: AccessMode,
    pub bookmarks: Vec<Bookmark>,
    pub config: TransactionConfig,
}

/// Server reply to a statement: the declared return aliases.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResponse {
    pub keys: Vec<String>,
}

/// One batch of records.
///
/// When `has_more` is false the statement is complete and the summary fields
/// are populated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullResponse {
    pub records: Vec<Vec<Value>>,
    pub has_more: bool,
    pub query_type: Option<QueryType>,
    pub counters: Counters,
    /// Issued for auto-commit statements once they are durable.
    pub bookmark: Option<Bookmark>,
}

/// Opens physical connections to a server endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection, negotiate the protocol and authenticate.
    ///
    /// Bad credentials must surface as `DriverError::Authentication`, network
    /// failures as `DriverError::Connectivity`.
    async fn connect(
        &self,
        address: &ServerAddress,
        auth: &AuthToken,
        user_agent: &str,
    ) -> DriverResult<Box<dyn Connection>>;
}

/// One physical connection speaking the request/response protocol.
///
/// Any `DriverError::Connectivity` returned by a method means the connection
/// is unusable; the pool closes it instead of recycling it.
#[async_trait]
pub trait Connection: Send {
    /// Identifier assigned by the server, used in logs.
    fn id(&self) -> &str;

    /// Start an explicit transaction.
    async fn begin(&mut self, request: &BeginRequest) -> DriverResult<()>;

    /// Send a statement. `autocommit` carries the transaction metadata when
    /// the statement runs outside an explicit transaction.
    async fn run(
        &mut self,
        query: &Query,
        autocommit: Option<&BeginRequest>,
    ) -> DriverResult<RunResponse>;

    /// Fetch up to `n` records of the current statement.
    async fn pull(&mut self, n: usize) -> DriverResult<PullResponse>;

    /// Commit the open transaction, returning the bookmark it produced.
    async fn commit(&mut self) -> DriverResult<Option<Bookmark>>;

    async fn rollback(&mut self) -> DriverResult<()>;

    /// Return the connection to a clean state, discarding any open
    /// transaction or failure.
    async fn reset(&mut self) -> DriverResult<()>;

    fn is_open(&self) -> bool;

    async fn close(&mut self);
}
