//! Session and transaction data models.
//!
//! This module defines the immutable configuration a session is opened with
//! and the state reported for its transactions.

use crate::models::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default number of records pulled per batch.
pub const DEFAULT_FETCH_SIZE: usize = 1000;

/// Access mode a session or transaction is routed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    #[default]
    Write,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Opaque marker of a committed transaction, used for causal chaining.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bookmark(String);

impl Bookmark {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Bookmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable session configuration, fixed when the session is opened.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionConfig {
    /// Target database. None falls back to the driver default, then the server default.
    pub database: Option<String>,
    pub default_access_mode: AccessMode,
    /// Bookmarks the first transaction of the session must observe.
    pub bookmarks: Vec<Bookmark>,
    /// Records pulled per batch. None uses the driver's fetch size.
    pub fetch_size: Option<usize>,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Shorthand for a read session against the default database.
    pub fn read() -> Self {
        Self::builder()
            .with_default_access_mode(AccessMode::Read)
            .build()
    }

    /// Shorthand for a write session against the default database.
    pub fn write() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    pub fn with_default_access_mode(mut self, mode: AccessMode) -> Self {
        self.config.default_access_mode = mode;
        self
    }

    pub fn with_bookmarks(mut self, bookmarks: impl IntoIterator<Item = Bookmark>) -> Self {
        self.config.bookmarks = bookmarks.into_iter().collect();
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.config.fetch_size = Some(fetch_size);
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

/// Per-transaction settings passed to the server on begin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionConfig {
    /// Server-side timeout after which the transaction is terminated.
    pub timeout: Option<Duration>,
    /// Metadata attached to the transaction, visible in server monitoring.
    pub metadata: BTreeMap<String, Value>,
}

impl TransactionConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// How a transaction was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    AutoCommit,
    ManagedRead,
    ManagedWrite,
    Explicit,
}

impl TransactionKind {
    /// Managed transactions are the only ones covered by the retry policy.
    pub fn is_managed(&self) -> bool {
        matches!(self, Self::ManagedRead | Self::ManagedWrite)
    }
}

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
    /// The connection broke or the server rejected a statement; nothing is durable.
    Failed,
}

impl TransactionState {
    /// Check if the transaction is still open.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if the transaction has ended (committed, rolled back, or failed).
    pub fn is_terminated(&self) -> bool {
        !self.is_open()
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled back"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of a transaction for logging and monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    pub id: String,
    pub session_id: String,
    pub kind: TransactionKind,
    pub database: Option<String>,
    pub access_mode: AccessMode,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub state: TransactionState,
}

impl TransactionInfo {
    /// Time since the transaction began.
    pub fn elapsed(&self) -> chrono::Duration {
        chrono::Utc::now().signed_duration_since(self.started_at)
    }
}
