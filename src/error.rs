//! Error types for the graph session manager.
//!
//! This module defines all error types using `thiserror`. Every variant carries
//! enough context (query text, parameters, transaction or session id) for the
//! caller to log the failure without re-deriving state.

use crate::models::{Params, Query};
use thiserror::Error;

/// Server status codes that look transient but must not be retried.
const NON_RETRYABLE_TRANSIENT_CODES: &[&str] = &[
    "Neo.TransientError.Transaction.Terminated",
    "Neo.TransientError.Transaction.LockClientStopped",
];

/// Client-class server status codes raised while a cluster changes leader.
const LEADER_SWITCH_CODES: &[&str] = &[
    "Neo.ClientError.Cluster.NotALeader",
    "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase",
];

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Authentication failed: {message}")]
    Authentication {
        message: String,
        /// Server status code, e.g. "Neo.ClientError.Security.Unauthorized"
        code: Option<String>,
    },

    #[error("Connectivity failure: {message}")]
    Connectivity {
        message: String,
        suggestion: String,
        query: Option<String>,
        params: Params,
    },

    #[error(
        "Connection pool exhausted: no connection to '{database}' became available within {waited_ms}ms (max size {max_size})"
    )]
    PoolExhausted {
        database: String,
        max_size: u32,
        waited_ms: u64,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
        #[source]
        cause: Option<Box<DriverError>>,
    },

    #[error("Statement failed [{code}]: {message}")]
    Statement {
        code: String,
        message: String,
        query: Option<String>,
        params: Params,
    },

    #[error("Transient failure [{code}]: {message}")]
    Transient {
        code: String,
        message: String,
        query: Option<String>,
        params: Params,
    },

    #[error("Session '{session_id}' is closed")]
    SessionClosed { session_id: String },

    #[error("Concurrent access to session '{session_id}': {operation} overlaps another unit of work")]
    ConcurrentAccess {
        session_id: String,
        operation: String,
    },

    #[error("Driver is closed")]
    DriverClosed,

    #[error("Expected exactly one record, found {count}")]
    ResultNotSingle { count: usize },

    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    #[error("Application error: {message}")]
    Application {
        message: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("A global driver is already initialized; call shutdown() first")]
    AlreadyInitialized,

    #[error("No global driver has been initialized")]
    NotInitialized,
}

impl DriverError {
    /// Create an authentication error.
    pub fn authentication(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            code,
        }
    }

    /// Create a connectivity error with a helpful suggestion.
    pub fn connectivity(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
            suggestion: suggestion.into(),
            query: None,
            params: Params::new(),
        }
    }

    /// Create a pool exhaustion error.
    pub fn pool_exhausted(database: impl Into<String>, max_size: u32, waited_ms: u64) -> Self {
        Self::PoolExhausted {
            database: database.into(),
            max_size,
            waited_ms,
        }
    }

    /// Create a transaction state error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
            cause: None,
        }
    }

    /// Create a transaction error wrapping the failure that caused it.
    pub fn transaction_caused_by(
        message: impl Into<String>,
        transaction_id: impl Into<String>,
        cause: DriverError,
    ) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Create a statement error carrying the rejected query.
    pub fn statement(code: impl Into<String>, message: impl Into<String>, query: &Query) -> Self {
        Self::Statement {
            code: code.into(),
            message: message.into(),
            query: Some(query.text().to_string()),
            params: query.params().clone(),
        }
    }

    /// Create a transient server error.
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            code: code.into(),
            message: message.into(),
            query: None,
            params: Params::new(),
        }
    }

    /// Create a session closed error.
    pub fn session_closed(session_id: impl Into<String>) -> Self {
        Self::SessionClosed {
            session_id: session_id.into(),
        }
    }

    /// Create a concurrent access error.
    pub fn concurrent_access(session_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::ConcurrentAccess {
            session_id: session_id.into(),
            operation: operation.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an application error raised from inside a unit of work.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap an arbitrary error raised from inside a unit of work.
    pub fn from_application<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Application {
            message: err.to_string(),
            cause: Some(Box::new(err)),
        }
    }

    /// Map a server failure status code onto the error taxonomy.
    ///
    /// Codes follow the `Neo.<Classification>.<Category>.<Title>` scheme.
    pub fn from_server(code: &str, message: impl Into<String>, query: Option<&Query>) -> Self {
        let message = message.into();

        if code == "Neo.ClientError.Security.Unauthorized"
            || code == "Neo.ClientError.Security.AuthenticationRateLimit"
        {
            return Self::authentication(message, Some(code.to_string()));
        }

        let transient = (code.starts_with("Neo.TransientError.")
            && !NON_RETRYABLE_TRANSIENT_CODES.contains(&code))
            || LEADER_SWITCH_CODES.contains(&code);

        if transient {
            return Self::Transient {
                code: code.to_string(),
                message,
                query: query.map(|q| q.text().to_string()),
                params: query.map(|q| q.params().clone()).unwrap_or_default(),
            };
        }

        Self::Statement {
            code: code.to_string(),
            message,
            query: query.map(|q| q.text().to_string()),
            params: query.map(|q| q.params().clone()).unwrap_or_default(),
        }
    }

    /// Attach query context to a server error that was raised without it.
    pub fn with_query(self, query: &Query) -> Self {
        match self {
            Self::Statement {
                code,
                message,
                query: None,
                ..
            } => Self::statement(code, message, query),
            Self::Transient {
                code,
                message,
                query: None,
                ..
            } => Self::Transient {
                code,
                message,
                query: Some(query.text().to_string()),
                params: query.params().clone(),
            },
            Self::Connectivity {
                message,
                suggestion,
                query: None,
                ..
            } => Self::Connectivity {
                message,
                suggestion,
                query: Some(query.text().to_string()),
                params: query.params().clone(),
            },
            other => other,
        }
    }

    /// The failed query text and parameters, if the error carries them.
    pub fn query_context(&self) -> Option<(&str, &Params)> {
        match self {
            Self::Statement {
                query: Some(query),
                params,
                ..
            }
            | Self::Transient {
                query: Some(query),
                params,
                ..
            }
            | Self::Connectivity {
                query: Some(query),
                params,
                ..
            } => Some((query.as_str(), params)),
            Self::Transaction {
                cause: Some(cause), ..
            } => cause.query_context(),
            _ => None,
        }
    }

    /// Get the server status code for this error, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Authentication { code, .. } => code.as_deref(),
            Self::Statement { code, .. } | Self::Transient { code, .. } => Some(code),
            Self::Transaction {
                cause: Some(cause), ..
            } => cause.code(),
            _ => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connectivity { suggestion, .. } => Some(suggestion),
            Self::Authentication { .. } => Some("Verify the username, password and auth scheme"),
            Self::PoolExhausted { .. } => {
                Some("Increase max_connection_pool_size or release sessions sooner")
            }
            _ => None,
        }
    }

    /// True if this error means the underlying connection can no longer be used.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }

    /// Check if a managed transaction that failed with this error may be re-run.
    ///
    /// Pool exhaustion is surfaced immediately, never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::Transient { .. })
    }
}

impl From<url::ParseError> for DriverError {
    fn from(err: url::ParseError) -> Self {
        DriverError::configuration(format!("Invalid connection URI: {}", err))
    }
}

/// Result type alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;
