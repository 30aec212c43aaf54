//! Data models for the graph session manager.
//!
//! This module re-exports all model types used throughout the crate.

pub mod query;
pub mod session;
pub mod value;

// Re-export commonly used types
pub use query::{Counters, Query, QueryType, Record, ResultStream, ResultSummary};
pub use session::{
    AccessMode, Bookmark, DEFAULT_FETCH_SIZE, SessionConfig, SessionConfigBuilder,
    TransactionConfig, TransactionInfo, TransactionKind, TransactionState,
};
pub use value::{Node, Params, Value};
