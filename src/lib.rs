//! Graph Session Library
//!
//! Client-side session and transaction management for a graph database:
//! a bounded connection pool, sessions that borrow connections per unit of
//! work, explicit and managed transactions, and a retry policy for managed
//! transactions. The wire protocol sits behind the `Connector`/`Connection`
//! traits; an in-process backend is included.

pub mod auth;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod macros;
pub mod models;
pub mod session;

pub use auth::AuthToken;
pub use config::{Config, DriverConfig, PoolOptions, RetryConfig};
pub use connection::{Connection, Connector, MemoryConnector, MemoryGraph, PoolMetrics};
pub use driver::Driver;
pub use error::{DriverError, DriverResult};
pub use models::{
    AccessMode, Bookmark, Node, Params, Query, Record, ResultStream, SessionConfig,
    TransactionConfig, TransactionState, Value,
};
pub use session::{ManagedTransaction, Session, Transaction};
