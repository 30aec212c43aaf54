//! Configuration handling for the graph session manager.
//!
//! This module provides driver, pool and retry configuration, connection URI
//! parsing, and the CLI configuration of the demo binary.

use crate::error::{DriverError, DriverResult};
use clap::Parser;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use url::Url;

pub const DEFAULT_PORT: u16 = 7687;
pub const DEFAULT_URI: &str = "neo4j://localhost:7687";
pub const DEFAULT_USER_AGENT: &str = concat!("graph-session/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FETCH_SIZE: usize = crate::models::DEFAULT_FETCH_SIZE;

// Pool configuration defaults
pub const DEFAULT_MAX_POOL_SIZE: u32 = 100;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_CONNECTION_LIFETIME_SECS: u64 = 3600;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

// Retry defaults for managed transactions
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_RETRY_TIME_SECS: u64 = 30;
pub const DEFAULT_INITIAL_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 15_000;
pub const DEFAULT_RETRY_JITTER: f64 = 0.2;

/// Connection pool configuration options.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool, idle plus leased (default: 100)
    pub max_size: Option<u32>,
    /// How long `acquire` waits for a connection in milliseconds (default: 60000)
    pub acquire_timeout_ms: Option<u64>,
    /// Connections older than this are closed instead of reused (default: 3600s)
    pub max_connection_lifetime_secs: Option<u64>,
    /// Idle connections idle longer than this are reset before reuse (default: never)
    pub liveness_check_timeout_secs: Option<u64>,
    /// How long `close` waits for leased connections to come back (default: 30s)
    pub drain_timeout_secs: Option<u64>,
}

impl PoolOptions {
    /// Get max_size with default value.
    pub fn max_size_or_default(&self) -> u32 {
        self.max_size.unwrap_or(DEFAULT_MAX_POOL_SIZE)
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> Duration {
        self.acquire_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS))
    }

    /// Get max_connection_lifetime with default value.
    pub fn max_connection_lifetime_or_default(&self) -> Duration {
        Duration::from_secs(
            self.max_connection_lifetime_secs
                .unwrap_or(DEFAULT_MAX_CONNECTION_LIFETIME_SECS),
        )
    }

    /// Liveness check threshold. None disables the check.
    pub fn liveness_check_timeout(&self) -> Option<Duration> {
        self.liveness_check_timeout_secs.map(Duration::from_secs)
    }

    /// Get drain_timeout with default value.
    pub fn drain_timeout_or_default(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs.unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECS))
    }

    /// Fill unset options from `other`.
    pub fn or(self, other: &PoolOptions) -> PoolOptions {
        PoolOptions {
            max_size: self.max_size.or(other.max_size),
            acquire_timeout_ms: self.acquire_timeout_ms.or(other.acquire_timeout_ms),
            max_connection_lifetime_secs: self
                .max_connection_lifetime_secs
                .or(other.max_connection_lifetime_secs),
            liveness_check_timeout_secs: self
                .liveness_check_timeout_secs
                .or(other.liveness_check_timeout_secs),
            drain_timeout_secs: self.drain_timeout_secs.or(other.drain_timeout_secs),
        }
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_size {
            if max == 0 {
                return Err("max_size must be greater than 0".to_string());
            }
        }
        if let Some(lifetime) = self.max_connection_lifetime_secs {
            if lifetime == 0 {
                return Err("max_connection_lifetime must be greater than 0".to_string());
            }
        }
        Ok(())
    }
}

/// Backoff settings for managed transaction retries.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Retries stop once this much time has passed since the first attempt.
    pub max_retry_time: Duration,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of each delay randomised in both directions, 0.0..=1.0.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            max_retry_time: Duration::from_secs(DEFAULT_MAX_RETRY_TIME_SECS),
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_RETRY_DELAY_MS),
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            max_delay: Duration::from_millis(DEFAULT_MAX_RETRY_DELAY_MS),
            jitter_factor: DEFAULT_RETRY_JITTER,
        }
    }
}

impl RetryConfig {
    /// Retry configuration that never re-runs work.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.multiplier < 1.0 {
            return Err(format!(
                "retry multiplier ({}) must be at least 1.0",
                self.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "jitter_factor ({}) must be between 0.0 and 1.0",
                self.jitter_factor
            ));
        }
        Ok(())
    }
}

/// Driver-wide configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub pool: PoolOptions,
    pub retry: RetryConfig,
    /// Database used by sessions that do not name one. None means the server default.
    pub default_database: Option<String>,
    pub fetch_size: usize,
    /// Timeout for opening a physical connection, handshake included.
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            pool: PoolOptions::default(),
            retry: RetryConfig::default(),
            default_database: None,
            fetch_size: DEFAULT_FETCH_SIZE,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> DriverResult<()> {
        self.pool.validate().map_err(DriverError::configuration)?;
        self.retry.validate().map_err(DriverError::configuration)?;
        if self.fetch_size == 0 {
            return Err(DriverError::configuration(
                "fetch_size must be greater than 0",
            ));
        }
        if let Some(db) = &self.default_database {
            if db.trim().is_empty() {
                return Err(DriverError::configuration(
                    "default_database cannot be empty. Omit it to use the server default.",
                ));
            }
        }
        Ok(())
    }
}

/// Security and routing behaviour selected by the URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriScheme {
    Bolt,
    BoltSecure,
    BoltSelfSigned,
    Neo4j,
    Neo4jSecure,
    Neo4jSelfSigned,
}

/// Transport encryption requested by the URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    Plain,
    /// TLS with full certificate verification
    Verified,
    /// TLS trusting any certificate
    SelfSigned,
}

impl UriScheme {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "bolt" => Some(Self::Bolt),
            "bolt+s" => Some(Self::BoltSecure),
            "bolt+ssc" => Some(Self::BoltSelfSigned),
            "neo4j" => Some(Self::Neo4j),
            "neo4j+s" => Some(Self::Neo4jSecure),
            "neo4j+ssc" => Some(Self::Neo4jSelfSigned),
            _ => None,
        }
    }

    /// Routing schemes discover cluster members and route reads and writes.
    pub fn is_routing(&self) -> bool {
        matches!(self, Self::Neo4j | Self::Neo4jSecure | Self::Neo4jSelfSigned)
    }

    pub fn encryption(&self) -> Encryption {
        match self {
            Self::Bolt | Self::Neo4j => Encryption::Plain,
            Self::BoltSecure | Self::Neo4jSecure => Encryption::Verified,
            Self::BoltSelfSigned | Self::Neo4jSelfSigned => Encryption::SelfSigned,
        }
    }
}

impl std::fmt::Display for UriScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Bolt => "bolt",
            Self::BoltSecure => "bolt+s",
            Self::BoltSelfSigned => "bolt+ssc",
            Self::Neo4j => "neo4j",
            Self::Neo4jSecure => "neo4j+s",
            Self::Neo4jSelfSigned => "neo4j+ssc",
        };
        f.write_str(s)
    }
}

/// Host and port of a server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parsed `scheme://host:port?params` connection string.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionUri {
    pub scheme: UriScheme,
    pub address: ServerAddress,
    /// Query parameters forwarded to the cluster for routing decisions.
    pub routing_context: BTreeMap<String, String>,
    /// Pool options given in the query string.
    pub pool_options: PoolOptions,
}

impl ConnectionUri {
    /// Pool option keys that we extract from URI query parameters.
    const POOL_OPTION_KEYS: &'static [&'static str] = &[
        "max_connection_pool_size",
        "connection_acquisition_timeout",
        "max_connection_lifetime",
    ];

    /// Parse a connection URI.
    ///
    /// # Format
    ///
    /// ```text
    /// neo4j://localhost                          # routing, plain, port 7687
    /// bolt+s://db.example.com:7777               # direct, TLS
    /// neo4j://host?region=eu&max_connection_pool_size=10
    /// ```
    pub fn parse(s: &str) -> DriverResult<Self> {
        let mut url = Url::parse(s.trim())?;

        let scheme = UriScheme::parse(url.scheme()).ok_or_else(|| {
            DriverError::configuration(format!(
                "Unsupported URI scheme '{}'. Use bolt, bolt+s, bolt+ssc, neo4j, neo4j+s or neo4j+ssc",
                url.scheme()
            ))
        })?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DriverError::configuration("Connection URI must include a host"))?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_PORT);

        if !matches!(url.path(), "" | "/") {
            return Err(DriverError::configuration(format!(
                "Connection URI must not contain a path, found '{}'",
                url.path()
            )));
        }

        let mut opts = Self::extract_options(&mut url, Self::POOL_OPTION_KEYS);
        let pool_options = PoolOptions {
            max_size: opts
                .remove("max_connection_pool_size")
                .and_then(|v| v.parse().ok()),
            acquire_timeout_ms: opts
                .remove("connection_acquisition_timeout")
                .and_then(|v| v.parse().ok()),
            max_connection_lifetime_secs: opts
                .remove("max_connection_lifetime")
                .and_then(|v| v.parse().ok()),
            ..PoolOptions::default()
        };
        pool_options.validate().map_err(DriverError::configuration)?;

        let routing_context: BTreeMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if !routing_context.is_empty() && !scheme.is_routing() {
            return Err(DriverError::configuration(format!(
                "Routing parameters are not supported with scheme '{}'",
                scheme
            )));
        }

        Ok(Self {
            scheme,
            address: ServerAddress::new(host, port),
            routing_context,
            pool_options,
        })
    }

    /// Extract driver options from URI query params, keeping the rest in place.
    fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
        let mut opts = HashMap::new();
        let remaining: Vec<(String, String)> = url
            .query_pairs()
            .filter_map(|(k, v)| {
                let key_lower = k.to_ascii_lowercase();
                if keys.contains(&key_lower.as_str()) {
                    opts.insert(key_lower, v.into_owned());
                    None
                } else {
                    Some((k.into_owned(), v.into_owned()))
                }
            })
            .collect();

        if remaining.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(remaining);
        }
        opts
    }
}

impl std::fmt::Display for ConnectionUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address)
    }
}

/// Configuration for the demo binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "graph-session",
    about = "Walk through driver setup, connectivity checks, sessions and transactions against the in-process graph",
    version,
    author
)]
pub struct Config {
    /// Connection URI, e.g. neo4j://localhost:7687
    #[arg(short = 'a', long, default_value = DEFAULT_URI, env = "GRAPH_URI")]
    pub uri: String,

    /// Username for basic authentication
    #[arg(short, long, default_value = "neo4j", env = "GRAPH_USER")]
    pub user: String,

    /// Password for basic authentication
    #[arg(short, long, default_value = "password", env = "GRAPH_PASSWORD")]
    pub password: String,

    /// Target database (server default when omitted)
    #[arg(short, long, env = "GRAPH_DATABASE")]
    pub database: Option<String>,

    /// Name of the person node created by the walkthrough
    #[arg(long, default_value = "Michael")]
    pub name: String,

    /// Maximum connections in the pool
    #[arg(long, default_value_t = DEFAULT_MAX_POOL_SIZE, env = "GRAPH_MAX_POOL_SIZE")]
    pub max_pool_size: u32,

    /// Connection acquisition timeout in seconds
    #[arg(long, default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS, env = "GRAPH_ACQUIRE_TIMEOUT")]
    pub acquire_timeout: u64,

    /// Attempts for managed transactions, first one included
    #[arg(long, default_value_t = DEFAULT_MAX_RETRY_ATTEMPTS, env = "GRAPH_RETRY_ATTEMPTS")]
    pub retry_attempts: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GRAPH_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "GRAPH_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            user: "neo4j".to_string(),
            password: "password".to_string(),
            database: None,
            name: "Michael".to_string(),
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Build the driver configuration described by the CLI flags.
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            pool: PoolOptions {
                max_size: Some(self.max_pool_size),
                acquire_timeout_ms: Some(self.acquire_timeout * 1000),
                ..PoolOptions::default()
            },
            retry: RetryConfig {
                max_attempts: self.retry_attempts,
                ..RetryConfig::default()
            },
            default_database: self.database.clone(),
            ..DriverConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
