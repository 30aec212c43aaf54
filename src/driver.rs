//! Driver: the entry point owning the connection pool.
//!
//! A `Driver` is created once per target endpoint and is a cheap `Clone`
//! handle over shared state. Sessions borrow connections from its pool.
//!
//! A process-wide driver can be managed with `init`, `global` and
//! `shutdown`. The global driver is never created implicitly.

use crate::auth::AuthToken;
use crate::config::{ConnectionUri, DriverConfig, Encryption};
use crate::connection::{ConnectionPool, Connector, PoolMetrics};
use crate::error::{DriverError, DriverResult};
use crate::models::SessionConfig;
use crate::session::{RetryPolicy, Session};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

struct DriverInner {
    uri: ConnectionUri,
    config: DriverConfig,
    pool: ConnectionPool,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("uri", &self.inner.uri.to_string())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Create a driver. No connection is opened until first use; call
    /// `verify_connectivity` to fail fast on a bad endpoint or credentials.
    ///
    /// Pool options given in the URI query string take priority over
    /// `config.pool`.
    pub fn new(
        uri: &str,
        auth: AuthToken,
        config: DriverConfig,
        connector: Arc<dyn Connector>,
    ) -> DriverResult<Self> {
        let uri = ConnectionUri::parse(uri)?;
        let mut config = config;
        config.pool = uri.pool_options.clone().or(&config.pool);
        config.validate()?;

        if uri.scheme.encryption() == Encryption::SelfSigned {
            warn!(uri = %uri, "Self-signed certificates are trusted for this driver");
        }

        let pool = ConnectionPool::new(
            uri.address.clone(),
            auth,
            connector,
            config.pool.clone(),
            config.user_agent.clone(),
            config.connect_timeout,
        );

        info!(
            uri = %uri,
            routing = uri.scheme.is_routing(),
            max_pool_size = config.pool.max_size_or_default(),
            "Driver created"
        );

        Ok(Self {
            inner: Arc::new(DriverInner {
                uri,
                config,
                pool,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn uri(&self) -> &ConnectionUri {
        &self.inner.uri
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.uri.scheme.encryption() != Encryption::Plain
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Open one connection, authenticate, and close it again.
    ///
    /// Bad credentials fail with `DriverError::Authentication`, an
    /// unreachable endpoint with `DriverError::Connectivity`.
    pub async fn verify_connectivity(&self) -> DriverResult<()> {
        self.ensure_open()?;
        self.inner.pool.verify_connectivity().await
    }

    /// Open a session. Sessions are cheap and hold no connection while idle.
    pub fn session(&self, config: SessionConfig) -> DriverResult<Session> {
        self.ensure_open()?;
        if let Some(db) = &config.database {
            if db.trim().is_empty() {
                return Err(DriverError::configuration(
                    "Session database cannot be empty. Omit it to use the default database.",
                ));
            }
        }
        if config.fetch_size == Some(0) {
            return Err(DriverError::configuration(
                "fetch_size must be greater than 0",
            ));
        }

        let database = config
            .database
            .clone()
            .or_else(|| self.inner.config.default_database.clone());

        Ok(Session::new(
            config,
            database,
            self.inner.config.fetch_size,
            self.inner.pool.clone(),
            RetryPolicy::new(self.inner.config.retry.clone()),
        ))
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.inner.pool.metrics()
    }

    /// Close the driver and drain its pool.
    ///
    /// Returns the number of connections still leased when the drain timeout
    /// expired. Idempotent; a repeat call reports the leases still out.
    pub async fn close(&self) -> usize {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return self.inner.pool.close().await;
        }
        let outstanding = self.inner.pool.close().await;
        info!(uri = %self.inner.uri, outstanding = outstanding, "Driver closed");
        outstanding
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.is_closed() {
            Err(DriverError::DriverClosed)
        } else {
            Ok(())
        }
    }
}

/// Process-wide driver managed by `init` and `shutdown`.
static GLOBAL_DRIVER: RwLock<Option<Driver>> = RwLock::new(None);

/// Create the process-wide driver.
///
/// Fails with `AlreadyInitialized` if one exists; call `shutdown` first.
pub fn init(
    uri: &str,
    auth: AuthToken,
    config: DriverConfig,
    connector: Arc<dyn Connector>,
) -> DriverResult<Driver> {
    let mut global = GLOBAL_DRIVER.write().unwrap_or_else(PoisonError::into_inner);
    if global.is_some() {
        return Err(DriverError::AlreadyInitialized);
    }
    let driver = Driver::new(uri, auth, config, connector)?;
    *global = Some(driver.clone());
    Ok(driver)
}

/// The process-wide driver. Fails with `NotInitialized` before `init`.
pub fn global() -> DriverResult<Driver> {
    GLOBAL_DRIVER
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(DriverError::NotInitialized)
}

/// Close and clear the process-wide driver, draining its pool.
///
/// Returns false if no driver was initialized. `init` may be called again
/// afterwards.
pub async fn shutdown() -> bool {
    let driver = GLOBAL_DRIVER
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    match driver {
        Some(driver) => {
            driver.close().await;
            true
        }
        None => false,
    }
}
