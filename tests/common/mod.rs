//! Shared setup for integration tests.

#![allow(dead_code)]

use graph_session::config::ServerAddress;
use graph_session::{
    AuthToken, Driver, DriverConfig, MemoryConnector, MemoryGraph, PoolOptions, RetryConfig,
};
use std::sync::Arc;
use std::time::Duration;

pub const URI: &str = "neo4j://localhost:7687";

/// A driver over an in-process graph, plus handles for inspecting it.
pub struct TestDriver {
    pub driver: Driver,
    pub connector: MemoryConnector,
    pub graph: Arc<MemoryGraph>,
}

/// Retry settings with millisecond delays.
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        max_retry_time: Duration::from_secs(10),
        initial_delay: Duration::from_millis(1),
        multiplier: 2.0,
        max_delay: Duration::from_millis(10),
        jitter_factor: 0.0,
    }
}

pub fn pool(max_size: u32, acquire_timeout_ms: u64) -> PoolOptions {
    PoolOptions {
        max_size: Some(max_size),
        acquire_timeout_ms: Some(acquire_timeout_ms),
        drain_timeout_secs: Some(1),
        ..PoolOptions::default()
    }
}

pub fn driver_with(connector: MemoryConnector, pool: PoolOptions, retry: RetryConfig) -> TestDriver {
    let graph = Arc::clone(connector.graph());
    let config = DriverConfig {
        pool,
        retry,
        ..DriverConfig::default()
    };
    let driver = Driver::new(URI, AuthToken::none(), config, Arc::new(connector.clone()))
        .expect("valid driver configuration");
    TestDriver {
        driver,
        connector,
        graph,
    }
}

pub fn setup() -> TestDriver {
    driver_with(
        MemoryConnector::new(MemoryGraph::new()),
        pool(10, 1000),
        fast_retry(5),
    )
}

pub fn address() -> ServerAddress {
    ServerAddress::new("localhost", 7687)
}
