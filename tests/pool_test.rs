//! Integration tests for connection pooling.

mod common;

use common::{address, driver_with, fast_retry, pool, setup};
use graph_session::connection::ConnectionPool;
use graph_session::{
    AccessMode, AuthToken, DriverError, DriverResult, MemoryConnector, MemoryGraph, PoolOptions,
    SessionConfig,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio_test::{assert_pending, assert_ready_ok, task};

fn single_connection_pool(connector: MemoryConnector) -> ConnectionPool {
    ConnectionPool::new(
        address(),
        AuthToken::none(),
        Arc::new(connector),
        pool(1, 5000),
        "test",
        Duration::from_secs(1),
    )
}

#[tokio::test]
async fn test_waiters_are_served_in_arrival_order() {
    let pool = single_connection_pool(MemoryConnector::new(MemoryGraph::new()));
    let held = pool.acquire(None, AccessMode::Write).await.unwrap();

    let mut first = task::spawn(pool.acquire(None, AccessMode::Write));
    let mut second = task::spawn(pool.acquire(None, AccessMode::Read));
    assert_pending!(first.poll());
    assert_pending!(second.poll());

    held.release().await;
    assert!(first.is_woken());
    assert!(!second.is_woken());

    let lease = assert_ready_ok!(first.poll());
    assert_eq!(lease.mode(), AccessMode::Write);
    assert_pending!(second.poll());

    lease.release().await;
    assert!(second.is_woken());
    let lease = assert_ready_ok!(second.poll());
    assert_eq!(lease.mode(), AccessMode::Read);
    lease.release().await;

    assert_eq!(pool.metrics().created, 1);
}

#[tokio::test]
async fn test_sessions_queue_for_a_full_pool() {
    let connector =
        MemoryConnector::new(MemoryGraph::new()).with_statement_delay(Duration::from_millis(50));
    let t = driver_with(connector, pool(1, 2000), fast_retry(5));
    let first = t.driver.session(SessionConfig::default()).unwrap();
    let second = t.driver.session(SessionConfig::default()).unwrap();
    let third = t.driver.session(SessionConfig::default()).unwrap();

    let (a, b, c) = tokio::join!(
        first.run("RETURN 1 AS n"),
        second.run("RETURN 2 AS n"),
        third.run("RETURN 3 AS n"),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    let metrics = t.driver.metrics();
    assert_eq!(metrics.created, 1);
    assert_eq!(metrics.idle, 1);
    assert_eq!(metrics.in_use, 0);
}

#[tokio::test]
async fn test_pool_exhaustion_is_surfaced_immediately() {
    let t = driver_with(
        MemoryConnector::new(MemoryGraph::new()),
        pool(1, 100),
        fast_retry(5),
    );
    let holder = t.driver.session(SessionConfig::default()).unwrap();
    let tx = holder.begin_transaction().await.unwrap();

    let session = t.driver.session(SessionConfig::default()).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let started = Instant::now();
    let result: DriverResult<()> = session
        .write_transaction(|_tx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, DriverError::PoolExhausted { max_size: 1, .. }));
    assert!(err.suggestion().is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(started.elapsed() < Duration::from_millis(400));

    tx.rollback().await.unwrap();
    session.run("RETURN 1").await.unwrap();
}

#[tokio::test]
async fn test_close_waits_for_leased_connections() {
    let t = setup();
    let session = t.driver.session(SessionConfig::default()).unwrap();
    let tx = session.begin_transaction().await.unwrap();
    tx.run("CREATE (p:Person {name: 'Ann'})").await.unwrap();

    let driver = t.driver.clone();
    let closing = tokio::spawn(async move { driver.close().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!closing.is_finished());
    assert!(matches!(
        t.driver.session(SessionConfig::default()),
        Err(DriverError::DriverClosed)
    ));

    tx.commit().await.unwrap();
    let outstanding = closing.await.unwrap();
    assert_eq!(outstanding, 0);
    assert_eq!(t.graph.node_count("neo4j"), 1);

    // Released into a closed pool, so closed rather than kept idle.
    let metrics = t.driver.metrics();
    assert_eq!(metrics.idle, 0);
    assert_eq!(metrics.in_use, 0);
    assert_eq!(t.connector.stats().closed(), 1);
}

#[tokio::test]
async fn test_close_gives_up_after_drain_timeout() {
    let pool = single_connection_pool(MemoryConnector::new(MemoryGraph::new()));
    let lease = pool.acquire(None, AccessMode::Write).await.unwrap();

    let started = Instant::now();
    assert_eq!(pool.close().await, 1);
    assert!(started.elapsed() >= Duration::from_millis(900));

    assert!(matches!(
        pool.acquire(None, AccessMode::Write).await,
        Err(DriverError::DriverClosed)
    ));
    lease.release().await;
    assert_eq!(pool.metrics().in_use, 0);
    assert_eq!(pool.metrics().idle, 0);
}

#[tokio::test]
async fn test_liveness_check_keeps_healthy_connections() {
    let options = PoolOptions {
        liveness_check_timeout_secs: Some(0),
        ..pool(2, 1000)
    };
    let t = driver_with(MemoryConnector::new(MemoryGraph::new()), options, fast_retry(5));
    let session = t.driver.session(SessionConfig::default()).unwrap();

    for _ in 0..3 {
        session.run("RETURN 1").await.unwrap();
    }
    assert_eq!(t.connector.stats().opened(), 1);
    assert_eq!(t.driver.metrics().created, 1);
}

#[tokio::test]
async fn test_expired_connections_are_replaced() {
    let options = PoolOptions {
        max_connection_lifetime_secs: Some(1),
        ..pool(2, 1000)
    };
    let t = driver_with(MemoryConnector::new(MemoryGraph::new()), options, fast_retry(5));
    let session = t.driver.session(SessionConfig::default()).unwrap();

    session.run("RETURN 1").await.unwrap();
    session.run("RETURN 1").await.unwrap();
    assert_eq!(t.connector.stats().opened(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    session.run("RETURN 1").await.unwrap();
    assert_eq!(t.connector.stats().opened(), 2);
    assert_eq!(t.connector.stats().closed(), 1);

    let metrics = t.driver.metrics();
    assert_eq!(metrics.created, 2);
    assert_eq!(metrics.idle, 1);
}
