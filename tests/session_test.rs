//! Integration tests for sessions and transactions.

mod common;

use common::{driver_with, fast_retry, pool, setup};
use graph_session::connection::Fault;
use graph_session::models::TransactionKind;
use graph_session::{
    AccessMode, DriverError, DriverResult, MemoryConnector, MemoryGraph, Query, SessionConfig,
    TransactionState, Value, params,
};
use std::time::Duration;

#[tokio::test]
async fn test_write_transaction_creates_person() {
    let t = setup();
    let session = t.driver.session(SessionConfig::default()).unwrap();

    let record = session
        .write_transaction(|tx| async move {
            let query = Query::with_params(
                "CREATE (p:Person {name: $name}) RETURN p",
                params! { "name" => "Michael" },
            );
            tx.run(query).await?.single()
        })
        .await
        .unwrap();

    let person = record.get("p").and_then(Value::as_node).unwrap();
    assert!(person.has_label("Person"));
    assert_eq!(person.get("name"), Some(&Value::from("Michael")));
    assert_eq!(t.graph.node_count("neo4j"), 1);
    session.close().await;
}

#[tokio::test]
async fn test_parameters_round_trip() {
    let t = setup();
    let session = t.driver.session(SessionConfig::default()).unwrap();

    let params = params! {
        "s" => "text",
        "i" => -42,
        "f" => 3.5,
        "b" => true,
        "n" => Value::Null,
        "list" => vec![Value::from(1), Value::from("two"), Value::Null],
        "map" => params! { "inner" => vec![1, 2], "flag" => false, "deep" => params! { "x" => "y" } },
    };
    let query = Query::with_params(
        "RETURN $s AS s, $i AS i, $f AS f, $b AS b, $n AS n, $list AS list, $map AS map",
        params.clone(),
    );

    let record = session.run(query).await.unwrap().single().unwrap();
    for (key, value) in &params {
        assert_eq!(record.get(key), Some(value), "parameter {key}");
    }
}

#[tokio::test]
async fn test_only_one_open_transaction_per_session() {
    let t = setup();
    let session = t.driver.session(SessionConfig::default()).unwrap();

    let tx = session.begin_transaction().await.unwrap();
    assert_eq!(tx.kind(), TransactionKind::Explicit);
    assert!(tx.id().starts_with("tx_"));

    let second = session.begin_transaction().await;
    assert!(matches!(second, Err(DriverError::Transaction { .. })));

    let managed: DriverResult<()> = session.write_transaction(|_tx| async { Ok(()) }).await;
    assert!(matches!(managed, Err(DriverError::Transaction { .. })));

    tx.commit().await.unwrap();
    let third = session.begin_transaction().await.unwrap();
    third.rollback().await.unwrap();
}

#[tokio::test]
async fn test_close_rolls_back_open_transaction() {
    let t = setup();
    let session = t.driver.session(SessionConfig::default()).unwrap();

    let tx = session.begin_transaction().await.unwrap();
    tx.run("CREATE (p:Person {name: 'Ann'})").await.unwrap();
    session.close().await;

    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(t.graph.node_count("neo4j"), 0);
    assert!(matches!(
        tx.run("RETURN 1").await,
        Err(DriverError::SessionClosed { .. })
    ));
    assert!(matches!(
        tx.commit().await,
        Err(DriverError::SessionClosed { .. })
    ));

    let metrics = t.driver.metrics();
    assert_eq!(metrics.in_use, 0);
    assert_eq!(metrics.idle, 1);
}

#[tokio::test]
async fn test_closed_session_rejects_every_operation() {
    let t = setup();
    let session = t.driver.session(SessionConfig::default()).unwrap();
    session.close().await;
    session.close().await;

    assert!(matches!(
        session.run("RETURN 1").await,
        Err(DriverError::SessionClosed { .. })
    ));
    assert!(matches!(
        session.begin_transaction().await,
        Err(DriverError::SessionClosed { .. })
    ));
    let result: DriverResult<()> = session.read_transaction(|_tx| async { Ok(()) }).await;
    assert!(matches!(result, Err(DriverError::SessionClosed { .. })));
}

#[tokio::test]
async fn test_close_cancels_in_flight_work() {
    let connector =
        MemoryConnector::new(MemoryGraph::new()).with_statement_delay(Duration::from_millis(300));
    let t = driver_with(connector, pool(2, 1000), fast_retry(5));
    let session = t.driver.session(SessionConfig::default()).unwrap();

    let (work, _) = tokio::join!(
        session.write_transaction(|tx| async move {
            tx.run("CREATE (p:Person {name: 'Ann'})").await?;
            Ok(())
        }),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            session.close().await;
        }
    );

    assert!(matches!(work, Err(DriverError::SessionClosed { .. })));
    assert_eq!(t.graph.node_count("neo4j"), 0);

    // The interrupted connection is discarded, not returned to the pool.
    let metrics = t.driver.metrics();
    assert_eq!(metrics.in_use, 0);
    assert_eq!(metrics.idle, 0);
}

#[tokio::test]
async fn test_overlapping_calls_fail_with_concurrent_access() {
    let connector =
        MemoryConnector::new(MemoryGraph::new()).with_statement_delay(Duration::from_millis(200));
    let t = driver_with(connector, pool(2, 1000), fast_retry(5));
    let session = t.driver.session(SessionConfig::default()).unwrap();

    let (first, second) = tokio::join!(session.run("RETURN 1 AS one"), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.run("RETURN 2 AS two").await
    });

    assert!(first.is_ok());
    assert!(matches!(
        second,
        Err(DriverError::ConcurrentAccess { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_statements_in_one_transaction_are_rejected() {
    let connector =
        MemoryConnector::new(MemoryGraph::new()).with_statement_delay(Duration::from_millis(200));
    let t = driver_with(connector, pool(2, 1000), fast_retry(5));
    let session = t.driver.session(SessionConfig::default()).unwrap();
    let tx = session.begin_transaction().await.unwrap();

    let (first, second) = tokio::join!(tx.run("RETURN 1"), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.run("RETURN 2").await
    });
    assert!(first.is_ok());
    assert!(matches!(
        second,
        Err(DriverError::ConcurrentAccess { .. })
    ));
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_transaction_state_machine() {
    let t = setup();
    let session = t.driver.session(SessionConfig::default()).unwrap();

    let tx = session.begin_transaction().await.unwrap();
    assert_eq!(tx.state(), TransactionState::Open);
    tx.rollback().await.unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert!(matches!(
        tx.commit().await,
        Err(DriverError::Transaction { .. })
    ));

    let tx = session.begin_transaction().await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);
    assert!(matches!(
        tx.rollback().await,
        Err(DriverError::Transaction { .. })
    ));
    assert!(matches!(
        tx.run("RETURN 1").await,
        Err(DriverError::Transaction { .. })
    ));
    assert!(tx.info().elapsed() >= chrono::Duration::zero());
}

#[tokio::test]
async fn test_statements_apply_in_order() {
    let t = setup();
    let session = t.driver.session(SessionConfig::default()).unwrap();

    let tx = session.begin_transaction().await.unwrap();
    tx.run("CREATE (p:Person {name: 'Ann'})").await.unwrap();
    tx.run("CREATE (p:Person {name: 'Bob'})").await.unwrap();
    tx.run("MATCH (p:Person {name: 'Ann'}) DETACH DELETE p")
        .await
        .unwrap();
    let names: Vec<String> = tx
        .run("MATCH (p:Person) RETURN p")
        .await
        .unwrap()
        .filter_map(|r| {
            r.get("p")
                .and_then(Value::as_node)
                .and_then(|n| n.get("name"))
                .and_then(Value::as_str)
                .map(String::from)
        })
        .collect();
    assert_eq!(names, vec!["Bob".to_string()]);
    tx.commit().await.unwrap();
    assert_eq!(t.graph.node_count("neo4j"), 1);
}

#[tokio::test]
async fn test_statement_failure_marks_transaction_failed() {
    let t = setup();
    let session = t.driver.session(SessionConfig::default()).unwrap();

    let tx = session.begin_transaction().await.unwrap();
    let err = tx.run("MERGE (p:Person)").await.unwrap_err();
    match &err {
        DriverError::Statement { code, query, .. } => {
            assert_eq!(code, "Neo.ClientError.Statement.SyntaxError");
            assert_eq!(query.as_deref(), Some("MERGE (p:Person)"));
        }
        other => panic!("expected statement error, got {other:?}"),
    }
    assert_eq!(tx.state(), TransactionState::Failed);
    assert!(matches!(
        tx.run("RETURN 1").await,
        Err(DriverError::Transaction { .. })
    ));
    tx.rollback().await.unwrap();

    // The connection was reset and is reusable.
    assert_eq!(t.driver.metrics().idle, 1);
    session.run("RETURN 1").await.unwrap();
}

#[tokio::test]
async fn test_constraint_violation_rejects_commit() {
    let t = setup();
    t.graph.add_unique_constraint("Person", "name");
    let session = t.driver.session(SessionConfig::default()).unwrap();
    session
        .run("CREATE (p:Person {name: 'Ann'})")
        .await
        .unwrap();

    let tx = session.begin_transaction().await.unwrap();
    tx.run("CREATE (p:Person {name: 'Bob'})").await.unwrap();
    tx.run("CREATE (p:Person {name: 'Ann'})").await.unwrap();
    let err = tx.commit().await.unwrap_err();

    assert!(matches!(err, DriverError::Transaction { .. }));
    assert_eq!(
        err.code(),
        Some("Neo.ClientError.Schema.ConstraintValidationFailed")
    );
    assert_eq!(tx.state(), TransactionState::Failed);
    assert_eq!(t.graph.node_count("neo4j"), 1);
}

#[tokio::test]
async fn test_commit_connectivity_loss_is_unknown_outcome() {
    let t = setup();
    let session = t.driver.session(SessionConfig::default()).unwrap();

    let tx = session.begin_transaction().await.unwrap();
    tx.run("CREATE (p:Person {name: 'Ann'})").await.unwrap();
    t.connector.fail_next_commits(Fault::Disconnect, 1);
    let err = tx.commit().await.unwrap_err();

    assert!(matches!(err, DriverError::Transaction { .. }));
    assert!(err.to_string().contains("commit outcome unknown"));
    assert!(!err.is_retryable());
    assert_eq!(tx.state(), TransactionState::Failed);
    assert_eq!(t.driver.metrics().idle, 0);
}

#[tokio::test]
async fn test_transient_commit_failure_is_returned_unwrapped() {
    let t = setup();
    let session = t.driver.session(SessionConfig::default()).unwrap();

    let tx = session.begin_transaction().await.unwrap();
    tx.run("CREATE (p:Person {name: 'Ann'})").await.unwrap();
    t.connector.fail_next_commits(Fault::Deadlock, 1);
    let err = tx.commit().await.unwrap_err();

    assert!(matches!(err, DriverError::Transient { .. }));
    assert!(err.is_retryable());
    assert_eq!(tx.state(), TransactionState::Failed);
    assert_eq!(t.graph.node_count("neo4j"), 0);

    // The server rolled back; the connection is reset and kept.
    assert_eq!(t.driver.metrics().idle, 1);
    session.run("RETURN 1").await.unwrap();
}

#[tokio::test]
async fn test_connectivity_error_carries_query_context() {
    let t = setup();
    let session = t.driver.session(SessionConfig::default()).unwrap();
    t.connector.fail_next_statements(Fault::Disconnect, 1);

    let err = session
        .run(Query::new("RETURN $x AS x").param("x", 42))
        .await
        .unwrap_err();

    assert!(err.is_connectivity());
    let (query, params) = err.query_context().unwrap();
    assert_eq!(query, "RETURN $x AS x");
    assert_eq!(params.get("x"), Some(&Value::Int(42)));
}

#[tokio::test]
async fn test_bookmarks_chain_sessions() {
    let t = setup();
    let writer = t.driver.session(SessionConfig::default()).unwrap();
    writer
        .write_transaction(|tx| async move {
            tx.run("CREATE (p:Person {name: 'Ann'})").await?;
            Ok(())
        })
        .await
        .unwrap();
    let bookmarks = writer.last_bookmarks();
    assert_eq!(bookmarks.len(), 1);
    writer.close().await;

    let reader = t
        .driver
        .session(
            SessionConfig::builder()
                .with_default_access_mode(AccessMode::Read)
                .with_bookmarks(bookmarks.clone())
                .build(),
        )
        .unwrap();
    let count = reader
        .read_transaction(|tx| async move {
            let record = tx
                .run("MATCH (p:Person) RETURN count(p) AS n")
                .await?
                .single()?;
            Ok(record.get("n").and_then(Value::as_i64))
        })
        .await
        .unwrap();

    assert_eq!(count, Some(1));
    assert_eq!(t.connector.stats().last_bookmarks(), bookmarks);
}

#[tokio::test]
async fn test_read_session_rejects_writes() {
    let t = setup();
    let session = t.driver.session(SessionConfig::read()).unwrap();
    let err = session
        .run("CREATE (p:Person {name: 'Ann'})")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("Neo.ClientError.Statement.AccessMode"));
    assert_eq!(t.graph.node_count("neo4j"), 0);
}

#[tokio::test]
async fn test_broken_connection_is_not_reused() {
    let t = setup();
    let session = t.driver.session(SessionConfig::default()).unwrap();
    t.connector.fail_next_statements(Fault::Disconnect, 1);

    let err = session.run("RETURN 1").await.unwrap_err();
    assert!(err.is_connectivity());
    let metrics = t.driver.metrics();
    assert_eq!(metrics.idle, 0);
    assert_eq!(metrics.in_use, 0);

    session.run("RETURN 1").await.unwrap();
    assert_eq!(t.connector.stats().opened(), 2);
}

#[tokio::test]
async fn test_fetch_size_does_not_change_results() {
    let t = setup();
    let session = t
        .driver
        .session(SessionConfig::builder().with_fetch_size(2).build())
        .unwrap();
    for n in 0..7 {
        session
            .run(Query::new("CREATE (i:Item {n: $n})").param("n", n))
            .await
            .unwrap();
    }
    let stream = session.run("MATCH (i:Item) RETURN i").await.unwrap();
    assert_eq!(stream.keys(), ["i".to_string()]);
    assert_eq!(stream.len(), 7);
    let summary = stream.consume();
    assert_eq!(summary.query.text(), "MATCH (i:Item) RETURN i");
}

#[tokio::test]
async fn test_unknown_database_is_statement_error() {
    let t = setup();
    let session = t
        .driver
        .session(SessionConfig::builder().with_database("movies").build())
        .unwrap();
    let err = session.run("RETURN 1").await.unwrap_err();
    assert_eq!(err.code(), Some("Neo.ClientError.Database.DatabaseNotFound"));

    t.graph.create_database("movies");
    session.run("CREATE (m:Movie {title: 'Heat'})").await.unwrap();
    assert_eq!(t.graph.node_count("movies"), 1);
    assert_eq!(t.graph.node_count("neo4j"), 0);
}
