//! Graph Session - walkthrough binary.
//!
//! Creates the process-wide driver against the in-process graph, verifies
//! connectivity, writes a node in a managed write transaction, reads it back
//! in a managed read transaction and shuts the driver down.

use clap::Parser;
use graph_session::config::Config;
use graph_session::models::Value;
use graph_session::{
    AuthToken, DriverError, MemoryConnector, MemoryGraph, Query, SessionConfig, driver,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn walkthrough(config: &Config) -> Result<(), DriverError> {
    // The in-process graph accepts the configured credentials only.
    let graph = MemoryGraph::new();
    if let Some(database) = &config.database {
        graph.create_database(database);
    }
    graph.add_unique_constraint("Person", "name");
    let connector = MemoryConnector::new(graph).with_user(&config.user, &config.password);

    let driver = driver::init(
        &config.uri,
        AuthToken::basic(&config.user, &config.password),
        config.driver_config(),
        Arc::new(connector),
    )?;
    driver.verify_connectivity().await?;
    info!(uri = %driver.uri(), "Connectivity verified");

    let session = driver.session(SessionConfig::write())?;
    let name = config.name.clone();
    let created = session
        .write_transaction(|tx| {
            let name = name.clone();
            async move {
                let query = Query::new("CREATE (p:Person {name: $name}) RETURN p").param("name", name);
                tx.run(query).await?.single()
            }
        })
        .await?;
    let bookmarks = session.last_bookmarks();
    session.close().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&created.into_map()).unwrap_or_default()
    );

    let session = driver.session(
        SessionConfig::builder()
            .with_default_access_mode(graph_session::AccessMode::Read)
            .with_bookmarks(bookmarks)
            .build(),
    )?;
    let count = session
        .read_transaction(|tx| async move {
            let record = tx
                .run("MATCH (p:Person) RETURN count(p) AS people")
                .await?
                .single()?;
            Ok(record.get("people").and_then(Value::as_i64).unwrap_or(0))
        })
        .await?;
    session.close().await;
    info!(people = count, "Read back people");

    let metrics = driver.metrics();
    info!(
        created = metrics.created,
        idle = metrics.idle,
        in_use = metrics.in_use,
        "Pool metrics"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!(uri = %config.uri, "Starting Graph Session v{}", env!("CARGO_PKG_VERSION"));

    let result = tokio::select! {
        result = walkthrough(&config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };
    driver::shutdown().await;

    if let Err(e) = result {
        error!(error = %e, suggestion = ?e.suggestion(), "Walkthrough failed");
        return Err(e.into());
    }

    info!("Shutdown complete");
    Ok(())
}
