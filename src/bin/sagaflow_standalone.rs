//! sagaflow-standalone: all-in-one local smoke-test runner.
//!
//! Wires Store + Dispatcher + Ingress + Outbox Relay + Saga Engine + Step
//! Executor together in one process against the canonical `OrderProcessing`
//! workflow, ingests one demo record, waits for it to reach `Final`, prints
//! the resulting saga summary, then keeps the relay running until Ctrl-C.
//!
//! Not intended for production use: a real deployment drives `Ingress`
//! from an actual `MessageSource` and serves the monitoring surface over
//! HTTP, both of which live outside this crate.
//!
//! ## Configuration
//! Set via `config.yaml` or `SAGAFLOW_CONFIG`/`SAGAFLOW__*` environment
//! variables. See [`sagaflow::config::Config`].

use std::sync::Arc;
use std::time::Duration;

use sagaflow::config::Config;
use sagaflow::dispatcher::InProcessDispatcher;
use sagaflow::executor::{register as register_executor, StepExecutor};
use sagaflow::ingress::Ingress;
use sagaflow::model::{Record, StepData};
use sagaflow::monitoring::Monitor;
use sagaflow::relay::OutboxRelay;
use sagaflow::saga::workflow::order_processing;
use sagaflow::saga::{register as register_saga, SagaEngine};
use sagaflow::store::SqliteStore;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

fn demo_record() -> Record {
    let mut step_data = StepData::new();
    step_data.insert("order-created".to_string(), serde_json::json!({"order_id": 1}));
    step_data.insert("order-processed".to_string(), serde_json::json!({"amount": 42}));
    step_data.insert("order-shipped".to_string(), serde_json::json!({"carrier": "demo"}));
    Record::new(Uuid::new_v4(), step_data)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("SAGAFLOW_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(None).map_err(|e| {
        error!("failed to load configuration: {e}");
        e
    })?;

    info!("starting sagaflow-standalone");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&config.storage.dsn)
        .await?;
    let store = Arc::new(SqliteStore::new(pool));
    store.init().await?;
    info!(dsn = %config.storage.dsn, "storage initialized");

    let dispatcher = Arc::new(InProcessDispatcher::new());

    let engine = Arc::new(SagaEngine::new(
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        order_processing(),
    ));
    register_saga(Arc::clone(&engine), &dispatcher).await;

    let endpoints: Vec<_> = config.steps.iter().map(|s| s.to_step_endpoint()).collect();
    if endpoints.is_empty() {
        info!("no step endpoints configured; steps will fail until `steps` is set in config");
    }
    let executor = Arc::new(StepExecutor::new(Arc::clone(&dispatcher), endpoints));
    register_executor(Arc::clone(&executor), &dispatcher).await;

    let relay = Arc::new(OutboxRelay::new(
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        config.relay.to_relay_config(),
    ));
    let relay_handle = sagaflow::relay::spawn(Arc::clone(&relay));
    info!("outbox relay started");

    let ingress = Ingress::new(Arc::clone(&store), Arc::clone(&dispatcher), "OrderProcessing");
    let record = demo_record();
    info!(correlation_id = %record.id, "ingesting demo record");
    ingress.ingest(&record).await?;

    let monitor = Monitor::new(Arc::clone(&store));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(summary) = monitor.saga_summary(record.id).await? {
            if summary.current_state == "Final" {
                info!(?summary, "demo saga reached Final");
                break;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            error!("demo saga did not finalize within 30s; leaving relay running");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    info!("relay keeps running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    relay_handle.stop();

    Ok(())
}
