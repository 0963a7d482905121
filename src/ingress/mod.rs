//! Record ingestion: consumes a `MessageSource`, persists each record with
//! its `SagaStarted` outbox row as one transaction, then best-effort
//! publishes directly.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatcher::InProcessDispatcher;
use crate::model::{Event, Record, SagaStartedPayload};
use crate::store::{PendingOutbox, Store, StoreError};

pub type Result<T> = std::result::Result<T, IngressError>;

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("message source error: {0}")]
    Source(String),
}

/// An abstract, at-least-once inbound record feed with explicit
/// acknowledgement. No assumption on partitioning beyond
/// single-writer-per-partition; callers wanting ordered multi-partition
/// ingestion run one `Ingress` per partition.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Block until the next record is available, or `None` once the
    /// source is exhausted (tests only; production sources are infinite).
    async fn next(&self) -> std::result::Result<Option<(u64, Record)>, String>;

    /// Acknowledge delivery of the record tagged `token`. Only called
    /// after the record's Store transaction has committed.
    async fn ack(&self, token: u64) -> std::result::Result<(), String>;
}

fn workflow_event_type(workflow: &str) -> String {
    format!("SagaStarted-{workflow}")
}

/// Runs the Ingress contract for one `MessageSource` partition.
pub struct Ingress<S: Store> {
    store: Arc<S>,
    dispatcher: Arc<InProcessDispatcher>,
    workflow: String,
}

impl<S: Store> Ingress<S> {
    pub fn new(store: Arc<S>, dispatcher: Arc<InProcessDispatcher>, workflow: impl Into<String>) -> Self {
        Self {
            store,
            dispatcher,
            workflow: workflow.into(),
        }
    }

    /// Process a single record per the six-step contract. Returns
    /// `Ok(true)` if a new saga was started, `Ok(false)` if the record was
    /// a duplicate (benign, already acked).
    pub async fn ingest(&self, record: &Record) -> Result<bool> {
        let started_at = Utc::now();
        let payload = SagaStartedPayload {
            correlation_id: record.id,
            original_record: record.clone(),
            started_at,
        };
        let event_type = workflow_event_type(&self.workflow);
        let payload_bytes = serde_json::to_vec(&payload)?;

        let outbox_id = match self
            .store
            .insert_record_and_enqueue(
                record,
                PendingOutbox::new(event_type.clone(), payload_bytes, started_at),
            )
            .await
        {
            Ok(id) => id,
            Err(StoreError::DuplicateKey(id)) => {
                info!(record_id = %id, "duplicate record, already ingested");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };

        info!(record_id = %record.id, outbox_id = %outbox_id, "record ingested, saga started");

        let event = Event::new(event_type, record.id, serde_json::to_value(&payload)?);
        if let Err(err) = self.dispatcher.publish(event).await {
            warn!(correlation_id = %record.id, error = %err, "best-effort publish failed; relay will deliver it");
        }

        Ok(true)
    }

    /// Drive `source` until it is exhausted (or forever, for an infinite
    /// production source) or `shutdown` fires. Acknowledges only after a
    /// successful commit, so a crash between ingest and ack simply
    /// redelivers the record on restart.
    pub async fn run(&self, source: &dyn MessageSource, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("ingress shutting down");
                        break;
                    }
                }
                next = source.next() => {
                    match next.map_err(IngressError::Source)? {
                        Some((token, record)) => {
                            self.ingest(&record).await?;
                            source.ack(token).await.map_err(IngressError::Source)?;
                        }
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }
}

/// In-memory `MessageSource` for tests: a fixed queue of records, acked
/// tokens recorded for assertions.
pub struct InMemoryMessageSource {
    records: tokio::sync::Mutex<std::collections::VecDeque<Record>>,
    next_token: std::sync::atomic::AtomicU64,
    acked: tokio::sync::Mutex<Vec<u64>>,
}

impl InMemoryMessageSource {
    pub fn new(records: impl IntoIterator<Item = Record>) -> Self {
        Self {
            records: tokio::sync::Mutex::new(records.into_iter().collect()),
            next_token: std::sync::atomic::AtomicU64::new(0),
            acked: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn acked_tokens(&self) -> Vec<u64> {
        self.acked.lock().await.clone()
    }
}

#[async_trait]
impl MessageSource for InMemoryMessageSource {
    async fn next(&self) -> std::result::Result<Option<(u64, Record)>, String> {
        let mut guard = self.records.lock().await;
        Ok(guard.pop_front().map(|record| {
            let token = self.next_token.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            (token, record)
        }))
    }

    async fn ack(&self, token: u64) -> std::result::Result<(), String> {
        self.acked.lock().await.push(token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepData;
    use crate::store::MockStore;

    fn make_record(id: Uuid) -> Record {
        Record::new(id, StepData::new())
    }

    #[tokio::test]
    async fn ingest_persists_record_and_enqueues_saga_started() {
        let store = Arc::new(MockStore::new());
        let dispatcher = Arc::new(InProcessDispatcher::new());
        let ingress = Ingress::new(Arc::clone(&store), dispatcher, "OrderProcessing");

        let id = Uuid::new_v4();
        let started = ingress.ingest(&make_record(id)).await.unwrap();

        assert!(started);
        assert_eq!(store.count_records().await.unwrap(), 1);
        assert_eq!(store.count_unprocessed_outbox().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_record_is_benign_and_enqueues_nothing_twice() {
        let store = Arc::new(MockStore::new());
        let dispatcher = Arc::new(InProcessDispatcher::new());
        let ingress = Ingress::new(Arc::clone(&store), dispatcher, "OrderProcessing");

        let record = make_record(Uuid::new_v4());
        assert!(ingress.ingest(&record).await.unwrap());
        assert!(!ingress.ingest(&record).await.unwrap());
        assert_eq!(store.count_unprocessed_outbox().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn run_drains_source_and_acks_only_after_commit() {
        let store = Arc::new(MockStore::new());
        let dispatcher = Arc::new(InProcessDispatcher::new());
        let ingress = Ingress::new(Arc::clone(&store), dispatcher, "OrderProcessing");

        let records: Vec<Record> = (0..3).map(|_| make_record(Uuid::new_v4())).collect();
        let source = InMemoryMessageSource::new(records);
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        ingress.run(&source, shutdown_rx).await.unwrap();

        assert_eq!(store.count_records().await.unwrap(), 3);
        assert_eq!(source.acked_tokens().await, vec![0, 1, 2]);
    }

    struct NeverMessageSource;

    #[async_trait]
    impl MessageSource for NeverMessageSource {
        async fn next(&self) -> std::result::Result<Option<(u64, Record)>, String> {
            std::future::pending().await
        }

        async fn ack(&self, _token: u64) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_stops_pulling_once_shutdown_fires() {
        let store = Arc::new(MockStore::new());
        let dispatcher = Arc::new(InProcessDispatcher::new());
        let ingress = Arc::new(Ingress::new(Arc::clone(&store), dispatcher, "OrderProcessing"));
        let source = NeverMessageSource;
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let task = tokio::spawn(async move { ingress.run(&source, shutdown_rx).await });
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("run must stop once shutdown fires")
            .unwrap()
            .unwrap();
    }
}
