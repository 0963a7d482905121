//! Outbox Relay: polls due outbox rows and republishes them through the
//! Dispatcher, backing off and eventually dead-lettering rows that keep
//! failing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::dispatcher::InProcessDispatcher;
use crate::model::Event;
use crate::store::{OutboxRow, Store};

/// `2^retry_count` seconds, capped at `max_delay`. Retry counts `1..5`
/// yield `2, 4, 8, 16, 32` seconds.
pub fn calculate_backoff(retry_count: u32, max_delay: Duration) -> Duration {
    let capped_shift = retry_count.min(30);
    let seconds = 1u64.checked_shl(capped_shift).unwrap_or(u64::MAX);
    Duration::from_secs(seconds).min(max_delay)
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub max_retries: u32,
    pub max_backoff: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
            max_retries: 5,
            max_backoff: Duration::from_secs(32),
        }
    }
}

/// A background worker implementing the claim/publish/backoff/dead-letter
/// loop.
pub struct OutboxRelay<S: Store> {
    store: Arc<S>,
    dispatcher: Arc<InProcessDispatcher>,
    config: RelayConfig,
}

impl<S: Store> OutboxRelay<S> {
    pub fn new(store: Arc<S>, dispatcher: Arc<InProcessDispatcher>, config: RelayConfig) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    /// Claim and publish one batch of due rows. Returns the number of rows
    /// claimed, for test assertions and metrics.
    pub async fn tick(&self) -> usize {
        let now = Utc::now();
        let due = match self.store.claim_due_outbox(now, self.config.batch_size).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %err, "failed to claim due outbox rows");
                return 0;
            }
        };

        for row in &due {
            self.deliver(row).await;
        }
        due.len()
    }

    async fn deliver(&self, row: &OutboxRow) {
        match self.decode(row) {
            Ok(event) => match self.dispatcher.dispatch(event).await {
                Ok(()) => {
                    if let Err(err) = self.store.mark_processed(row.id).await {
                        error!(outbox_id = %row.id, error = %err, "failed to mark outbox row processed");
                    }
                }
                Err(err) => self.record_failure(row, err.to_string()).await,
            },
            Err(message) => self.record_failure(row, message).await,
        }
    }

    fn decode(&self, row: &OutboxRow) -> Result<Event, String> {
        let payload: serde_json::Value =
            serde_json::from_slice(&row.payload).map_err(|e| format!("deserialize payload: {e}"))?;
        let correlation_id = payload
            .get("correlation_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| "payload missing correlation_id".to_string())?;
        Ok(Event::new(row.event_type.clone(), correlation_id, payload))
    }

    async fn record_failure(&self, row: &OutboxRow, error: String) {
        let new_retry_count = row.retry_count + 1;
        if new_retry_count >= self.config.max_retries {
            warn!(
                outbox_id = %row.id,
                retry_count = new_retry_count,
                error = %error,
                "outbox row exhausted retries, dead-lettering"
            );
            if let Err(err) = self
                .store
                .mark_dead_letter(row.id, error, new_retry_count)
                .await
            {
                error!(outbox_id = %row.id, error = %err, "failed to dead-letter outbox row");
            }
            return;
        }

        let delay = calculate_backoff(new_retry_count, self.config.max_backoff);
        let next_scheduled_for = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
        info!(
            outbox_id = %row.id,
            retry_count = new_retry_count,
            delay_secs = delay.as_secs(),
            "outbox publish failed, backing off"
        );
        if let Err(err) = self
            .store
            .mark_failed(row.id, error, next_scheduled_for, new_retry_count)
            .await
        {
            error!(outbox_id = %row.id, error = %err, "failed to record outbox failure");
        }
    }

    /// Run the poll loop until `shutdown` fires. On shutdown, finishes the
    /// current batch and exits.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("outbox relay shutting down after current batch");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle controlling a spawned [`OutboxRelay::run`] task.
pub struct RelayHandle {
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl RelayHandle {
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

pub fn spawn<S: Store + 'static>(relay: Arc<OutboxRelay<S>>) -> RelayHandle {
    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move { relay.run(rx).await });
    RelayHandle { shutdown: tx }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::dispatcher::{DispatchError, EventHandler};
    use crate::model::{Record, SagaStartedPayload, StepData};
    use crate::store::{MockStore, PendingOutbox};

    #[test]
    fn backoff_matches_the_worked_example() {
        let max = Duration::from_secs(32);
        assert_eq!(calculate_backoff(1, max), Duration::from_secs(2));
        assert_eq!(calculate_backoff(2, max), Duration::from_secs(4));
        assert_eq!(calculate_backoff(3, max), Duration::from_secs(8));
        assert_eq!(calculate_backoff(4, max), Duration::from_secs(16));
        assert_eq!(calculate_backoff(5, max), Duration::from_secs(32));
        assert_eq!(calculate_backoff(9, max), Duration::from_secs(32));
    }

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: Event) -> crate::dispatcher::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    struct RejectingHandler;

    #[async_trait]
    impl EventHandler for RejectingHandler {
        async fn handle(&self, _event: Event) -> crate::dispatcher::Result<()> {
            Err(DispatchError::HandlerFailed {
                handler: "rejecting".into(),
                message: "nope".into(),
            })
        }

        fn name(&self) -> &str {
            "rejecting"
        }
    }

    async fn enqueue_saga_started(store: &MockStore) -> Uuid {
        let record = Record::new(Uuid::new_v4(), StepData::new());
        let payload = SagaStartedPayload {
            correlation_id: record.id,
            original_record: record.clone(),
            started_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&payload).unwrap();
        store
            .insert_record_and_enqueue(
                &record,
                PendingOutbox::new("SagaStarted-OrderProcessing", bytes, Utc::now()),
            )
            .await
            .unwrap();
        record.id
    }

    #[tokio::test]
    async fn tick_publishes_due_rows_and_marks_processed() {
        let store = Arc::new(MockStore::new());
        let dispatcher = Arc::new(InProcessDispatcher::new());
        dispatcher
            .subscribe(
                "SagaStarted-OrderProcessing",
                Arc::new(CountingHandler { calls: AtomicUsize::new(0) }),
            )
            .await;

        enqueue_saga_started(&store).await;
        let relay = OutboxRelay::new(Arc::clone(&store), dispatcher, RelayConfig::default());

        let claimed = relay.tick().await;
        assert_eq!(claimed, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.count_unprocessed_outbox().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failing_handler_backs_off_then_dead_letters() {
        let store = Arc::new(MockStore::new());
        let dispatcher = Arc::new(InProcessDispatcher::new());
        dispatcher
            .subscribe("SagaStarted-OrderProcessing", Arc::new(RejectingHandler))
            .await;

        enqueue_saga_started(&store).await;
        let config = RelayConfig {
            max_retries: 2,
            poll_interval: Duration::from_millis(1),
            ..RelayConfig::default()
        };
        let relay = OutboxRelay::new(Arc::clone(&store), dispatcher, config);

        // The subscribed handler always rejects, so `dispatch` surfaces the
        // failure back to the relay and the row is neither silently
        // dropped nor marked processed.
        let row = store.recent_outbox_rows(1).await.unwrap().remove(0);
        relay.deliver(&row).await;
        let updated = store.recent_outbox_rows(1).await.unwrap().remove(0);
        assert_eq!(updated.retry_count, 1);
        assert!(!updated.processed);

        relay.deliver(&updated).await;
        let dead = store.recent_outbox_rows(1).await.unwrap().remove(0);
        assert!(dead.is_dead_letter(2));
    }

    #[tokio::test]
    async fn succeeding_handler_is_only_marked_processed_after_it_runs() {
        let store = Arc::new(MockStore::new());
        let dispatcher = Arc::new(InProcessDispatcher::new());
        dispatcher
            .subscribe(
                "SagaStarted-OrderProcessing",
                Arc::new(CountingHandler { calls: AtomicUsize::new(0) }),
            )
            .await;

        enqueue_saga_started(&store).await;
        let relay = OutboxRelay::new(Arc::clone(&store), dispatcher, RelayConfig::default());

        let row = store.recent_outbox_rows(1).await.unwrap().remove(0);
        relay.deliver(&row).await;
        assert_eq!(store.count_unprocessed_outbox().await.unwrap(), 0);
    }
}
