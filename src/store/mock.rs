//! In-memory `Store` for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{OutboxRow, Record, SagaInstance};

use super::{PendingOutbox, Result, Store, StoreError};

#[derive(Default)]
struct Inner {
    records: HashMap<Uuid, Record>,
    outbox: HashMap<Uuid, OutboxRow>,
    sagas: HashMap<Uuid, SagaInstance>,
}

/// In-memory `Store`. Single `tokio::sync::Mutex` guards all three tables
/// so the two composite methods are trivially atomic.
pub struct MockStore {
    inner: Mutex<Inner>,
    sequence: AtomicI64,
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            sequence: AtomicI64::new(0),
        }
    }

    fn next_sequence(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MockStore {
    async fn insert_record_and_enqueue(
        &self,
        record: &Record,
        outbox: PendingOutbox,
    ) -> Result<Uuid> {
        let mut guard = self.inner.lock().await;
        if guard.records.contains_key(&record.id) {
            return Err(StoreError::DuplicateKey(record.id));
        }
        guard.records.insert(record.id, record.clone());

        let id = Uuid::new_v4();
        let row = OutboxRow {
            id,
            event_type: outbox.event_type,
            payload: outbox.payload,
            scheduled_for: outbox.scheduled_for,
            processed: false,
            processed_at: None,
            retry_count: 0,
            last_error: None,
            sequence: self.next_sequence(),
        };
        guard.outbox.insert(id, row);
        Ok(id)
    }

    async fn save_saga_and_enqueue(
        &self,
        instance: &SagaInstance,
        expected_version: i64,
        outbox: Vec<PendingOutbox>,
    ) -> Result<()> {
        let mut guard = self.inner.lock().await;

        let stored_version = guard
            .sagas
            .get(&instance.correlation_id)
            .map(|s| s.version)
            .unwrap_or(0);
        if stored_version != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                correlation_id: instance.correlation_id,
                expected: expected_version,
                actual: stored_version,
            });
        }

        let mut saved = instance.clone();
        saved.version = expected_version + 1;
        guard.sagas.insert(saved.correlation_id, saved);

        for pending in outbox {
            let id = Uuid::new_v4();
            let row = OutboxRow {
                id,
                event_type: pending.event_type,
                payload: pending.payload,
                scheduled_for: pending.scheduled_for,
                processed: false,
                processed_at: None,
                retry_count: 0,
                last_error: None,
                sequence: self.next_sequence(),
            };
            guard.outbox.insert(id, row);
        }

        Ok(())
    }

    async fn claim_due_outbox(&self, now: DateTime<Utc>, batch_size: u32) -> Result<Vec<OutboxRow>> {
        let guard = self.inner.lock().await;
        let mut due: Vec<OutboxRow> = guard
            .outbox
            .values()
            .filter(|row| !row.processed && row.scheduled_for <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then(a.sequence.cmp(&b.sequence))
        });
        due.truncate(batch_size as usize);
        Ok(due)
    }

    async fn mark_processed(&self, id: Uuid) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let row = guard
            .outbox
            .get_mut(&id)
            .ok_or(StoreError::OutboxRowNotFound(id))?;
        row.processed = true;
        row.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: String,
        next_scheduled_for: DateTime<Utc>,
        new_retry_count: u32,
    ) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let row = guard
            .outbox
            .get_mut(&id)
            .ok_or(StoreError::OutboxRowNotFound(id))?;
        row.retry_count = new_retry_count;
        row.scheduled_for = next_scheduled_for;
        row.last_error = Some(error);
        Ok(())
    }

    async fn mark_dead_letter(&self, id: Uuid, error: String, retry_count: u32) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let row = guard
            .outbox
            .get_mut(&id)
            .ok_or(StoreError::OutboxRowNotFound(id))?;
        row.processed = true;
        row.processed_at = Some(Utc::now());
        row.retry_count = retry_count;
        row.last_error = Some(error);
        Ok(())
    }

    async fn requeue_outbox_row(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let row = guard
            .outbox
            .get_mut(&id)
            .ok_or(StoreError::OutboxRowNotFound(id))?;
        row.processed = false;
        row.processed_at = None;
        row.retry_count = 0;
        row.last_error = None;
        row.scheduled_for = now;
        Ok(())
    }

    async fn load_saga(&self, correlation_id: Uuid) -> Result<Option<SagaInstance>> {
        let guard = self.inner.lock().await;
        Ok(guard.sagas.get(&correlation_id).cloned())
    }

    async fn count_records(&self) -> Result<u64> {
        let guard = self.inner.lock().await;
        Ok(guard.records.len() as u64)
    }

    async fn count_unprocessed_outbox(&self) -> Result<u64> {
        let guard = self.inner.lock().await;
        Ok(guard.outbox.values().filter(|r| !r.processed).count() as u64)
    }

    async fn count_sagas_by_state(&self) -> Result<Vec<(String, u64)>> {
        let guard = self.inner.lock().await;
        let mut counts: HashMap<String, u64> = HashMap::new();
        for saga in guard.sagas.values() {
            *counts.entry(saga.current_state.clone()).or_insert(0) += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn recent_outbox_rows(&self, limit: u32) -> Result<Vec<OutboxRow>> {
        let guard = self.inner.lock().await;
        let mut rows: Vec<OutboxRow> = guard.outbox.values().cloned().collect();
        rows.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepData;

    fn make_record(id: Uuid) -> Record {
        Record::new(id, StepData::new())
    }

    #[tokio::test]
    async fn insert_record_and_enqueue_is_atomic() {
        let store = MockStore::new();
        let record = make_record(Uuid::new_v4());
        let outbox = PendingOutbox::new("SagaStarted", b"payload".to_vec(), Utc::now());

        let id = store
            .insert_record_and_enqueue(&record, outbox)
            .await
            .unwrap();

        assert_eq!(store.count_records().await.unwrap(), 1);
        assert_eq!(store.count_unprocessed_outbox().await.unwrap(), 1);
        assert!(store.recent_outbox_rows(10).await.unwrap().iter().any(|r| r.id == id));
    }

    #[tokio::test]
    async fn duplicate_insert_rejected_and_enqueues_nothing() {
        let store = MockStore::new();
        let record = make_record(Uuid::new_v4());
        let outbox = PendingOutbox::new("SagaStarted", vec![], Utc::now());
        store
            .insert_record_and_enqueue(&record, outbox.clone())
            .await
            .unwrap();

        let err = store
            .insert_record_and_enqueue(&record, outbox)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(id) if id == record.id));
        assert_eq!(store.count_unprocessed_outbox().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_due_outbox_orders_by_schedule_then_sequence() {
        let store = MockStore::new();
        let now = Utc::now();
        for i in 0..3 {
            let record = make_record(Uuid::new_v4());
            let outbox = PendingOutbox::new("SagaStarted", vec![i], now);
            store.insert_record_and_enqueue(&record, outbox).await.unwrap();
        }

        let claimed = store.claim_due_outbox(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 3);
        assert_eq!(claimed[0].payload, vec![0]);
        assert_eq!(claimed[2].payload, vec![2]);
    }

    #[tokio::test]
    async fn concurrency_conflict_on_stale_version() {
        let store = MockStore::new();
        let record = make_record(Uuid::new_v4());
        let saga = SagaInstance::new(record.id, record, "Initial");

        store
            .save_saga_and_enqueue(&saga, 0, vec![])
            .await
            .unwrap();

        let err = store
            .save_saga_and_enqueue(&saga, 0, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn dead_letter_then_requeue_round_trips() {
        let store = MockStore::new();
        let record = make_record(Uuid::new_v4());
        let outbox = PendingOutbox::new("SagaStarted", vec![], Utc::now());
        let id = store.insert_record_and_enqueue(&record, outbox).await.unwrap();

        store
            .mark_dead_letter(id, "exhausted".to_string(), 5)
            .await
            .unwrap();
        let row = store
            .recent_outbox_rows(10)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.id == id)
            .unwrap();
        assert!(row.is_dead_letter(5));

        store.requeue_outbox_row(id, Utc::now()).await.unwrap();
        let row = store
            .recent_outbox_rows(10)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.id == id)
            .unwrap();
        assert!(!row.processed);
        assert_eq!(row.retry_count, 0);
    }
}
