//! Persistent storage of inbound records, outbox rows, and saga instances
//! behind a single abstract transaction primitive.
//!
//! Implementations:
//! - [`sqlite::SqliteStore`]: `sqlx` + `sea-query` backed, for production use.
//! - [`mock::MockStore`]: in-memory, for fast unit tests of Ingress, the
//!   Outbox Relay, and the Saga Engine.

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub mod mock;

pub use mock::MockStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{OutboxRow, Record, SagaInstance};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by `Store` operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Raised when `record.id` already exists. Benign: Ingress treats it
    /// as "already handled, skip".
    #[error("duplicate record id {0}")]
    DuplicateKey(Uuid),

    /// Raised by `save_saga` when `expected_version` does not match the
    /// stored version. Recoverable by the Saga Engine via reload-and-retry.
    #[error("concurrency conflict on saga {correlation_id}: expected version {expected}, stored {actual}")]
    ConcurrencyConflict {
        correlation_id: Uuid,
        expected: i64,
        actual: i64,
    },

    #[error("saga {0} not found")]
    SagaNotFound(Uuid),

    #[error("outbox row {0} not found")]
    OutboxRowNotFound(Uuid),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored uuid: {0}")]
    InvalidUuid(#[from] uuid::Error),
}

/// A pending enqueue, as handed to the two composite transactions below.
#[derive(Debug, Clone)]
pub struct PendingOutbox {
    pub event_type: String,
    pub payload: Vec<u8>,
    pub scheduled_for: DateTime<Utc>,
}

impl PendingOutbox {
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            scheduled_for,
        }
    }
}

/// Persistent storage of inbound records, outbox rows, and saga instances.
///
/// One transaction primitive, usable both by Ingress
/// (co-committing a `Record` with the initial `SagaStarted` outbox row)
/// and by the Saga Engine (co-committing `SaveSaga` with any deferred
/// publishes). Rather than exposing a generic transaction handle across
/// the trait boundary, this trait names the two concrete atomic
/// compositions directly: [`Store::insert_record_and_enqueue`] and
/// [`Store::save_saga_and_enqueue`]. Both commit or roll back as a unit.
#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically insert `record` and enqueue one outbox row. Fails with
    /// `DuplicateKey` (and enqueues nothing) if `record.id` already exists.
    async fn insert_record_and_enqueue(
        &self,
        record: &Record,
        outbox: PendingOutbox,
    ) -> Result<Uuid>;

    /// Atomically save `instance` (checked against `expected_version`) and
    /// enqueue zero or more deferred outbox rows. Fails with
    /// `ConcurrencyConflict` (and enqueues nothing) if the stored version
    /// has moved on.
    async fn save_saga_and_enqueue(
        &self,
        instance: &SagaInstance,
        expected_version: i64,
        outbox: Vec<PendingOutbox>,
    ) -> Result<()>;

    /// Claim up to `batch_size` rows with `processed=false AND
    /// scheduled_for <= now`, ordered by `scheduled_for` then `sequence`
    /// ascending. A claimed row must not be returned to any other caller
    /// until released (by `mark_processed`/`mark_failed`/`mark_dead_letter`).
    async fn claim_due_outbox(&self, now: DateTime<Utc>, batch_size: u32) -> Result<Vec<OutboxRow>>;

    async fn mark_processed(&self, id: Uuid) -> Result<()>;

    async fn mark_failed(
        &self,
        id: Uuid,
        error: String,
        next_scheduled_for: DateTime<Utc>,
        new_retry_count: u32,
    ) -> Result<()>;

    /// Dead-letter a row in place: `processed=true` with `last_error`
    /// retained.
    async fn mark_dead_letter(&self, id: Uuid, error: String, retry_count: u32) -> Result<()>;

    /// Reset a dead-lettered row for manual redrive: clears `processed`
    /// and `last_error`, zeroes `retry_count`, and schedules it now.
    /// Ambient operator tooling; not part of the relay's own contract.
    async fn requeue_outbox_row(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    async fn load_saga(&self, correlation_id: Uuid) -> Result<Option<SagaInstance>>;

    // Read-only accessors backing the monitoring surface.
    async fn count_records(&self) -> Result<u64>;
    async fn count_unprocessed_outbox(&self) -> Result<u64>;
    async fn count_sagas_by_state(&self) -> Result<Vec<(String, u64)>>;
    async fn recent_outbox_rows(&self, limit: u32) -> Result<Vec<OutboxRow>>;
}
