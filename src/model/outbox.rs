use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A durable record of an intent-to-publish, committed in the same
/// transaction as the business state change that produced it.
///
/// Rows are insert-only except for `processed`, `processed_at`,
/// `retry_count`, `last_error`, and `scheduled_for`. A row with
/// `processed = true` is immutable thereafter. `retry_count` is
/// monotonically non-decreasing; `scheduled_for` only ever advances.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OutboxRow {
    pub id: Uuid,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub scheduled_for: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Auxiliary monotonic sequence used only to stable-order rows that
    /// share `scheduled_for`.
    pub sequence: i64,
}

impl OutboxRow {
    /// A dead-lettered row: `processed=true` once its retry budget is
    /// exhausted, with `last_error` retained so it remains distinguishable
    /// from an ordinary successful delivery.
    pub fn is_dead_letter(&self, max_retries: u32) -> bool {
        self.processed && self.retry_count >= max_retries && self.last_error.is_some()
    }
}
