use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Record;

/// Per-step bookkeeping carried inside a `SagaInstance`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StepState {
    pub retry_count: u32,
    pub api_called: bool,
    pub response: Option<String>,
}

/// A persistent, per-correlation-ID state machine advancing through a
/// fixed sequence of steps.
///
/// `version` is the optimistic-concurrency column: `Store::save_saga`
/// rejects a save whose `expected_version` does not match the stored one.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SagaInstance {
    pub correlation_id: Uuid,
    pub current_state: String,
    pub original_record: Record,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub steps: HashMap<String, StepState>,
    pub version: i64,
}

impl SagaInstance {
    pub fn new(correlation_id: Uuid, original_record: Record, initial_state: &str) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            current_state: initial_state.to_string(),
            original_record,
            started_at: now,
            last_updated: now,
            completed_at: None,
            last_error: None,
            steps: HashMap::new(),
            version: 0,
        }
    }

    pub fn step(&mut self, name: &str) -> &mut StepState {
        self.steps.entry(name.to_string()).or_default()
    }

    pub fn is_final(&self) -> bool {
        self.current_state == "Final"
    }

    /// A finalized saga is a success iff `completed_at` is set; otherwise
    /// it exhausted a step's retry budget and `last_error` is populated.
    pub fn succeeded(&self) -> bool {
        self.completed_at.is_some()
    }
}
