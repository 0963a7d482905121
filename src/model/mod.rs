//! Persistent and in-flight data shapes shared across the engine.
//!
//! Three persistent entities (`Record`, `OutboxRow`, `SagaInstance`) plus the
//! event envelope that carries them across the Dispatcher.

mod outbox;
mod record;
mod saga;

pub use outbox::OutboxRow;
pub use record::Record;
pub use saga::{SagaInstance, StepState};

use std::collections::HashMap;
use uuid::Uuid;

/// An event flowing through the Dispatcher.
///
/// `event_type` is the routing key (`SagaStarted<workflow>`, `Call<Sk>`,
/// `<Sk>Succeeded`, `<Sk>Failed`); `correlation_id` is the saga this event
/// belongs to; `payload` carries the event-specific fields as JSON.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Event {
    pub event_type: String,
    pub correlation_id: Uuid,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        correlation_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            correlation_id,
            payload,
        }
    }
}

/// Payload of a `SagaStarted<workflow>` event.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SagaStartedPayload {
    pub correlation_id: Uuid,
    pub original_record: Record,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Payload of a `Call<Sk>` command.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CallPayload {
    pub correlation_id: Uuid,
    pub step_payload: serde_json::Value,
    pub retry_count: u32,
}

/// Payload of a `<Sk>Succeeded` event.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SucceededPayload {
    pub correlation_id: Uuid,
    pub response: String,
}

/// Payload of a `<Sk>Failed` event.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FailedPayload {
    pub correlation_id: Uuid,
    pub error: String,
    pub retry_count: u32,
}

/// Step-data keyed map carried by a `Record`.
pub type StepData = HashMap<String, serde_json::Value>;
