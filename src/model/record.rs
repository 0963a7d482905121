use uuid::Uuid;

use super::StepData;

/// An inbound message handed to Ingress by a `MessageSource`.
///
/// `id` is reused verbatim as the saga correlation ID (see
/// [`crate::ingress`]); `step_data` maps a step key such as
/// `"order-created"` to the opaque JSON blob consumed by that step.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub step_data: StepData,
}

impl Record {
    pub fn new(id: Uuid, step_data: StepData) -> Self {
        Self { id, step_data }
    }

    /// Payload for step `key`, or an empty object if the key is absent.
    ///
    /// A missing key is not a local error: the downstream HTTP call still
    /// runs with an empty body and is subject to normal success/failure
    /// handling.
    pub fn step_payload(&self, key: &str) -> serde_json::Value {
        self.step_data
            .get(key)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }
}
