//! Saga Engine: a per-correlation-ID state machine advancing through a
//! fixed sequence of remote-call steps.

pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dispatcher::{DispatchError, EventHandler, InProcessDispatcher};
use crate::model::{CallPayload, Event, FailedPayload, SagaStartedPayload, SucceededPayload};
use crate::store::{PendingOutbox, Store, StoreError};
use crate::utils::retry::RetryConfig;

pub type Result<T> = std::result::Result<T, SagaError>;

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("saga {0} exhausted concurrency-conflict retry budget")]
    RetriesExhausted(Uuid),
}

/// A static descriptor for one remote-call step, replacing a reflective
/// per-step configuration with a plain struct per workflow.
#[derive(Debug, Clone)]
pub struct StepDescriptor {
    /// Short step name, used to build `Call<name>`/`<name>Succeeded`/
    /// `<name>Failed` event types.
    pub name: String,
    /// Key into `original_record.step_data` for this step's payload.
    pub message_key: String,
    pub max_retries: u32,
}

impl StepDescriptor {
    pub fn new(name: impl Into<String>, message_key: impl Into<String>, max_retries: u32) -> Self {
        Self {
            name: name.into(),
            message_key: message_key.into(),
            max_retries,
        }
    }

    pub fn call_event_type(&self) -> String {
        format!("Call{}", self.name)
    }

    pub fn succeeded_event_type(&self) -> String {
        format!("{}Succeeded", self.name)
    }

    pub fn failed_event_type(&self) -> String {
        format!("{}Failed", self.name)
    }
}

/// A saga's state set, step sequence, and correlation function (always
/// the inbound record's ID; see GLOSSARY).
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    pub workflow: String,
    pub steps: Vec<StepDescriptor>,
}

impl SagaDefinition {
    pub fn new(workflow: impl Into<String>, steps: Vec<StepDescriptor>) -> Self {
        Self {
            workflow: workflow.into(),
            steps,
        }
    }

    pub fn start_event_type(&self) -> String {
        format!("SagaStarted-{}", self.workflow)
    }

    fn waiting_state(index: usize) -> String {
        format!("WaitingFor{}", index + 1)
    }

    fn step_index_of_waiting_state(state: &str) -> Option<usize> {
        state.strip_prefix("WaitingFor")?.parse::<usize>().ok()?.checked_sub(1)
    }

    /// Every event type this saga definition's engine must subscribe to.
    pub fn subscribed_event_types(&self) -> Vec<String> {
        let mut types = vec![self.start_event_type()];
        for step in &self.steps {
            types.push(step.succeeded_event_type());
            types.push(step.failed_event_type());
        }
        types
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Start,
    Succeeded(usize),
    Failed(usize),
}

/// Drives one [`SagaDefinition`] against a [`Store`], following the
/// six-step load/classify/apply/save/republish algorithm for each event.
pub struct SagaEngine<S: Store> {
    store: Arc<S>,
    dispatcher: Arc<InProcessDispatcher>,
    definition: SagaDefinition,
    concurrency_retry: RetryConfig,
}

impl<S: Store> SagaEngine<S> {
    pub fn new(store: Arc<S>, dispatcher: Arc<InProcessDispatcher>, definition: SagaDefinition) -> Self {
        Self {
            store,
            dispatcher,
            definition,
            concurrency_retry: RetryConfig {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(500),
                max_retries: 5,
                jitter: 0.1,
            },
        }
    }

    fn classify(&self, event_type: &str) -> Option<Kind> {
        if event_type == self.definition.start_event_type() {
            return Some(Kind::Start);
        }
        for (i, step) in self.definition.steps.iter().enumerate() {
            if event_type == step.succeeded_event_type() {
                return Some(Kind::Succeeded(i));
            }
            if event_type == step.failed_event_type() {
                return Some(Kind::Failed(i));
            }
        }
        None
    }

    fn emit_call(&self, saga: &crate::model::SagaInstance, step_index: usize, retry_count: u32) -> Result<PendingOutbox> {
        let step = &self.definition.steps[step_index];
        let payload = CallPayload {
            correlation_id: saga.correlation_id,
            step_payload: saga.original_record.step_payload(&step.message_key),
            retry_count,
        };
        let bytes = serde_json::to_vec(&payload)?;
        Ok(PendingOutbox::new(step.call_event_type(), bytes, Utc::now()))
    }

    /// Apply one transition. Returns `None` for an event that is
    /// unexpected for the saga's current state (the drop-and-log rule);
    /// `Some(outbox)` (possibly empty) once the action has been applied
    /// in memory.
    fn apply(&self, saga: &mut crate::model::SagaInstance, kind: Kind, event: &Event) -> Result<Option<Vec<PendingOutbox>>> {
        match (saga.current_state.as_str(), kind) {
            ("Initial", Kind::Start) => {
                if self.definition.steps.is_empty() {
                    saga.current_state = "Final".to_string();
                    saga.completed_at = Some(Utc::now());
                    return Ok(Some(vec![]));
                }
                saga.current_state = SagaDefinition::waiting_state(0);
                Ok(Some(vec![self.emit_call(saga, 0, 0)?]))
            }
            (state, Kind::Succeeded(i)) if SagaDefinition::step_index_of_waiting_state(state) == Some(i) => {
                let payload: SucceededPayload = serde_json::from_value(event.payload.clone())?;
                let step_name = self.definition.steps[i].name.clone();
                {
                    let step_state = saga.step(&step_name);
                    step_state.api_called = true;
                    step_state.response = Some(payload.response);
                }
                if i + 1 == self.definition.steps.len() {
                    saga.current_state = "Final".to_string();
                    saga.completed_at = Some(Utc::now());
                    Ok(Some(vec![]))
                } else {
                    saga.current_state = SagaDefinition::waiting_state(i + 1);
                    Ok(Some(vec![self.emit_call(saga, i + 1, 0)?]))
                }
            }
            (state, Kind::Failed(i)) if SagaDefinition::step_index_of_waiting_state(state) == Some(i) => {
                let payload: FailedPayload = serde_json::from_value(event.payload.clone())?;
                let step = &self.definition.steps[i];
                let step_name = step.name.clone();
                let max_retries = step.max_retries;
                let current_retry = saga.steps.get(&step_name).map(|s| s.retry_count).unwrap_or(0);
                saga.last_error = Some(payload.error);
                if current_retry < max_retries {
                    let new_retry = current_retry + 1;
                    saga.step(&step_name).retry_count = new_retry;
                    Ok(Some(vec![self.emit_call(saga, i, new_retry)?]))
                } else {
                    saga.current_state = "Final".to_string();
                    Ok(Some(vec![]))
                }
            }
            _ => Ok(None),
        }
    }

    async fn try_handle_event(&self, event: &Event) -> Result<()> {
        let cid = event.correlation_id;
        let existing = self.store.load_saga(cid).await?;

        let (mut saga, expected_version) = match existing {
            Some(instance) if instance.is_final() => {
                info!(%cid, event_type = %event.event_type, "saga already finalized, dropping late event");
                return Ok(());
            }
            Some(instance) => {
                let version = instance.version;
                (instance, version)
            }
            None => {
                if event.event_type != self.definition.start_event_type() {
                    warn!(%cid, event_type = %event.event_type, "unexpected event for absent saga, dropping");
                    return Ok(());
                }
                let payload: SagaStartedPayload = serde_json::from_value(event.payload.clone())?;
                (
                    crate::model::SagaInstance::new(cid, payload.original_record, "Initial"),
                    0,
                )
            }
        };

        let kind = match self.classify(&event.event_type) {
            Some(k) => k,
            None => {
                warn!(%cid, event_type = %event.event_type, "unknown event type, dropping");
                return Ok(());
            }
        };

        let outbox = match self.apply(&mut saga, kind, event)? {
            Some(outbox) => outbox,
            None => {
                warn!(%cid, state = %saga.current_state, event_type = %event.event_type, "unexpected event for state, dropping");
                return Ok(());
            }
        };

        saga.last_updated = Utc::now();
        self.store
            .save_saga_and_enqueue(&saga, expected_version, outbox.clone())
            .await?;

        for pending in outbox {
            let payload: serde_json::Value = match serde_json::from_slice(&pending.payload) {
                Ok(v) => v,
                Err(err) => {
                    warn!(%cid, error = %err, "failed to decode own outbox payload for best-effort publish");
                    continue;
                }
            };
            let event = Event::new(pending.event_type, cid, payload);
            if let Err(err) = self.dispatcher.publish(event).await {
                warn!(%cid, error = %err, "best-effort publish failed; relay will deliver it");
            }
        }

        Ok(())
    }

    /// Run the per-event algorithm, retrying on `ConcurrencyConflict` up
    /// to a small bounded number of attempts with short backoff.
    pub async fn handle_event(&self, event: &Event) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.try_handle_event(event).await {
                Ok(()) => return Ok(()),
                Err(SagaError::Store(StoreError::ConcurrencyConflict { .. })) => {
                    if !self.concurrency_retry.should_retry(attempt) {
                        error!(correlation_id = %event.correlation_id, "saga engine exhausted concurrency-conflict retries");
                        return Err(SagaError::RetriesExhausted(event.correlation_id));
                    }
                    tokio::time::sleep(self.concurrency_retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn definition(&self) -> &SagaDefinition {
        &self.definition
    }
}

#[async_trait]
impl<S: Store + 'static> EventHandler for SagaEngine<S> {
    async fn handle(&self, event: Event) -> crate::dispatcher::Result<()> {
        self.handle_event(&event)
            .await
            .map_err(|err| DispatchError::HandlerFailed {
                handler: "saga_engine".to_string(),
                message: err.to_string(),
            })
    }

    fn name(&self) -> &str {
        "saga_engine"
    }
}

/// Register `engine` with `dispatcher` for every event type its
/// definition subscribes to.
pub async fn register<S: Store + 'static>(engine: Arc<SagaEngine<S>>, dispatcher: &InProcessDispatcher) {
    for event_type in engine.definition().subscribed_event_types() {
        dispatcher.subscribe(event_type, Arc::clone(&engine) as Arc<dyn EventHandler>).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Record, StepData};
    use crate::store::MockStore;

    fn three_step_definition() -> SagaDefinition {
        SagaDefinition::new(
            "OrderProcessing",
            vec![
                StepDescriptor::new("ValidateOrder", "order-created", 3),
                StepDescriptor::new("ChargePayment", "order-processed", 3),
                StepDescriptor::new("ShipOrder", "order-shipped", 3),
            ],
        )
    }

    fn make_record(id: Uuid) -> Record {
        let mut step_data = StepData::new();
        step_data.insert("order-created".to_string(), serde_json::json!({"o": 1}));
        step_data.insert("order-processed".to_string(), serde_json::json!({"p": 2}));
        step_data.insert("order-shipped".to_string(), serde_json::json!({"s": 3}));
        Record::new(id, step_data)
    }

    fn start_event(record: &Record) -> Event {
        let payload = SagaStartedPayload {
            correlation_id: record.id,
            original_record: record.clone(),
            started_at: Utc::now(),
        };
        Event::new(
            "SagaStarted-OrderProcessing",
            record.id,
            serde_json::to_value(&payload).unwrap(),
        )
    }

    fn succeeded_event(correlation_id: Uuid, step: &str, response: &str) -> Event {
        let payload = SucceededPayload {
            correlation_id,
            response: response.to_string(),
        };
        Event::new(format!("{step}Succeeded"), correlation_id, serde_json::to_value(&payload).unwrap())
    }

    fn failed_event(correlation_id: Uuid, step: &str, error: &str, retry_count: u32) -> Event {
        let payload = FailedPayload {
            correlation_id,
            error: error.to_string(),
            retry_count,
        };
        Event::new(format!("{step}Failed"), correlation_id, serde_json::to_value(&payload).unwrap())
    }

    #[tokio::test]
    async fn start_event_creates_saga_and_emits_first_call() {
        let store = Arc::new(MockStore::new());
        let dispatcher = Arc::new(InProcessDispatcher::new());
        let engine = SagaEngine::new(Arc::clone(&store), dispatcher, three_step_definition());

        let record = make_record(Uuid::new_v4());
        engine.handle_event(&start_event(&record)).await.unwrap();

        let saga = store.load_saga(record.id).await.unwrap().unwrap();
        assert_eq!(saga.current_state, "WaitingFor1");
    }

    #[tokio::test]
    async fn happy_path_reaches_final_with_completed_at_set() {
        let store = Arc::new(MockStore::new());
        let dispatcher = Arc::new(InProcessDispatcher::new());
        let engine = SagaEngine::new(Arc::clone(&store), dispatcher, three_step_definition());

        let record = make_record(Uuid::new_v4());
        engine.handle_event(&start_event(&record)).await.unwrap();
        engine
            .handle_event(&succeeded_event(record.id, "ValidateOrder", "ok-1"))
            .await
            .unwrap();
        engine
            .handle_event(&succeeded_event(record.id, "ChargePayment", "ok-2"))
            .await
            .unwrap();
        engine
            .handle_event(&succeeded_event(record.id, "ShipOrder", "ok-3"))
            .await
            .unwrap();

        let saga = store.load_saga(record.id).await.unwrap().unwrap();
        assert_eq!(saga.current_state, "Final");
        assert!(saga.succeeded());
        assert_eq!(saga.steps["ShipOrder"].response.as_deref(), Some("ok-3"));
    }

    #[tokio::test]
    async fn step_exhausts_retries_and_finalizes_as_failure() {
        let store = Arc::new(MockStore::new());
        let dispatcher = Arc::new(InProcessDispatcher::new());
        let engine = SagaEngine::new(Arc::clone(&store), dispatcher, three_step_definition());

        let record = make_record(Uuid::new_v4());
        engine.handle_event(&start_event(&record)).await.unwrap();
        for retry in 0..3 {
            engine
                .handle_event(&failed_event(record.id, "ValidateOrder", "boom", retry))
                .await
                .unwrap();
        }

        let saga = store.load_saga(record.id).await.unwrap().unwrap();
        assert_eq!(saga.current_state, "Final");
        assert!(!saga.succeeded());
        assert_eq!(saga.last_error.as_deref(), Some("boom"));
        assert_eq!(saga.steps["ValidateOrder"].retry_count, 3);
    }

    #[tokio::test]
    async fn late_event_for_finalized_saga_is_dropped() {
        let store = Arc::new(MockStore::new());
        let dispatcher = Arc::new(InProcessDispatcher::new());
        let engine = SagaEngine::new(Arc::clone(&store), dispatcher, three_step_definition());

        let record = make_record(Uuid::new_v4());
        engine.handle_event(&start_event(&record)).await.unwrap();
        for retry in 0..3 {
            engine
                .handle_event(&failed_event(record.id, "ValidateOrder", "boom", retry))
                .await
                .unwrap();
        }
        let before = store.load_saga(record.id).await.unwrap().unwrap();

        engine
            .handle_event(&succeeded_event(record.id, "ValidateOrder", "late"))
            .await
            .unwrap();

        let after = store.load_saga(record.id).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn duplicate_succeeded_for_already_advanced_saga_is_dropped_as_unexpected() {
        let store = Arc::new(MockStore::new());
        let dispatcher = Arc::new(InProcessDispatcher::new());
        let engine = SagaEngine::new(Arc::clone(&store), dispatcher, three_step_definition());

        let record = make_record(Uuid::new_v4());
        engine.handle_event(&start_event(&record)).await.unwrap();
        engine
            .handle_event(&succeeded_event(record.id, "ValidateOrder", "ok-1"))
            .await
            .unwrap();
        let before = store.load_saga(record.id).await.unwrap().unwrap();

        engine
            .handle_event(&succeeded_event(record.id, "ValidateOrder", "ok-1-dup"))
            .await
            .unwrap();

        let after = store.load_saga(record.id).await.unwrap().unwrap();
        assert_eq!(before, after);
    }
}
