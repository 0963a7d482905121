//! Read-only accessors backing the external monitoring surface.
//! The HTTP routing layer is treated as an external collaborator; this
//! module only exposes the accessors it would call.

use std::sync::Arc;

use uuid::Uuid;

use crate::model::OutboxRow;
use crate::store::{Result, Store};

pub struct Monitor<S: Store> {
    store: Arc<S>,
}

#[derive(Debug, Clone)]
pub struct SagaSummary {
    pub correlation_id: Uuid,
    pub current_state: String,
    pub step_retry_counts: Vec<(String, u32)>,
    pub succeeded: bool,
}

impl<S: Store> Monitor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn record_count(&self) -> Result<u64> {
        self.store.count_records().await
    }

    pub async fn unprocessed_outbox_count(&self) -> Result<u64> {
        self.store.count_unprocessed_outbox().await
    }

    pub async fn sagas_by_state(&self) -> Result<Vec<(String, u64)>> {
        self.store.count_sagas_by_state().await
    }

    pub async fn recent_outbox_rows(&self, limit: u32) -> Result<Vec<OutboxRow>> {
        self.store.recent_outbox_rows(limit).await
    }

    pub async fn saga_summary(&self, correlation_id: Uuid) -> Result<Option<SagaSummary>> {
        let saga = self.store.load_saga(correlation_id).await?;
        Ok(saga.map(|instance| SagaSummary {
            correlation_id: instance.correlation_id,
            current_state: instance.current_state,
            step_retry_counts: instance
                .steps
                .into_iter()
                .map(|(name, state)| (name, state.retry_count))
                .collect(),
            succeeded: instance.completed_at.is_some(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Record, SagaInstance, StepData};
    use crate::store::MockStore;

    #[tokio::test]
    async fn saga_summary_reports_state_and_retry_counts() {
        let store = Arc::new(MockStore::new());
        let record = Record::new(Uuid::new_v4(), StepData::new());
        let mut saga = SagaInstance::new(record.id, record.clone(), "WaitingFor2");
        saga.step("ValidateOrder").retry_count = 1;
        store.save_saga_and_enqueue(&saga, 0, vec![]).await.unwrap();

        let monitor = Monitor::new(Arc::clone(&store));
        let summary = monitor.saga_summary(record.id).await.unwrap().unwrap();

        assert_eq!(summary.current_state, "WaitingFor2");
        assert!(!summary.succeeded);
        assert!(summary
            .step_retry_counts
            .iter()
            .any(|(name, count)| name == "ValidateOrder" && *count == 1));
    }
}
