//! Step Executor: dispatches `Call<k>` commands to a configured HTTP
//! endpoint and republishes the HTTP outcome as `<k>Succeeded`/`<k>Failed`.
//! Never retries locally; retry is the Saga Engine's job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::dispatcher::{DispatchError, EventHandler, InProcessDispatcher};
use crate::model::{CallPayload, Event, FailedPayload, SucceededPayload};

/// Where to send a step's `Call<k>` payload, and how long to wait.
#[derive(Debug, Clone)]
pub struct StepEndpoint {
    pub step_name: String,
    pub url: String,
    pub timeout: Duration,
}

impl StepEndpoint {
    pub fn new(step_name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            step_name: step_name.into(),
            url: url.into(),
            timeout,
        }
    }
}

pub struct StepExecutor {
    client: reqwest::Client,
    endpoints: HashMap<String, StepEndpoint>,
    dispatcher: Arc<InProcessDispatcher>,
}

impl StepExecutor {
    pub fn new(dispatcher: Arc<InProcessDispatcher>, endpoints: Vec<StepEndpoint>) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|e| (format!("Call{}", e.step_name), e))
            .collect();
        Self {
            client: reqwest::Client::new(),
            endpoints,
            dispatcher,
        }
    }

    pub fn subscribed_event_types(&self) -> Vec<String> {
        self.endpoints.keys().cloned().collect()
    }

    async fn dispatch_call(&self, endpoint: &StepEndpoint, event: &Event) -> crate::dispatcher::Result<()> {
        let call: CallPayload = serde_json::from_value(event.payload.clone()).map_err(|err| {
            DispatchError::HandlerFailed {
                handler: "step_executor".to_string(),
                message: format!("malformed Call payload: {err}"),
            }
        })?;

        let outcome = match self
            .client
            .post(&endpoint.url)
            .timeout(endpoint.timeout)
            .json(&call.step_payload)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                let body = response.text().await.unwrap_or_default();
                info!(step = %endpoint.step_name, correlation_id = %call.correlation_id, "step call succeeded");
                Event::new(
                    endpoint_succeeded_type(&endpoint.step_name),
                    call.correlation_id,
                    serde_json::to_value(SucceededPayload {
                        correlation_id: call.correlation_id,
                        response: body,
                    })
                    .unwrap(),
                )
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(step = %endpoint.step_name, correlation_id = %call.correlation_id, %status, "step call returned an error status");
                Event::new(
                    endpoint_failed_type(&endpoint.step_name),
                    call.correlation_id,
                    serde_json::to_value(FailedPayload {
                        correlation_id: call.correlation_id,
                        error: format!("http {status}: {body}"),
                        retry_count: call.retry_count,
                    })
                    .unwrap(),
                )
            }
            Err(err) => {
                warn!(step = %endpoint.step_name, correlation_id = %call.correlation_id, error = %err, "step call failed (transport or timeout)");
                Event::new(
                    endpoint_failed_type(&endpoint.step_name),
                    call.correlation_id,
                    serde_json::to_value(FailedPayload {
                        correlation_id: call.correlation_id,
                        error: err.to_string(),
                        retry_count: call.retry_count,
                    })
                    .unwrap(),
                )
            }
        };

        self.dispatcher
            .publish(outcome)
            .await
            .map_err(|err| DispatchError::HandlerFailed {
                handler: "step_executor".to_string(),
                message: err.to_string(),
            })
    }
}

fn endpoint_succeeded_type(step_name: &str) -> String {
    format!("{step_name}Succeeded")
}

fn endpoint_failed_type(step_name: &str) -> String {
    format!("{step_name}Failed")
}

#[async_trait]
impl EventHandler for StepExecutor {
    async fn handle(&self, event: Event) -> crate::dispatcher::Result<()> {
        let endpoint = self.endpoints.get(&event.event_type).ok_or_else(|| DispatchError::HandlerFailed {
            handler: "step_executor".to_string(),
            message: format!("no endpoint configured for {}", event.event_type),
        })?;
        self.dispatch_call(endpoint, &event).await
    }

    fn name(&self) -> &str {
        "step_executor"
    }
}

/// Register `executor` with `dispatcher` for every `Call<k>` it serves.
pub async fn register(executor: Arc<StepExecutor>, dispatcher: &InProcessDispatcher) {
    for event_type in executor.subscribed_event_types() {
        dispatcher.subscribe(event_type, Arc::clone(&executor) as Arc<dyn EventHandler>).await;
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    struct Recorder {
        events: Arc<tokio::sync::Mutex<Vec<Event>>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: Event) -> crate::dispatcher::Result<()> {
            self.events.lock().await.push(event);
            Ok(())
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    #[tokio::test]
    async fn http_2xx_publishes_succeeded_with_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/validate"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok-1"))
            .mount(&server)
            .await;

        let dispatcher = Arc::new(InProcessDispatcher::new());
        let events = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        dispatcher
            .subscribe("ValidateOrderSucceeded", Arc::new(Recorder { events: Arc::clone(&events) }))
            .await;

        let executor = Arc::new(StepExecutor::new(
            Arc::clone(&dispatcher),
            vec![StepEndpoint::new("ValidateOrder", format!("{}/validate", server.uri()), Duration::from_secs(5))],
        ));
        register(Arc::clone(&executor), &dispatcher).await;

        let correlation_id = Uuid::new_v4();
        let call = CallPayload {
            correlation_id,
            step_payload: serde_json::json!({"o": 1}),
            retry_count: 0,
        };
        dispatcher
            .publish(Event::new("CallValidateOrder", correlation_id, serde_json::to_value(&call).unwrap()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let recorded = events.lock().await;
        assert_eq!(recorded.len(), 1);
        let payload: SucceededPayload = serde_json::from_value(recorded[0].payload.clone()).unwrap();
        assert_eq!(payload.response, "ok-1");
    }

    #[tokio::test]
    async fn http_error_status_publishes_failed_with_retry_count_carried_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/charge"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let dispatcher = Arc::new(InProcessDispatcher::new());
        let events = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        dispatcher
            .subscribe("ChargePaymentFailed", Arc::new(Recorder { events: Arc::clone(&events) }))
            .await;

        let executor = Arc::new(StepExecutor::new(
            Arc::clone(&dispatcher),
            vec![StepEndpoint::new("ChargePayment", format!("{}/charge", server.uri()), Duration::from_secs(10))],
        ));
        register(Arc::clone(&executor), &dispatcher).await;

        let correlation_id = Uuid::new_v4();
        let call = CallPayload {
            correlation_id,
            step_payload: serde_json::json!({"p": 2}),
            retry_count: 1,
        };
        dispatcher
            .publish(Event::new("CallChargePayment", correlation_id, serde_json::to_value(&call).unwrap()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let recorded = events.lock().await;
        assert_eq!(recorded.len(), 1);
        let payload: FailedPayload = serde_json::from_value(recorded[0].payload.clone()).unwrap();
        assert_eq!(payload.retry_count, 1);
        assert!(payload.error.contains("500"));
    }
}
