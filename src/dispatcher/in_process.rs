use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{error, warn};
use uuid::Uuid;

use crate::model::Event;

use super::{DispatchError, EventHandler, Result};

type HandlerTable = Arc<RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>>;

/// One queued unit of work for a correlation's worker: the event itself,
/// plus an optional channel the worker reports the aggregate handler
/// result back through. `None` means the caller doesn't wait for handler
/// completion (a best-effort publish); `Some` means it does (the Outbox
/// Relay's authoritative delivery).
type QueueItem = (Event, Option<oneshot::Sender<Result<()>>>);

/// Single-process, in-memory dispatcher.
///
/// Each correlation ID gets its own unbounded mpsc queue drained by a
/// dedicated background task, so events published for the same
/// correlation ID in sequence are always delivered in that order, while
/// different correlation IDs proceed concurrently.
pub struct InProcessDispatcher {
    handlers: HandlerTable,
    queues: Arc<tokio::sync::Mutex<HashMap<Uuid, mpsc::UnboundedSender<QueueItem>>>>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl InProcessDispatcher {
    pub fn new() -> Self {
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            queues: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            shutdown,
        }
    }

    /// Register `handler` to receive every future event of `event_type`.
    pub async fn subscribe(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let mut guard = self.handlers.write().await;
        guard.entry(event_type.into()).or_default().push(handler);
    }

    /// Enqueue `event` for delivery without waiting for handlers to run.
    /// Returns once the event is queued on its correlation's worker. This
    /// is the entry point for best-effort publishes (Ingress, the Saga
    /// Engine's own re-publish of its outbox rows): a failure here is not
    /// fatal, since the Outbox Relay's [`Self::dispatch`] is the
    /// authoritative delivery path backing those same rows. Using this
    /// method from inside a running handler is safe — it never blocks on
    /// the queue it feeds, so a handler may publish further events for
    /// its own correlation ID without deadlocking against itself.
    pub async fn publish(&self, event: Event) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(DispatchError::ShuttingDown);
        }
        let sender = self.sender_for(event.correlation_id).await;
        sender.send((event, None)).map_err(|_| DispatchError::ShuttingDown)
    }

    /// Enqueue `event` and wait for every subscribed handler to finish,
    /// returning the first handler failure (if any). This is the
    /// authoritative delivery path: callers that must know whether the
    /// event was actually handled (the Outbox Relay, deciding
    /// `mark_processed` vs. retry) use this instead of [`Self::publish`].
    ///
    /// Must not be called from within a handler for the same correlation
    /// ID — that handler is itself running on the worker this call would
    /// wait on, which would deadlock.
    pub async fn dispatch(&self, event: Event) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(DispatchError::ShuttingDown);
        }
        let (tx, rx) = oneshot::channel();
        let sender = self.sender_for(event.correlation_id).await;
        sender
            .send((event, Some(tx)))
            .map_err(|_| DispatchError::ShuttingDown)?;
        rx.await.map_err(|_| DispatchError::ShuttingDown)?
    }

    /// Stop accepting new publishes/dispatches immediately, then wait up
    /// to `grace` for in-flight per-correlation workers to finish the
    /// events already queued.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown.send(true);
        tokio::time::sleep(grace).await;
    }

    async fn sender_for(&self, correlation_id: Uuid) -> mpsc::UnboundedSender<QueueItem> {
        let mut queues = self.queues.lock().await;
        if let Some(sender) = queues.get(&correlation_id) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handlers = Arc::clone(&self.handlers);
        tokio::spawn(Self::run_worker(correlation_id, rx, handlers));
        queues.insert(correlation_id, tx.clone());
        tx
    }

    async fn run_worker(correlation_id: Uuid, mut rx: mpsc::UnboundedReceiver<QueueItem>, handlers: HandlerTable) {
        while let Some((event, ack)) = rx.recv().await {
            let subscribers = {
                let guard = handlers.read().await;
                guard.get(&event.event_type).cloned().unwrap_or_default()
            };
            let mut result = Ok(());
            if subscribers.is_empty() {
                warn!(%correlation_id, event_type = %event.event_type, "no subscribers for event type");
            } else {
                for handler in &subscribers {
                    if let Err(err) = handler.handle(event.clone()).await {
                        error!(
                            %correlation_id,
                            event_type = %event.event_type,
                            handler = handler.name(),
                            error = %err,
                            "event handler failed; dispatcher does not retry"
                        );
                        if result.is_ok() {
                            result = Err(err);
                        }
                    }
                }
            }
            if let Some(ack) = ack {
                let _ = ack.send(result);
            }
        }
    }
}

impl Default for InProcessDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
