//! In-process publish/subscribe bus with correlation-keyed ordering.
//!
//! A per-event-type routing table with per-correlation FIFO delivery:
//! handlers for the same event type are tried in registration order, and
//! a handler failure is logged but never blocks delivery to the rest.

mod in_process;

pub use in_process::InProcessDispatcher;

use async_trait::async_trait;

use crate::model::Event;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("handler {handler} failed: {message}")]
    HandlerFailed { handler: String, message: String },

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

/// A subscriber registered for one event type.
///
/// A handler failure is always logged by the Dispatcher itself; whether it
/// is also surfaced to the producer depends on which publish entry point
/// the producer used (see [`InProcessDispatcher::publish`] vs
/// [`InProcessDispatcher::dispatch`]). The Dispatcher itself never retries
/// a failed handler — that is the producer-specific retry mechanism's job
/// (the Outbox Relay's own retry, the Step Executor's response emission).
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<()>;

    /// Name used in logs and failure messages.
    fn name(&self) -> &str;
}
