//! Reference three-step workflow wiring for the canonical order-processing
//! saga.

use super::{SagaDefinition, StepDescriptor};

/// The canonical `OrderProcessing` saga: validate, charge, ship. Per-step
/// HTTP timeouts live on the `StepEndpoint`s the Step Executor is
/// constructed with, not on this definition.
pub fn order_processing() -> SagaDefinition {
    SagaDefinition::new(
        "OrderProcessing",
        vec![
            StepDescriptor::new("ValidateOrder", "order-created", 3),
            StepDescriptor::new("ChargePayment", "order-processed", 3),
            StepDescriptor::new("ShipOrder", "order-shipped", 3),
        ],
    )
}
