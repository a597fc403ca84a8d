//! Services module for payment business logic

pub mod checkout;
pub mod notification;
pub mod payment_orchestrator;
pub mod webhook_processor;

// Re-export orchestrator types
pub use crate::services::payment_orchestrator::{
    ApplyOutcome, ChargeOutcome, ChargeRequest, OrchestratorConfig, OrchestratorError,
    OrchestratorResult, PaymentOrchestrator, RefundOutcome,
};
pub use crate::services::webhook_processor::{WebhookAck, WebhookProcessor, WebhookProcessorError};
