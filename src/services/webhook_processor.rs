use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::database::payment_repository::PaymentLedger;
use crate::payments::error::PaymentError;
use crate::payments::provider::ChannelAdapter;
use crate::payments::registry::ChannelRegistry;
use crate::payments::types::{AckOutcome, CallbackPayload, ChannelCode, CorrelationKey, PaymentRecord};
use crate::services::payment_orchestrator::{ApplyOutcome, OrchestratorError, PaymentOrchestrator};

#[derive(Debug, Error)]
pub enum WebhookProcessorError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
    #[error("No adapter registered for channel {0}")]
    ChannelNotRegistered(ChannelCode),
    #[error("Callback carries no payment reference")]
    Uncorrelated,
    #[error("No payment matches {0:?}")]
    PaymentNotFound(CorrelationKey),
    #[error("Payment {payment_id} belongs to {expected:?}, callback came from {received}")]
    ChannelMismatch {
        payment_id: Uuid,
        expected: Option<ChannelCode>,
        received: ChannelCode,
    },
    #[error("Invalid callback: {0}")]
    InvalidCallback(#[from] PaymentError),
    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),
    #[error("Processing error: {0}")]
    ProcessingError(#[from] OrchestratorError),
}

impl WebhookProcessorError {
    /// What the provider is told. A mismatch is acknowledged so the provider
    /// stops redelivering a callback we will never apply.
    pub fn ack_outcome(&self) -> AckOutcome {
        match self {
            WebhookProcessorError::UnknownChannel(_)
            | WebhookProcessorError::ChannelNotRegistered(_)
            | WebhookProcessorError::Uncorrelated
            | WebhookProcessorError::PaymentNotFound(_) => AckOutcome::NotFound,
            WebhookProcessorError::ChannelMismatch { .. } => AckOutcome::Accepted,
            WebhookProcessorError::InvalidCallback(_)
            | WebhookProcessorError::DatabaseError(_)
            | WebhookProcessorError::ProcessingError(_) => AckOutcome::Rejected,
        }
    }
}

/// Body and outcome returned to the provider. Always sent with HTTP 200.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookAck {
    pub body: JsonValue,
    pub outcome: AckOutcome,
}

impl WebhookAck {
    fn generic(outcome: AckOutcome) -> Self {
        let body = match outcome {
            AckOutcome::Accepted => serde_json::json!({ "status": "ok" }),
            AckOutcome::NotFound => {
                serde_json::json!({ "status": "error", "message": "unknown channel" })
            }
            AckOutcome::Rejected => serde_json::json!({ "status": "error" }),
        };
        Self { body, outcome }
    }
}

pub struct WebhookProcessor {
    registry: Arc<ChannelRegistry>,
    ledger: Arc<dyn PaymentLedger>,
    orchestrator: Arc<PaymentOrchestrator>,
}

impl WebhookProcessor {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        ledger: Arc<dyn PaymentLedger>,
        orchestrator: Arc<PaymentOrchestrator>,
    ) -> Self {
        Self {
            registry,
            ledger,
            orchestrator,
        }
    }

    /// Reconcile one provider callback against the ledger. Never fails; every
    /// problem is turned into the channel's acknowledgment body.
    pub async fn reconcile(&self, channel: &str, callback: CallbackPayload) -> WebhookAck {
        let code = match self.parse_channel(channel) {
            Ok(code) => code,
            Err(e) => {
                warn!(channel = %channel, error = %e, "webhook for unknown channel");
                return WebhookAck::generic(e.ack_outcome());
            }
        };

        let Some(adapter) = self.registry.adapter_for_channel(code) else {
            let e = WebhookProcessorError::ChannelNotRegistered(code);
            warn!(channel = %code, error = %e, "webhook for channel without adapter");
            return WebhookAck::generic(e.ack_outcome());
        };

        let outcome = match self.process(code, adapter.as_ref(), &callback).await {
            Ok(outcome) => outcome,
            Err(e) => {
                match &e {
                    WebhookProcessorError::DatabaseError(_)
                    | WebhookProcessorError::ProcessingError(_) => {
                        error!(channel = %code, error = %e, "webhook processing failed")
                    }
                    _ => warn!(channel = %code, error = %e, "webhook not applied"),
                }
                e.ack_outcome()
            }
        };

        WebhookAck {
            body: adapter.acknowledgment(outcome),
            outcome,
        }
    }

    async fn process(
        &self,
        code: ChannelCode,
        channel_adapter: &dyn ChannelAdapter,
        callback: &CallbackPayload,
    ) -> Result<AckOutcome, WebhookProcessorError> {
        let key = channel_adapter
            .extract_correlation_key(callback)
            .ok_or(WebhookProcessorError::Uncorrelated)?;
        let record = self.find_record(code, &key).await?;

        if record.channel_code != Some(code) {
            return Err(WebhookProcessorError::ChannelMismatch {
                payment_id: record.id,
                expected: record.channel_code,
                received: code,
            });
        }

        // Verify with the account that issued the charge; its secrets may
        // differ from the channel's default account.
        let owner = record
            .channel_account_id
            .as_deref()
            .and_then(|account_id| self.registry.adapter(account_id));
        let result = match &owner {
            Some(adapter) => adapter.normalize_callback(callback)?,
            None => channel_adapter.normalize_callback(callback)?,
        };

        match self
            .orchestrator
            .apply_channel_result(&record, result, "webhook")
            .await?
        {
            ApplyOutcome::Settled(updated) => info!(
                payment_id = %updated.id,
                channel = %code,
                status = %updated.status,
                "webhook settled payment"
            ),
            ApplyOutcome::Refreshed(updated) => info!(
                payment_id = %updated.id,
                channel = %code,
                channel_status = updated.channel_status.as_deref().unwrap_or(""),
                "webhook refreshed pending payment"
            ),
            ApplyOutcome::Ignored(_) => {}
        }

        Ok(AckOutcome::Accepted)
    }

    async fn find_record(
        &self,
        code: ChannelCode,
        key: &CorrelationKey,
    ) -> Result<PaymentRecord, WebhookProcessorError> {
        let found = match key {
            CorrelationKey::PaymentId(id) => self.ledger.find_by_id(*id).await?,
            CorrelationKey::ChannelPaymentId(channel_id) => {
                self.ledger.find_by_channel_payment_id(code, channel_id).await?
            }
        };
        found.ok_or_else(|| WebhookProcessorError::PaymentNotFound(key.clone()))
    }

    fn parse_channel(&self, channel: &str) -> Result<ChannelCode, WebhookProcessorError> {
        match channel.parse::<ChannelCode>() {
            Ok(code) if !code.is_internal() => Ok(code),
            _ => Err(WebhookProcessorError::UnknownChannel(channel.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::{InMemoryOrderGateway, InMemoryPaymentLedger, InMemoryRouteSource};
    use crate::payments::factory::ChannelAdapterFactory;
    use crate::services::checkout::{CheckoutService, InMemoryTicketStore};
    use crate::services::payment_orchestrator::OrchestratorConfig;
    use crate::workers::background::TaskQueue;
    use std::time::Duration;

    fn processor() -> WebhookProcessor {
        let ledger = Arc::new(InMemoryPaymentLedger::new());
        let orders = Arc::new(InMemoryOrderGateway::new());
        let registry = Arc::new(ChannelRegistry::new(
            Arc::new(InMemoryRouteSource::default()),
            Arc::new(ChannelAdapterFactory::new("https://pay.example.com")),
        ));
        let checkout = Arc::new(CheckoutService::new(
            Arc::new(InMemoryTicketStore::new()),
            orders.clone(),
            ledger.clone(),
            Duration::from_secs(900),
        ));
        let (tasks, _rx) = TaskQueue::channel(8);
        let orchestrator = Arc::new(PaymentOrchestrator::new(
            ledger.clone(),
            orders,
            registry.clone(),
            checkout,
            tasks,
            OrchestratorConfig::default(),
        ));
        WebhookProcessor::new(registry, ledger, orchestrator)
    }

    #[test]
    fn mismatch_is_acknowledged_but_bad_payloads_are_rejected() {
        let mismatch = WebhookProcessorError::ChannelMismatch {
            payment_id: Uuid::new_v4(),
            expected: Some(ChannelCode::Paystack),
            received: ChannelCode::Flutterwave,
        };
        assert_eq!(mismatch.ack_outcome(), AckOutcome::Accepted);

        let invalid = WebhookProcessorError::InvalidCallback(PaymentError::WebhookVerificationError {
            message: "bad signature".to_string(),
        });
        assert_eq!(invalid.ack_outcome(), AckOutcome::Rejected);
        assert_eq!(
            WebhookProcessorError::Uncorrelated.ack_outcome(),
            AckOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn unknown_and_internal_channels_get_not_found() {
        let processor = processor();
        for channel in ["stripe", "cash", "sandbox"] {
            let ack = processor
                .reconcile(channel, CallbackPayload::new(None, b"{}".to_vec()))
                .await;
            assert_eq!(ack.outcome, AckOutcome::NotFound);
        }
    }

    #[tokio::test]
    async fn channel_without_adapter_is_not_found() {
        let ack = processor()
            .reconcile("paystack", CallbackPayload::new(None, b"{}".to_vec()))
            .await;
        assert_eq!(ack.outcome, AckOutcome::NotFound);
        assert_eq!(ack.body["status"], "error");
    }
}
