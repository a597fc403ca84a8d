use crate::payments::error::PaymentResult;
use crate::payments::types::{
    AckOutcome, CallbackPayload, ChannelCode, ChannelResult, CorrelationKey, PaymentMethod,
    PaymentRecord,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// Capability surface of one configured provider account.
///
/// `pay` and `refund` never return an error: business declines, transport
/// failures and malformed responses all come back as a `Failed` result so the
/// orchestrator can persist them. `query_status` may error, in which case the
/// caller leaves the record untouched.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel_code(&self) -> ChannelCode;

    fn account_id(&self) -> &str;

    fn supported_methods(&self) -> &'static [PaymentMethod];

    fn supported_currencies(&self) -> &'static [&'static str];

    /// Submit the charge. Sent exactly once.
    async fn pay(&self, record: &PaymentRecord) -> ChannelResult;

    async fn refund(&self, record: &PaymentRecord) -> ChannelResult;

    async fn query_status(&self, record: &PaymentRecord) -> PaymentResult<ChannelResult>;

    fn extract_correlation_key(&self, callback: &CallbackPayload) -> Option<CorrelationKey>;

    /// Verify and translate a webhook delivery. Signature checks live here.
    fn normalize_callback(&self, callback: &CallbackPayload) -> PaymentResult<ChannelResult>;

    /// Body returned to the provider alongside HTTP 200.
    fn acknowledgment(&self, outcome: AckOutcome) -> JsonValue {
        match outcome {
            AckOutcome::Accepted => serde_json::json!({ "status": "ok" }),
            AckOutcome::NotFound => {
                serde_json::json!({ "status": "error", "message": "payment not found" })
            }
            AckOutcome::Rejected => {
                serde_json::json!({ "status": "error", "message": "callback rejected" })
            }
        }
    }

    fn supports_method(&self, method: PaymentMethod) -> bool {
        self.supported_methods().contains(&method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::PaymentStatus;
    use bigdecimal::BigDecimal;

    struct MockAdapter;

    #[async_trait]
    impl ChannelAdapter for MockAdapter {
        fn channel_code(&self) -> ChannelCode {
            ChannelCode::Paystack
        }

        fn account_id(&self) -> &str {
            "mock-account"
        }

        fn supported_methods(&self) -> &'static [PaymentMethod] {
            &[PaymentMethod::Card]
        }

        fn supported_currencies(&self) -> &'static [&'static str] {
            &["NGN"]
        }

        async fn pay(&self, record: &PaymentRecord) -> ChannelResult {
            ChannelResult::new(PaymentStatus::Pending, "pending")
                .with_channel_payment_id(Some(record.id.to_string()))
        }

        async fn refund(&self, _record: &PaymentRecord) -> ChannelResult {
            ChannelResult::new(PaymentStatus::Success, "processed")
        }

        async fn query_status(&self, _record: &PaymentRecord) -> PaymentResult<ChannelResult> {
            Ok(ChannelResult::new(PaymentStatus::Success, "success"))
        }

        fn extract_correlation_key(&self, callback: &CallbackPayload) -> Option<CorrelationKey> {
            callback.path_payment_id().map(CorrelationKey::PaymentId)
        }

        fn normalize_callback(&self, _callback: &CallbackPayload) -> PaymentResult<ChannelResult> {
            Ok(ChannelResult::new(PaymentStatus::Success, "success"))
        }
    }

    #[tokio::test]
    async fn trait_can_be_implemented_by_mock_adapter() {
        let adapter: Box<dyn ChannelAdapter> = Box::new(MockAdapter);
        let amount = BigDecimal::from(1000);
        let record = PaymentRecord::new_pending(
            crate::payments::types::NewPayment {
                order_id: "order-1",
                user_id: "user-1",
                payment_method: PaymentMethod::Card,
                currency: "NGN",
                amount: &amount,
                payer: Default::default(),
            },
            chrono::Utc::now(),
            chrono::Duration::minutes(30),
        );

        let result = adapter.pay(&record).await;
        assert_eq!(result.status, PaymentStatus::Pending);
        assert_eq!(result.channel_payment_id, Some(record.id.to_string()));

        assert!(adapter.supports_method(PaymentMethod::Card));
        assert!(!adapter.supports_method(PaymentMethod::MobileMoney));
        assert_eq!(
            adapter.acknowledgment(AckOutcome::Accepted),
            serde_json::json!({ "status": "ok" })
        );

        let callback = CallbackPayload::new(Some(record.id.to_string()), b"{}".to_vec());
        assert_eq!(
            adapter.extract_correlation_key(&callback),
            Some(CorrelationKey::PaymentId(record.id))
        );
    }
}
