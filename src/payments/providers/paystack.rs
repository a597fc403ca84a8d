use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::ChannelAdapter;
use crate::payments::types::{
    CallbackPayload, ChannelAccount, ChannelCode, ChannelResult, CorrelationKey,
    PaymentMethod, PaymentRecord, PaymentStatus, ResultKind,
};
use crate::payments::utils::{
    from_minor_units, json_string, parse_account_settings, to_minor_units,
    verify_hmac_sha512_hex, PaymentHttpClient,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

fn default_base_url() -> String {
    "https://api.paystack.co".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaystackConfig {
    #[serde(default)]
    pub public_key: Option<String>,
    pub secret_key: String,
    /// Falls back to `secret_key`, which is what Paystack signs webhooks with.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Customer redirect after the hosted page completes.
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// Client-completed flow: initialize hands back an access code and an
/// authorization URL; settlement arrives by webhook.
pub struct PaystackAdapter {
    account_id: String,
    config: PaystackConfig,
    http: PaymentHttpClient,
}

impl PaystackAdapter {
    pub fn new(account_id: impl Into<String>, config: PaystackConfig) -> PaymentResult<Self> {
        let account_id = account_id.into();
        if config.secret_key.trim().is_empty() {
            return Err(PaymentError::ConfigurationError {
                account_id,
                message: "secret_key is required".to_string(),
            });
        }
        let http = PaymentHttpClient::new(
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self {
            account_id,
            config,
            http,
        })
    }

    pub fn from_account(account: &ChannelAccount) -> PaymentResult<Self> {
        let config = parse_account_settings(&account.account_id, &account.settings)?;
        Self::new(account.account_id.clone(), config)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    pub fn map_status(native: &str) -> PaymentStatus {
        match native.trim().to_lowercase().as_str() {
            "success" => PaymentStatus::Success,
            "failed" | "reversed" => PaymentStatus::Failed,
            "abandoned" => PaymentStatus::Cancelled,
            _ => PaymentStatus::Pending,
        }
    }

    fn channels(method: PaymentMethod) -> &'static [&'static str] {
        match method {
            PaymentMethod::Card => &["card"],
            PaymentMethod::BankTransfer => &["bank_transfer", "bank"],
            PaymentMethod::MobileMoney => &["mobile_money"],
            PaymentMethod::Ussd => &["ussd"],
            PaymentMethod::Cash => &["card", "bank_transfer"],
        }
    }

    fn webhook_secret(&self) -> &str {
        self.config
            .webhook_secret
            .as_deref()
            .unwrap_or(&self.config.secret_key)
    }

    async fn initialize(&self, record: &PaymentRecord) -> PaymentResult<ChannelResult> {
        let email = record
            .payer
            .email
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or(PaymentError::ValidationError {
                message: "payer email is required for paystack initialization".to_string(),
                field: Some("payer.email".to_string()),
            })?;

        let payload = serde_json::json!({
            "email": email,
            "amount": to_minor_units(&record.amount, 2)?.to_string(),
            "currency": record.currency,
            "reference": record.id.to_string(),
            "callback_url": self.config.callback_url,
            "channels": Self::channels(record.payment_method),
            "metadata": { "order_id": record.order_id, "payment_id": record.id },
        });

        let raw: PaystackEnvelope<PaystackInitializeData> = self
            .http
            .send_once(
                reqwest::Method::POST,
                &self.endpoint("/transaction/initialize"),
                Some(&self.config.secret_key),
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await?;

        if !raw.status {
            return Err(PaymentError::PaymentDeclinedError {
                message: raw.message,
                provider_code: Some("initialize_rejected".to_string()),
            });
        }
        let data = raw.data.ok_or_else(|| {
            PaymentError::provider_error("paystack", "initialize response carried no data")
        })?;
        info!(
            payment_id = %record.id,
            account = %self.account_id,
            reference = %data.reference,
            "paystack transaction initialized"
        );

        let mut result = ChannelResult::new(PaymentStatus::Pending, "initialized")
            .with_channel_payment_id(Some(data.reference.clone()));
        result.redirect_url = Some(data.authorization_url);
        result.client_token = Some(data.access_code);
        Ok(result)
    }

    fn reference(record: &PaymentRecord) -> String {
        record
            .channel_payment_id
            .clone()
            .unwrap_or_else(|| record.id.to_string())
    }
}

#[async_trait]
impl ChannelAdapter for PaystackAdapter {
    fn channel_code(&self) -> ChannelCode {
        ChannelCode::Paystack
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn supported_methods(&self) -> &'static [PaymentMethod] {
        &[
            PaymentMethod::Card,
            PaymentMethod::BankTransfer,
            PaymentMethod::Ussd,
            PaymentMethod::MobileMoney,
        ]
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["NGN", "GHS", "ZAR", "KES", "USD"]
    }

    async fn pay(&self, record: &PaymentRecord) -> ChannelResult {
        match self.initialize(record).await {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    payment_id = %record.id,
                    channel = "paystack",
                    account = %self.account_id,
                    error = %err,
                    "paystack initialization did not go through"
                );
                ChannelResult::from_error(&err)
            }
        }
    }

    async fn refund(&self, record: &PaymentRecord) -> ChannelResult {
        let payload = serde_json::json!({ "transaction": Self::reference(record) });
        let raw: PaymentResult<PaystackEnvelope<JsonValue>> = self
            .http
            .send_once(
                reqwest::Method::POST,
                &self.endpoint("/refund"),
                Some(&self.config.secret_key),
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await;

        match raw {
            Ok(raw) if raw.status => {
                let data = raw.data.unwrap_or_else(|| serde_json::json!({}));
                let native = json_string(&data, "/status").unwrap_or_else(|| "pending".to_string());
                let status = match native.as_str() {
                    "processed" => PaymentStatus::Success,
                    "failed" => PaymentStatus::Failed,
                    _ => PaymentStatus::Pending,
                };
                ChannelResult::new(status, native).with_payload(data)
            }
            Ok(raw) => ChannelResult::failed("refund_rejected", raw.message),
            Err(err) => {
                warn!(payment_id = %record.id, error = %err, "paystack refund failed");
                ChannelResult::from_error(&err)
            }
        }
    }

    async fn query_status(&self, record: &PaymentRecord) -> PaymentResult<ChannelResult> {
        let reference = Self::reference(record);
        let raw: PaystackEnvelope<PaystackVerifyData> = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(&format!("/transaction/verify/{}", reference)),
                Some(&self.config.secret_key),
                None,
                &[],
            )
            .await?;

        if !raw.status {
            return Err(PaymentError::provider_error("paystack", raw.message));
        }
        let data = raw.data.ok_or_else(|| {
            PaymentError::provider_error("paystack", "verify response carried no data")
        })?;

        let mut result = ChannelResult::new(Self::map_status(&data.status), data.status.clone())
            .with_channel_payment_id(Some(reference))
            .with_code(data.status.clone())
            .with_settlement(
                Some(from_minor_units(data.amount, 2)),
                Some(data.currency.clone()),
            );
        result.result_message = data.gateway_response.clone();
        Ok(result)
    }

    fn extract_correlation_key(&self, callback: &CallbackPayload) -> Option<CorrelationKey> {
        if let Some(id) = callback.path_payment_id() {
            return Some(CorrelationKey::PaymentId(id));
        }
        let parsed = callback.json().ok()?;
        // Refund events name the charge in `transaction_reference`.
        let reference = json_string(&parsed, "/data/transaction_reference")
            .or_else(|| json_string(&parsed, "/data/reference"))?;
        match Uuid::parse_str(&reference) {
            Ok(id) => Some(CorrelationKey::PaymentId(id)),
            Err(_) => Some(CorrelationKey::ChannelPaymentId(reference)),
        }
    }

    fn normalize_callback(&self, callback: &CallbackPayload) -> PaymentResult<ChannelResult> {
        let signature = callback.header("x-paystack-signature").unwrap_or("");
        if !verify_hmac_sha512_hex(&callback.body, self.webhook_secret(), signature) {
            return Err(PaymentError::WebhookVerificationError {
                message: "invalid paystack signature".to_string(),
            });
        }
        let parsed = callback.json()?;
        let event = json_string(&parsed, "/event").unwrap_or_else(|| "unknown".to_string());

        if event.starts_with("refund.") {
            let status = match event.as_str() {
                "refund.processed" => PaymentStatus::Success,
                "refund.failed" => PaymentStatus::Failed,
                _ => PaymentStatus::Pending,
            };
            return Ok(ChannelResult::new(status, event)
                .with_kind(ResultKind::Refund)
                .with_payload(parsed));
        }

        // Transfers and subscriptions are acknowledged without effect.
        if !event.starts_with("charge.") {
            return Ok(ChannelResult::new(PaymentStatus::Pending, event).with_payload(parsed));
        }

        let native = json_string(&parsed, "/data/status");
        let status = native
            .as_deref()
            .map(Self::map_status)
            .unwrap_or(PaymentStatus::Pending);
        let amount = json_string(&parsed, "/data/amount")
            .and_then(|a| a.parse::<i64>().ok())
            .map(|a| from_minor_units(a, 2));
        let mut result = ChannelResult::new(status, native.clone().unwrap_or(event))
            .with_channel_payment_id(json_string(&parsed, "/data/reference"))
            .with_settlement(amount, json_string(&parsed, "/data/currency"))
            .require_settlement();
        result.result_code = native;
        result.result_message = json_string(&parsed, "/data/gateway_response");
        Ok(result.with_payload(parsed))
    }
}

#[derive(Debug, Deserialize)]
struct PaystackEnvelope<T> {
    status: bool,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct PaystackInitializeData {
    authorization_url: String,
    access_code: String,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct PaystackVerifyData {
    amount: i64,
    currency: String,
    status: String,
    #[serde(default)]
    gateway_response: Option<String>,
}
