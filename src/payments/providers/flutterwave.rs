use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::ChannelAdapter;
use crate::payments::types::{
    result_codes, CallbackPayload, ChannelAccount, ChannelCode, ChannelResult, CorrelationKey,
    PaymentMethod, PaymentRecord, PaymentStatus,
};
use crate::payments::utils::{json_string, parse_account_settings, secure_eq, PaymentHttpClient};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

fn default_base_url() -> String {
    "https://api.flutterwave.com/v3".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_checkout_title() -> String {
    "Marketplace order".to_string()
}

/// Account settings for a Flutterwave channel account.
#[derive(Debug, Clone, Deserialize)]
pub struct FlutterwaveConfig {
    pub secret_key: String,
    /// Shared secret echoed back in the `verif-hash` header.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Where hosted checkout sends the customer afterwards.
    #[serde(default)]
    pub redirect_url: Option<String>,
    #[serde(default = "default_checkout_title")]
    pub checkout_title: String,
}

/// Synchronous accept with asynchronous webhook settlement.
pub struct FlutterwaveAdapter {
    account_id: String,
    config: FlutterwaveConfig,
    http: PaymentHttpClient,
}

impl FlutterwaveAdapter {
    pub fn new(account_id: impl Into<String>, config: FlutterwaveConfig) -> PaymentResult<Self> {
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

    /// Webhook delivery is configured on the Flutterwave dashboard, so no
    /// per-request callback URL is sent.
    pub fn from_account(account: &ChannelAccount) -> PaymentResult<Self> {
        let config = parse_account_settings(&account.account_id, &account.settings)?;
        Self::new(account.account_id.clone(), config)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Native transaction status to canonical status. Unknown values stay pending.
    pub fn map_status(native: &str) -> PaymentStatus {
        match native.trim().to_lowercase().as_str() {
            "successful" | "success" | "completed" => PaymentStatus::Success,
            "failed" | "error" => PaymentStatus::Failed,
            "cancelled" | "canceled" => PaymentStatus::Cancelled,
            _ => PaymentStatus::Pending,
        }
    }

    /// Direct-charge type for mobile money, keyed by currency.
    fn mobile_money_type(currency: &str) -> Option<&'static str> {
        match currency {
            "RWF" => Some("mobile_money_rwanda"),
            "UGX" => Some("mobile_money_uganda"),
            "GHS" => Some("mobile_money_ghana"),
            "ZMW" => Some("mobile_money_zambia"),
            "XAF" | "XOF" => Some("mobile_money_franco"),
            "TZS" => Some("mobile_money_tanzania"),
            "KES" => Some("mpesa"),
            _ => None,
        }
    }

    fn map_message_error(message: String) -> PaymentError {
        let lowered = message.to_lowercase();
        if lowered.contains("insufficient") || lowered.contains("low balance") {
            return PaymentError::InsufficientFundsError { message };
        }
        if lowered.contains("declined")
            || lowered.contains("do not honor")
            || lowered.contains("expired card")
        {
            return PaymentError::PaymentDeclinedError {
                message,
                provider_code: Some("declined".to_string()),
            };
        }
        if lowered.contains("too many requests") || lowered.contains("rate limit") {
            return PaymentError::RateLimitError {
                message,
                retry_after_seconds: None,
            };
        }
        if lowered.contains("invalid")
            || lowered.contains("missing")
            || lowered.contains("not found")
            || lowered.contains("unsupported")
        {
            return PaymentError::ValidationError {
                message,
                field: None,
            };
        }
        PaymentError::ProviderError {
            provider: "flutterwave".to_string(),
            message,
            provider_code: None,
            retryable: false,
        }
    }

    fn remap(err: PaymentError) -> PaymentError {
        match err {
            PaymentError::ProviderError {
                message,
                provider_code: Some(_),
                ..
            } => Self::map_message_error(message),
            other => other,
        }
    }

    fn required_email(record: &PaymentRecord) -> PaymentResult<String> {
        record
            .payer
            .email
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or(PaymentError::ValidationError {
                message: "payer email is required for flutterwave".to_string(),
                field: Some("payer.email".to_string()),
            })
    }

    async fn initiate(&self, record: &PaymentRecord) -> PaymentResult<ChannelResult> {
        let email = Self::required_email(record)?;
        let tx_ref = record.id.to_string();

        if record.payment_method == PaymentMethod::MobileMoney {
            if let Some(charge_type) = Self::mobile_money_type(&record.currency) {
                return self.charge_mobile_money(record, charge_type, &tx_ref, &email).await;
            }
        }

        let payment_options = match record.payment_method {
            PaymentMethod::Card => "card",
            PaymentMethod::BankTransfer => "banktransfer",
            PaymentMethod::MobileMoney => "mobilemoney",
            PaymentMethod::Ussd => "ussd",
            PaymentMethod::Cash => "card,banktransfer,ussd",
        };

        let payload = serde_json::json!({
            "tx_ref": tx_ref,
            "amount": record.amount.to_string(),
            "currency": record.currency,
            "redirect_url": self.config.redirect_url,
            "payment_options": payment_options,
            "customer": {
                "email": email,
                "phonenumber": record.payer.phone,
                "name": record.payer.name,
            },
            "meta": { "order_id": record.order_id },
            "customizations": {
                "title": self.config.checkout_title,
            }
        });

        let raw: FlutterwaveEnvelope = self
            .http
            .send_once(
                reqwest::Method::POST,
                &self.endpoint("/payments"),
                Some(&self.config.secret_key),
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await
            .map_err(Self::remap)?;

        if raw.status.to_lowercase() != "success" {
            return Err(Self::map_message_error(raw.message));
        }

        let data = raw.data.unwrap_or_else(|| serde_json::json!({}));
        let link = json_string(&data, "/link")
            .or_else(|| json_string(&data, "/checkout_url"))
            .ok_or_else(|| {
                PaymentError::provider_error("flutterwave", "missing payment link in response")
            })?;

        info!(payment_id = %record.id, account = %self.account_id, "flutterwave checkout initiated");

        let mut result = ChannelResult::new(PaymentStatus::Pending, "pending").with_payload(data);
        result.redirect_url = Some(link);
        Ok(result)
    }

    async fn charge_mobile_money(
        &self,
        record: &PaymentRecord,
        charge_type: &str,
        tx_ref: &str,
        email: &str,
    ) -> PaymentResult<ChannelResult> {
        let phone = record
            .payer
            .phone
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or(PaymentError::ValidationError {
                message: "payer phone is required for mobile money".to_string(),
                field: Some("payer.phone".to_string()),
            })?;

        let payload = serde_json::json!({
            "tx_ref": tx_ref,
            "amount": record.amount.to_string(),
            "currency": record.currency,
            "email": email,
            "phone_number": phone,
            "fullname": record.payer.name,
            "redirect_url": self.config.redirect_url,
            "meta": { "order_id": record.order_id },
        });
        let url = format!("{}?type={}", self.endpoint("/charges"), charge_type);

        let raw: FlutterwaveEnvelope = self
            .http
            .send_once(
                reqwest::Method::POST,
                &url,
                Some(&self.config.secret_key),
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await
            .map_err(Self::remap)?;

        if raw.status.to_lowercase() != "success" {
            return Err(Self::map_message_error(raw.message));
        }

        let data = raw.data.unwrap_or_else(|| serde_json::json!({}));
        let native = json_string(&data, "/status").unwrap_or_else(|| "pending".to_string());
        let mut result = ChannelResult::new(Self::map_status(&native), native)
            .with_channel_payment_id(json_string(&data, "/id"))
            .with_message(raw.message);
        result.redirect_url = raw
            .meta
            .as_ref()
            .and_then(|m| json_string(m, "/authorization/redirect"));
        if result.status == PaymentStatus::Failed {
            result.result_code = json_string(&data, "/processor_response")
                .or_else(|| Some("declined".to_string()));
        }

        info!(
            payment_id = %record.id,
            account = %self.account_id,
            charge_type,
            status = %result.status,
            "flutterwave mobile money charge submitted"
        );
        Ok(result.with_payload(data))
    }

    async fn verify(&self, record: &PaymentRecord) -> PaymentResult<ChannelResult> {
        let url = format!(
            "{}?tx_ref={}",
            self.endpoint("/transactions/verify_by_reference"),
            record.id
        );
        let raw: FlutterwaveEnvelope = self
            .http
            .request_json(
                reqwest::Method::GET,
                &url,
                Some(&self.config.secret_key),
                None,
                &[],
            )
            .await
            .map_err(Self::remap)?;

        if raw.status.to_lowercase() != "success" {
            return Err(Self::map_message_error(raw.message));
        }

        let data = raw.data.unwrap_or_else(|| serde_json::json!({}));
        let native = json_string(&data, "/status").unwrap_or_else(|| "unknown".to_string());
        let (amount, currency) = Self::settlement(&data);
        let mut result = ChannelResult::new(Self::map_status(&native), native.clone())
            .with_channel_payment_id(json_string(&data, "/id"))
            .with_code(native)
            .with_settlement(amount, currency)
            .require_settlement();
        result.result_message = json_string(&data, "/processor_response");
        Ok(result.with_payload(data))
    }

    /// Amount and currency a transaction node reports, both in major units.
    fn settlement(node: &JsonValue) -> (Option<BigDecimal>, Option<String>) {
        let amount = json_string(node, "/amount").and_then(|a| BigDecimal::from_str(&a).ok());
        (amount, json_string(node, "/currency"))
    }

    fn verify_hash(&self, callback: &CallbackPayload) -> PaymentResult<()> {
        let expected = self
            .config
            .webhook_secret
            .as_deref()
            .ok_or(PaymentError::WebhookVerificationError {
                message: "flutterwave webhook secret is not configured".to_string(),
            })?;
        let provided = callback.header("verif-hash").unwrap_or("");
        if secure_eq(expected.trim().as_bytes(), provided.trim().as_bytes()) {
            Ok(())
        } else {
            Err(PaymentError::WebhookVerificationError {
                message: "invalid flutterwave webhook hash".to_string(),
            })
        }
    }

    /// v3 payloads nest the transaction under `data`; legacy payloads are flat.
    fn transaction_node(parsed: &JsonValue) -> &JsonValue {
        match parsed.get("data") {
            Some(data) if data.is_object() => data,
            _ => parsed,
        }
    }
}

#[async_trait]
impl ChannelAdapter for FlutterwaveAdapter {
    fn channel_code(&self) -> ChannelCode {
        ChannelCode::Flutterwave
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn supported_methods(&self) -> &'static [PaymentMethod] {
        &[
            PaymentMethod::Card,
            PaymentMethod::BankTransfer,
            PaymentMethod::MobileMoney,
            PaymentMethod::Ussd,
        ]
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &[
            "NGN", "GHS", "KES", "RWF", "UGX", "TZS", "ZAR", "ZMW", "XAF", "XOF", "USD",
        ]
    }

    async fn pay(&self, record: &PaymentRecord) -> ChannelResult {
        match self.initiate(record).await {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    payment_id = %record.id,
                    channel = "flutterwave",
                    account = %self.account_id,
                    error = %err,
                    "flutterwave charge did not go through"
                );
                ChannelResult::from_error(&err)
            }
        }
    }

    async fn refund(&self, record: &PaymentRecord) -> ChannelResult {
        let Some(transaction_id) = record.channel_payment_id.as_deref() else {
            return ChannelResult::failed(
                result_codes::INVALID_REQUEST,
                "no flutterwave transaction id on record",
            );
        };
        let url = self.endpoint(&format!("/transactions/{}/refund", transaction_id));
        let payload = serde_json::json!({ "amount": record.amount.to_string() });

        let raw: PaymentResult<FlutterwaveEnvelope> = self
            .http
            .send_once(
                reqwest::Method::POST,
                &url,
                Some(&self.config.secret_key),
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await
            .map_err(Self::remap);

        match raw {
            Ok(raw) if raw.status.to_lowercase() == "success" => {
                let data = raw.data.unwrap_or_else(|| serde_json::json!({}));
                let native =
                    json_string(&data, "/status").unwrap_or_else(|| "pending".to_string());
                let status = match native.to_lowercase().as_str() {
                    "completed" | "successful" => PaymentStatus::Success,
                    "failed" => PaymentStatus::Failed,
                    _ => PaymentStatus::Pending,
                };
                ChannelResult::new(status, native)
                    .with_channel_payment_id(json_string(&data, "/id"))
                    .with_payload(data)
            }
            Ok(raw) => ChannelResult::from_error(&Self::map_message_error(raw.message)),
            Err(err) => {
                warn!(payment_id = %record.id, error = %err, "flutterwave refund failed");
                ChannelResult::from_error(&err)
            }
        }
    }

    async fn query_status(&self, record: &PaymentRecord) -> PaymentResult<ChannelResult> {
        self.verify(record).await
    }

    fn extract_correlation_key(&self, callback: &CallbackPayload) -> Option<CorrelationKey> {
        if let Some(id) = callback.path_payment_id() {
            return Some(CorrelationKey::PaymentId(id));
        }
        let parsed = callback.json().ok()?;
        let node = Self::transaction_node(&parsed);
        let tx_ref = json_string(node, "/tx_ref").or_else(|| json_string(node, "/txRef"));
        if let Some(id) = tx_ref.and_then(|r| Uuid::parse_str(&r).ok()) {
            return Some(CorrelationKey::PaymentId(id));
        }
        json_string(node, "/id").map(CorrelationKey::ChannelPaymentId)
    }

    fn normalize_callback(&self, callback: &CallbackPayload) -> PaymentResult<ChannelResult> {
        self.verify_hash(callback)?;
        let parsed = callback.json()?;

        if let Some(event) = json_string(&parsed, "/event") {
            if !event.starts_with("charge.") {
                return Ok(ChannelResult::new(PaymentStatus::Pending, event).with_payload(parsed));
            }
        }

        let node = Self::transaction_node(&parsed);
        let native = json_string(node, "/status");
        let status = native
            .as_deref()
            .map(Self::map_status)
            .unwrap_or(PaymentStatus::Pending);
        let (amount, currency) = Self::settlement(node);
        let mut result = ChannelResult::new(status, native.clone().unwrap_or_default())
            .with_channel_payment_id(json_string(node, "/id"))
            .with_settlement(amount, currency)
            .require_settlement();
        result.result_code = native;
        result.result_message = json_string(node, "/processor_response")
            .or_else(|| json_string(node, "/narration"));
        Ok(result.with_payload(parsed))
    }
}

#[derive(Debug, Deserialize)]
struct FlutterwaveEnvelope {
    status: String,
    message: String,
    #[serde(default)]
    data: Option<JsonValue>,
    #[serde(default)]
    meta: Option<JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::NewPayment;

    fn adapter() -> FlutterwaveAdapter {
        FlutterwaveAdapter::new(
            "fw-rw",
            FlutterwaveConfig {
                secret_key: "FLWSECK_TEST_demo".to_string(),
                webhook_secret: Some("hash_123".to_string()),
                base_url: default_base_url(),
                timeout_secs: 5,
                max_retries: 1,
                redirect_url: None,
                checkout_title: default_checkout_title(),
            },
        )
        .expect("adapter init should succeed")
    }

    fn record(amount: i64) -> PaymentRecord {
        let amount = BigDecimal::from(amount);
        PaymentRecord::new_pending(
            NewPayment {
                order_id: "O1",
                user_id: "u1",
                payment_method: PaymentMethod::MobileMoney,
                currency: "RWF",
                amount: &amount,
                payer: Default::default(),
            },
            chrono::Utc::now(),
            chrono::Duration::minutes(30),
        )
    }

    #[test]
    fn settings_parse_with_defaults() {
        let account = ChannelAccount {
            account_id: "fw-rw".to_string(),
            channel_code: ChannelCode::Flutterwave,
            is_enabled: true,
            settings: serde_json::json!({ "secret_key": "sk", "webhook_secret": "h" }),
            updated_at: chrono::Utc::now(),
        };
        let adapter = FlutterwaveAdapter::from_account(&account)
            .expect("settings should parse");
        assert_eq!(adapter.config.base_url, default_base_url());
        assert_eq!(adapter.account_id(), "fw-rw");

        let missing = ChannelAccount {
            settings: serde_json::json!({ "webhook_secret": "h" }),
            ..account
        };
        assert!(matches!(
            FlutterwaveAdapter::from_account(&missing),
            Err(PaymentError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn status_table_keeps_unknown_values_pending() {
        assert_eq!(
            FlutterwaveAdapter::map_status("successful"),
            PaymentStatus::Success
        );
        assert_eq!(FlutterwaveAdapter::map_status("FAILED"), PaymentStatus::Failed);
        assert_eq!(
            FlutterwaveAdapter::map_status("cancelled"),
            PaymentStatus::Cancelled
        );
        assert_eq!(
            FlutterwaveAdapter::map_status("something-new"),
            PaymentStatus::Pending
        );
    }

    #[test]
    fn callback_with_wrong_hash_is_rejected() {
        let adapter = adapter();
        let callback = CallbackPayload::new(None, br#"{"event":"charge.completed"}"#.to_vec())
            .with_header("verif-hash", "wrong");
        assert!(matches!(
            adapter.normalize_callback(&callback),
            Err(PaymentError::WebhookVerificationError { .. })
        ));
    }

    #[test]
    fn charge_completed_callback_is_normalized() {
        let adapter = adapter();
        let rec = record(5000);
        let body = serde_json::json!({
            "event": "charge.completed",
            "data": {
                "id": "TX123",
                "tx_ref": rec.id.to_string(),
                "flw_ref": "FLW-MOCK-1",
                "status": "successful",
                "amount": 5000,
                "currency": "RWF",
                "processor_response": "Approved"
            }
        });
        let callback = CallbackPayload::new(Some(rec.id.to_string()), body.to_string())
            .with_header("verif-hash", "hash_123");

        let result = adapter
            .normalize_callback(&callback)
            .expect("callback should normalize");
        assert_eq!(result.status, PaymentStatus::Success);
        assert_eq!(result.channel_payment_id.as_deref(), Some("TX123"));
        assert_eq!(result.result_message.as_deref(), Some("Approved"));
        assert!(result.settlement_covers(&rec));

        let without_path = CallbackPayload::new(None, body.to_string());
        assert_eq!(
            adapter.extract_correlation_key(&without_path),
            Some(CorrelationKey::PaymentId(rec.id))
        );
    }

    #[test]
    fn legacy_flat_payload_and_non_charge_events() {
        let adapter = adapter();
        let legacy = CallbackPayload::new(
            None,
            br#"{"event.type":"MOBILEMONEY_TRANSACTION","id":991,"txRef":"abc","status":"failed"}"#
                .to_vec(),
        )
        .with_header("verif-hash", "hash_123");
        let result = adapter.normalize_callback(&legacy).expect("legacy payload");
        assert_eq!(result.status, PaymentStatus::Failed);
        assert_eq!(
            adapter.extract_correlation_key(&legacy),
            Some(CorrelationKey::ChannelPaymentId("991".to_string()))
        );

        let transfer = CallbackPayload::new(
            None,
            br#"{"event":"transfer.completed","data":{"id":7,"status":"SUCCESSFUL"}}"#.to_vec(),
        )
        .with_header("verif-hash", "hash_123");
        let result = adapter.normalize_callback(&transfer).expect("transfer event");
        assert_eq!(result.status, PaymentStatus::Pending);
    }

    #[test]
    fn callbacks_report_what_was_collected() {
        let adapter = adapter();
        let rec = record(5000);
        let underpaid = serde_json::json!({
            "event": "charge.completed",
            "data": { "id": "TX9", "status": "successful", "amount": 1, "currency": "KES" }
        });
        let result = adapter
            .normalize_callback(
                &CallbackPayload::new(None, underpaid.to_string())
                    .with_header("verif-hash", "hash_123"),
            )
            .expect("signed payload");
        assert_eq!(result.status, PaymentStatus::Success);
        assert!(!result.settlement_covers(&rec));

        let silent = serde_json::json!({
            "event": "charge.completed",
            "data": { "id": "TX9", "status": "successful" }
        });
        let result = adapter
            .normalize_callback(
                &CallbackPayload::new(None, silent.to_string())
                    .with_header("verif-hash", "hash_123"),
            )
            .expect("signed payload");
        assert_eq!(result.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn pay_without_email_fails_without_calling_out() {
        let adapter = adapter();
        let result = adapter.pay(&record(5000)).await;
        assert_eq!(result.status, PaymentStatus::Failed);
        assert_eq!(
            result.result_code.as_deref(),
            Some(result_codes::INVALID_REQUEST)
        );
    }
}
