use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::ChannelAdapter;
use crate::payments::types::{
    result_codes, AckOutcome, CallbackPayload, ChannelAccount, ChannelCode, ChannelResult,
    CorrelationKey, PaymentMethod, PaymentRecord, PaymentStatus, ResultKind,
};
use crate::payments::utils::{
    hmac_sha256_hex, json_string, parse_account_settings, secure_eq, to_minor_units,
    webhook_callback_url, PaymentHttpClient,
};
use async_trait::async_trait;
use base64::Engine;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

fn default_base_url() -> String {
    "https://sandbox.safaricom.co.ke".to_string()
}

fn default_transaction_type() -> String {
    "CustomerPayBillOnline".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_token_buffer_secs() -> i64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub passkey: String,
    pub shortcode: String,
    /// Keys the `token` query parameter on every URL handed to Daraja, which
    /// signs nothing itself.
    pub callback_secret: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_transaction_type")]
    pub transaction_type: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds before expiry at which a cached token is considered stale.
    #[serde(default = "default_token_buffer_secs")]
    pub token_buffer_secs: i64,
    /// Reversal credentials; refunds are refused without them.
    #[serde(default)]
    pub initiator_name: Option<String>,
    #[serde(default)]
    pub security_credential: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>, buffer: ChronoDuration) -> bool {
        now + buffer < self.expires_at
    }
}

/// Daraja STK push with an OAuth client-credentials token cached per account.
pub struct MpesaAdapter {
    account_id: String,
    config: MpesaConfig,
    callback_base_url: String,
    http: PaymentHttpClient,
    token: Mutex<Option<CachedToken>>,
}

impl MpesaAdapter {
    pub fn new(
        account_id: impl Into<String>,
        config: MpesaConfig,
        callback_base_url: impl Into<String>,
    ) -> PaymentResult<Self> {
        let account_id = account_id.into();
        for (name, value) in [
            ("consumer_key", &config.consumer_key),
            ("consumer_secret", &config.consumer_secret),
            ("passkey", &config.passkey),
            ("shortcode", &config.shortcode),
            ("callback_secret", &config.callback_secret),
        ] {
            if value.trim().is_empty() {
                return Err(PaymentError::ConfigurationError {
                    account_id,
                    message: format!("{} is required", name),
                });
            }
        }
        let http = PaymentHttpClient::new(
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self {
            account_id,
            config,
            callback_base_url: callback_base_url.into(),
            http,
            token: Mutex::new(None),
        })
    }

    pub fn from_account(account: &ChannelAccount, callback_base_url: &str) -> PaymentResult<Self> {
        let config = parse_account_settings(&account.account_id, &account.settings)?;
        Self::new(account.account_id.clone(), config, callback_base_url)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Returns a valid bearer token. The lock is held across the fetch so
    /// concurrent callers wait for one refresh instead of issuing their own.
    async fn access_token(&self) -> PaymentResult<String> {
        let mut guard = self.token.lock().await;
        let buffer = ChronoDuration::seconds(self.config.token_buffer_secs);
        if let Some(cached) = guard.as_ref() {
            if cached.is_fresh(Utc::now(), buffer) {
                return Ok(cached.value.clone());
            }
        }

        let credentials = base64::engine::general_purpose::STANDARD.encode(format!(
            "{}:{}",
            self.config.consumer_key, self.config.consumer_secret
        ));
        let authorization = format!("Basic {}", credentials);
        let raw: MpesaTokenResponse = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint("/oauth/v1/generate?grant_type=client_credentials"),
                None,
                None,
                &[("Authorization", authorization.as_str())],
            )
            .await?;

        let lifetime = raw
            .expires_in
            .as_deref()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(3599);
        let token = CachedToken {
            value: raw.access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(lifetime),
        };
        debug!(account = %self.account_id, expires_at = %token.expires_at, "mpesa token refreshed");
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    /// Token bound to one callback URL. Payment callbacks are scoped to the
    /// payment id; the C2B confirmation URL registered for the shortcode is
    /// scoped to the shortcode.
    fn callback_token(&self, scope: &str) -> PaymentResult<String> {
        hmac_sha256_hex(&self.config.callback_secret, scope.as_bytes()).ok_or_else(|| {
            PaymentError::ConfigurationError {
                account_id: self.account_id.clone(),
                message: "callback_secret is not a usable HMAC key".to_string(),
            }
        })
    }

    fn callback_url(&self, record: &PaymentRecord) -> PaymentResult<String> {
        let url = webhook_callback_url(
            &self.callback_base_url,
            ChannelCode::Mpesa.as_str(),
            &record.id,
        );
        let token = self.callback_token(&record.id.to_string())?;
        Ok(format!("{}?token={}", url, token))
    }

    fn verify_callback_token(&self, callback: &CallbackPayload) -> PaymentResult<()> {
        let scope = callback
            .path_key
            .as_deref()
            .map(str::trim)
            .unwrap_or(self.config.shortcode.as_str());
        let expected = self.callback_token(scope)?;
        let provided = callback.query_param("token").unwrap_or("");
        if secure_eq(expected.as_bytes(), provided.trim().as_bytes()) {
            Ok(())
        } else {
            Err(PaymentError::WebhookVerificationError {
                message: "invalid mpesa callback token".to_string(),
            })
        }
    }

    /// Daraja wants East Africa Time, formatted `YYYYMMDDHHmmss`.
    fn timestamp(now: DateTime<Utc>) -> String {
        (now.naive_utc() + ChronoDuration::hours(3))
            .format("%Y%m%d%H%M%S")
            .to_string()
    }

    fn password(&self, timestamp: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ))
    }

    /// `07XXXXXXXX`, `+2547XXXXXXXX` and `2547XXXXXXXX` all become `2547XXXXXXXX`.
    pub fn normalize_msisdn(phone: &str) -> Option<String> {
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        let msisdn = if let Some(rest) = digits.strip_prefix('0') {
            format!("254{}", rest)
        } else if digits.len() == 9 {
            format!("254{}", digits)
        } else {
            digits
        };
        (msisdn.len() == 12 && msisdn.starts_with("254")).then_some(msisdn)
    }

    /// STK result codes. Unknown codes stay pending and settle by polling.
    pub fn map_result_code(code: &str) -> PaymentStatus {
        match code.trim() {
            "0" => PaymentStatus::Success,
            "1032" => PaymentStatus::Cancelled,
            "1" | "1001" | "1019" | "1025" | "1037" | "2001" | "9999" => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        }
    }

    /// Callback precedence: an explicit result code always decides; a payload
    /// that only names a transaction id is not proof of settlement.
    pub fn resolve_callback_status(
        result_code: Option<&str>,
        transaction_id: Option<&str>,
    ) -> (PaymentStatus, String) {
        match (result_code, transaction_id) {
            (Some(code), _) => (Self::map_result_code(code), code.to_string()),
            (None, Some(_)) => (
                PaymentStatus::Pending,
                "confirmation_without_status".to_string(),
            ),
            (None, None) => (PaymentStatus::Pending, "unknown".to_string()),
        }
    }

    fn amount(value: Option<&str>) -> Option<BigDecimal> {
        value.and_then(|v| BigDecimal::from_str(v).ok())
    }

    fn metadata_item(stk: &JsonValue, name: &str) -> Option<String> {
        stk.pointer("/CallbackMetadata/Item")?
            .as_array()?
            .iter()
            .find(|item| item.get("Name").and_then(|n| n.as_str()) == Some(name))
            .and_then(|item| json_string(item, "/Value"))
    }

    async fn stk_push(&self, record: &PaymentRecord) -> PaymentResult<ChannelResult> {
        let phone = record
            .payer
            .phone
            .as_deref()
            .and_then(Self::normalize_msisdn)
            .ok_or(PaymentError::ValidationError {
                message: "a Safaricom phone number is required for M-Pesa".to_string(),
                field: Some("payer.phone".to_string()),
            })?;
        let amount = to_minor_units(&record.amount, 0)?;
        let timestamp = Self::timestamp(Utc::now());
        let account_reference: String = record.order_id.chars().take(12).collect();

        let payload = serde_json::json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "TransactionType": self.config.transaction_type,
            "Amount": amount,
            "PartyA": phone,
            "PartyB": self.config.shortcode,
            "PhoneNumber": phone,
            "CallBackURL": self.callback_url(record)?,
            "AccountReference": account_reference,
            "TransactionDesc": "Order payment",
        });

        let token = self.access_token().await?;
        let raw: JsonValue = self
            .http
            .send_once(
                reqwest::Method::POST,
                &self.endpoint("/mpesa/stkpush/v1/processrequest"),
                Some(&token),
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await?;

        let response_code = json_string(&raw, "/ResponseCode").unwrap_or_default();
        let description = json_string(&raw, "/ResponseDescription")
            .or_else(|| json_string(&raw, "/errorMessage"));
        if response_code != "0" {
            return Ok(ChannelResult::failed(
                json_string(&raw, "/errorCode").unwrap_or(response_code),
                description.unwrap_or_else(|| "STK push rejected".to_string()),
            )
            .with_payload(raw));
        }

        info!(
            payment_id = %record.id,
            account = %self.account_id,
            "mpesa STK push accepted"
        );
        let mut result = ChannelResult::new(PaymentStatus::Pending, "accepted")
            .with_channel_payment_id(json_string(&raw, "/CheckoutRequestID"));
        result.result_message = json_string(&raw, "/CustomerMessage").or(description);
        Ok(result.with_payload(raw))
    }

    async fn stk_query(&self, record: &PaymentRecord) -> PaymentResult<ChannelResult> {
        let checkout_request_id =
            record
                .channel_payment_id
                .clone()
                .ok_or(PaymentError::ValidationError {
                    message: "no CheckoutRequestID recorded for this payment".to_string(),
                    field: Some("channel_payment_id".to_string()),
                })?;
        let timestamp = Self::timestamp(Utc::now());
        let payload = serde_json::json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "CheckoutRequestID": checkout_request_id,
        });

        let token = self.access_token().await?;
        let raw: PaymentResult<JsonValue> = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/mpesa/stkpushquery/v1/query"),
                Some(&token),
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await;

        let raw = match raw {
            Ok(raw) => raw,
            // Daraja answers 500 "The transaction is being processed" while the
            // customer is still on the PIN prompt.
            Err(PaymentError::ProviderError { message, .. })
                if message.to_lowercase().contains("being processed") =>
            {
                return Ok(ChannelResult::new(PaymentStatus::Pending, "processing"));
            }
            Err(err) => return Err(err),
        };

        let code = json_string(&raw, "/ResultCode");
        let (status, native) = Self::resolve_callback_status(code.as_deref(), None);
        let mut result = ChannelResult::new(status, native.clone()).with_code(native);
        result.result_message = json_string(&raw, "/ResultDesc");
        Ok(result.with_payload(raw))
    }

    async fn reverse(&self, record: &PaymentRecord) -> PaymentResult<ChannelResult> {
        let (Some(initiator), Some(credential)) = (
            self.config.initiator_name.as_deref(),
            self.config.security_credential.as_deref(),
        ) else {
            return Ok(ChannelResult::failed(
                result_codes::REFUND_UNSUPPORTED,
                "reversal credentials are not configured for this account",
            ));
        };
        let receipt = record
            .channel_payment_id
            .clone()
            .ok_or(PaymentError::ValidationError {
                message: "no M-Pesa receipt recorded for this payment".to_string(),
                field: Some("channel_payment_id".to_string()),
            })?;
        let result_url = self.callback_url(record)?;
        let payload = serde_json::json!({
            "Initiator": initiator,
            "SecurityCredential": credential,
            "CommandID": "TransactionReversal",
            "TransactionID": receipt,
            "Amount": to_minor_units(&record.amount, 0)?,
            "ReceiverParty": self.config.shortcode,
            "RecieverIdentifierType": "11",
            "ResultURL": result_url,
            "QueueTimeOutURL": result_url,
            "Remarks": "Order refund",
            "Occasion": record.order_id,
        });

        let token = self.access_token().await?;
        let raw: JsonValue = self
            .http
            .send_once(
                reqwest::Method::POST,
                &self.endpoint("/mpesa/reversal/v1/request"),
                Some(&token),
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await?;

        let response_code = json_string(&raw, "/ResponseCode").unwrap_or_default();
        let description =
            json_string(&raw, "/ResponseDescription").unwrap_or_else(|| "reversal".to_string());
        if response_code == "0" {
            // Accepted for processing; the outcome arrives on the result URL.
            Ok(ChannelResult::new(PaymentStatus::Pending, "reversal_accepted")
                .with_message(description)
                .with_payload(raw))
        } else {
            Ok(ChannelResult::failed(response_code, description).with_payload(raw))
        }
    }
}

#[async_trait]
impl ChannelAdapter for MpesaAdapter {
    fn channel_code(&self) -> ChannelCode {
        ChannelCode::Mpesa
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn supported_methods(&self) -> &'static [PaymentMethod] {
        &[PaymentMethod::MobileMoney]
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["KES"]
    }

    async fn pay(&self, record: &PaymentRecord) -> ChannelResult {
        match self.stk_push(record).await {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    payment_id = %record.id,
                    channel = "mpesa",
                    account = %self.account_id,
                    error = %err,
                    "mpesa STK push did not go through"
                );
                ChannelResult::from_error(&err)
            }
        }
    }

    async fn refund(&self, record: &PaymentRecord) -> ChannelResult {
        match self.reverse(record).await {
            Ok(result) => result,
            Err(err) => {
                warn!(payment_id = %record.id, error = %err, "mpesa reversal failed");
                ChannelResult::from_error(&err)
            }
        }
    }

    async fn query_status(&self, record: &PaymentRecord) -> PaymentResult<ChannelResult> {
        self.stk_query(record).await
    }

    fn extract_correlation_key(&self, callback: &CallbackPayload) -> Option<CorrelationKey> {
        if let Some(id) = callback.path_payment_id() {
            return Some(CorrelationKey::PaymentId(id));
        }
        let parsed = callback.json().ok()?;
        json_string(&parsed, "/Body/stkCallback/CheckoutRequestID")
            .map(CorrelationKey::ChannelPaymentId)
    }

    fn normalize_callback(&self, callback: &CallbackPayload) -> PaymentResult<ChannelResult> {
        self.verify_callback_token(callback)?;
        let parsed = callback.json()?;

        if let Some(stk) = parsed.pointer("/Body/stkCallback") {
            let code = json_string(stk, "/ResultCode");
            let (status, native) = Self::resolve_callback_status(code.as_deref(), None);
            let receipt = Self::metadata_item(stk, "MpesaReceiptNumber");
            let channel_payment_id = if status == PaymentStatus::Success {
                receipt.or_else(|| json_string(stk, "/CheckoutRequestID"))
            } else {
                json_string(stk, "/CheckoutRequestID")
            };
            let amount = Self::metadata_item(stk, "Amount");
            let mut result = ChannelResult::new(status, native.clone())
                .with_code(native)
                .with_channel_payment_id(channel_payment_id)
                .with_settlement(Self::amount(amount.as_deref()), Some("KES".to_string()))
                .require_settlement();
            result.result_message = json_string(stk, "/ResultDesc");
            return Ok(result.with_payload(parsed));
        }

        // Only reversals are given a result URL, so a `Result` reports a refund.
        if let Some(outcome) = parsed.get("Result") {
            let code = json_string(outcome, "/ResultCode");
            let (status, native) = Self::resolve_callback_status(
                code.as_deref(),
                json_string(outcome, "/TransactionID").as_deref(),
            );
            let mut result = ChannelResult::new(status, native.clone())
                .with_code(native)
                .with_kind(ResultKind::Refund);
            result.result_message = json_string(outcome, "/ResultDesc");
            return Ok(result.with_payload(parsed));
        }

        // C2B confirmation: carries TransID but no status field.
        let transaction_id = json_string(&parsed, "/TransID");
        let code = json_string(&parsed, "/ResultCode");
        let (status, native) =
            Self::resolve_callback_status(code.as_deref(), transaction_id.as_deref());
        let amount = json_string(&parsed, "/TransAmount");
        let mut result = ChannelResult::new(status, native)
            .with_settlement(Self::amount(amount.as_deref()), Some("KES".to_string()))
            .require_settlement();
        if result.status == PaymentStatus::Success {
            result.channel_payment_id = transaction_id;
        }
        Ok(result.with_payload(parsed))
    }

    fn acknowledgment(&self, outcome: AckOutcome) -> JsonValue {
        match outcome {
            AckOutcome::Accepted => serde_json::json!({ "ResultCode": 0, "ResultDesc": "Accepted" }),
            AckOutcome::NotFound => {
                serde_json::json!({ "ResultCode": 1, "ResultDesc": "Rejected: payment not found" })
            }
            AckOutcome::Rejected => {
                serde_json::json!({ "ResultCode": 1, "ResultDesc": "Rejected" })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct MpesaTokenResponse {
    access_token: String,
    /// Daraja sends this as a string.
    #[serde(default)]
    expires_in: Option<String>,
}
