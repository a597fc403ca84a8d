use crate::payments::error::PaymentError;
use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Result codes written by the orchestration layer itself. Provider codes are
/// stored verbatim next to these.
pub mod result_codes {
    pub const REQUEST_FAILED: &str = "request_failed";
    pub const REQUEST_EXPIRED: &str = "request_expired";
    pub const CHANNEL_UNAVAILABLE: &str = "channel_unavailable";
    pub const CANCELLED_BY_USER: &str = "cancelled_by_user";
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const SANDBOX_SUCCESS: &str = "sandbox_success";
    pub const CASH_SUCCESS: &str = "cash_collected";
    pub const REFUND_UNSUPPORTED: &str = "refund_unsupported";
    pub const AMOUNT_MISMATCH: &str = "amount_mismatch";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelCode {
    Flutterwave,
    Paystack,
    Mpesa,
    Cash,
    Sandbox,
}

impl ChannelCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelCode::Flutterwave => "flutterwave",
            ChannelCode::Paystack => "paystack",
            ChannelCode::Mpesa => "mpesa",
            ChannelCode::Cash => "cash",
            ChannelCode::Sandbox => "sandbox",
        }
    }

    /// Internal channels never leave the process and have no adapter.
    pub fn is_internal(&self) -> bool {
        matches!(self, ChannelCode::Cash | ChannelCode::Sandbox)
    }
}

impl std::fmt::Display for ChannelCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChannelCode {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "flutterwave" => Ok(ChannelCode::Flutterwave),
            "paystack" => Ok(ChannelCode::Paystack),
            "mpesa" | "m-pesa" => Ok(ChannelCode::Mpesa),
            "cash" => Ok(ChannelCode::Cash),
            "sandbox" => Ok(ChannelCode::Sandbox),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported channel: {}", value),
                field: Some("channel".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    BankTransfer,
    MobileMoney,
    Ussd,
    Cash,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::MobileMoney => "mobile_money",
            PaymentMethod::Ussd => "ussd",
            PaymentMethod::Cash => "cash",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "card" => Ok(PaymentMethod::Card),
            "bank_transfer" | "banktransfer" => Ok(PaymentMethod::BankTransfer),
            "mobile_money" | "mobilemoney" => Ok(PaymentMethod::MobileMoney),
            "ussd" => Ok(PaymentMethod::Ussd),
            "cash" => Ok(PaymentMethod::Cash),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported payment method: {}", value),
                field: Some("payment_method".to_string()),
            }),
        }
    }
}

/// Canonical payment status. Every provider vocabulary is folded into this.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Terminal records are never moved by callbacks or polls.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// States that block a fresh charge attempt for the same order.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Pending | PaymentStatus::Success | PaymentStatus::Refunded
        )
    }

    pub fn active_states() -> &'static [PaymentStatus] {
        &[
            PaymentStatus::Pending,
            PaymentStatus::Success,
            PaymentStatus::Refunded,
        ]
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "success" => Ok(PaymentStatus::Success),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            "refunded" => Ok(PaymentStatus::Refunded),
            _ => Err(PaymentError::ValidationError {
                message: format!("unknown payment status: {}", value),
                field: Some("status".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayerContact {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub name: Option<String>,
}

/// One row per attempted charge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub order_id: String,
    pub user_id: String,
    pub payment_method: PaymentMethod,
    pub currency: String,
    pub amount: BigDecimal,
    pub status: PaymentStatus,
    pub channel_code: Option<ChannelCode>,
    pub channel_account_id: Option<String>,
    pub channel_payment_id: Option<String>,
    pub channel_status: Option<String>,
    pub result_code: Option<String>,
    pub result_message: Option<String>,
    pub redirect_url: Option<String>,
    pub client_token: Option<String>,
    pub payer: PayerContact,
    pub channel_payload: Option<JsonValue>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct NewPayment<'a> {
    pub order_id: &'a str,
    pub user_id: &'a str,
    pub payment_method: PaymentMethod,
    pub currency: &'a str,
    pub amount: &'a BigDecimal,
    pub payer: PayerContact,
}

impl PaymentRecord {
    pub fn new_pending(new: NewPayment<'_>, now: DateTime<Utc>, pending_ttl: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: new.order_id.to_string(),
            user_id: new.user_id.to_string(),
            payment_method: new.payment_method,
            currency: new.currency.trim().to_uppercase(),
            amount: new.amount.clone(),
            status: PaymentStatus::Pending,
            channel_code: None,
            channel_account_id: None,
            channel_payment_id: None,
            channel_status: None,
            result_code: None,
            result_message: None,
            redirect_url: None,
            client_token: None,
            payer: new.payer,
            channel_payload: None,
            expires_at: now + pending_ttl,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A pending attempt whose expiry has passed may be replaced by a new one.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Pending && self.expires_at <= now
    }

    pub fn is_internal_channel(&self) -> bool {
        self.payment_method == PaymentMethod::Cash
            || self.channel_code.map(|c| c.is_internal()).unwrap_or(false)
    }

    /// Reason shown to the buyer for an unsuccessful attempt. Provider codes
    /// stay in the ledger; clients get a small stable vocabulary.
    pub fn client_reason(&self) -> Option<String> {
        let reason = match self.status {
            PaymentStatus::Failed => match self.result_code.as_deref() {
                Some(result_codes::REQUEST_EXPIRED) => "expired",
                Some(result_codes::CHANNEL_UNAVAILABLE) => "no_payment_service_available",
                Some(result_codes::REQUEST_FAILED) => "payment_service_error",
                Some(result_codes::AMOUNT_MISMATCH) => "amount_mismatch",
                _ => "declined",
            },
            PaymentStatus::Cancelled => "cancelled",
            _ => return None,
        };
        Some(reason.to_string())
    }

    /// Rebuild the canonical result from what the ledger holds.
    pub fn to_channel_result(&self) -> ChannelResult {
        ChannelResult {
            status: self.status,
            channel_status: self
                .channel_status
                .clone()
                .unwrap_or_else(|| self.status.as_str().to_string()),
            result_code: self.result_code.clone(),
            result_message: self.result_message.clone(),
            channel_payment_id: self.channel_payment_id.clone(),
            redirect_url: self.redirect_url.clone(),
            client_token: self.client_token.clone(),
            raw_payload: None,
            kind: ResultKind::Charge,
            settled_amount: None,
            settled_currency: None,
        }
    }
}

/// Which operation a channel update reports on.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    #[default]
    Charge,
    Refund,
}

/// Provider-agnostic outcome of any adapter call or callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelResult {
    pub status: PaymentStatus,
    pub channel_status: String,
    pub result_code: Option<String>,
    pub result_message: Option<String>,
    pub channel_payment_id: Option<String>,
    pub redirect_url: Option<String>,
    pub client_token: Option<String>,
    pub raw_payload: Option<JsonValue>,
    #[serde(default)]
    pub kind: ResultKind,
    /// What the channel reports as collected, in major units.
    #[serde(default)]
    pub settled_amount: Option<BigDecimal>,
    #[serde(default)]
    pub settled_currency: Option<String>,
}

impl ChannelResult {
    pub fn new(status: PaymentStatus, channel_status: impl Into<String>) -> Self {
        Self {
            status,
            channel_status: channel_status.into(),
            result_code: None,
            result_message: None,
            channel_payment_id: None,
            redirect_url: None,
            client_token: None,
            raw_payload: None,
            kind: ResultKind::Charge,
            settled_amount: None,
            settled_currency: None,
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            result_code: Some(code.clone()),
            result_message: Some(message.into()),
            ..Self::new(PaymentStatus::Failed, code)
        }
    }

    /// Transport or parse failure talking to a provider.
    pub fn request_failed(message: impl Into<String>) -> Self {
        Self::failed(result_codes::REQUEST_FAILED, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.result_code = Some(code.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.result_message = Some(message.into());
        self
    }

    pub fn with_channel_payment_id(mut self, id: Option<String>) -> Self {
        if id.is_some() {
            self.channel_payment_id = id;
        }
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.raw_payload = Some(payload);
        self
    }

    pub fn with_kind(mut self, kind: ResultKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_settlement(mut self, amount: Option<BigDecimal>, currency: Option<String>) -> Self {
        self.settled_amount = amount;
        self.settled_currency = currency.map(|c| c.trim().to_uppercase());
        self
    }

    /// A success that does not say how much was collected, and in which
    /// currency, is held as pending until a status query confirms it.
    pub fn require_settlement(mut self) -> Self {
        if self.status == PaymentStatus::Success
            && (self.settled_amount.is_none() || self.settled_currency.is_none())
        {
            self.status = PaymentStatus::Pending;
        }
        self
    }

    /// Whether the reported settlement pays for `record`. Fields the channel
    /// did not report are not held against it.
    pub fn settlement_covers(&self, record: &PaymentRecord) -> bool {
        let amount_ok = self
            .settled_amount
            .as_ref()
            .map(|amount| amount >= &record.amount)
            .unwrap_or(true);
        let currency_ok = self
            .settled_currency
            .as_deref()
            .map(|currency| currency.eq_ignore_ascii_case(&record.currency))
            .unwrap_or(true);
        amount_ok && currency_ok
    }

    /// Fold an adapter-layer error into a result. Declines keep the provider's
    /// code; transport and parse failures become `request_failed`.
    pub fn from_error(err: &PaymentError) -> Self {
        match err {
            PaymentError::PaymentDeclinedError {
                message,
                provider_code,
            } => Self::failed(
                provider_code.clone().unwrap_or_else(|| "declined".to_string()),
                message.clone(),
            ),
            PaymentError::InsufficientFundsError { message } => {
                Self::failed("insufficient_funds", message.clone())
            }
            PaymentError::ValidationError { message, .. } => {
                Self::failed(result_codes::INVALID_REQUEST, message.clone())
            }
            PaymentError::ProviderError {
                message,
                provider_code: Some(code),
                retryable: false,
                ..
            } => Self::failed(code.clone(), message.clone()),
            other => Self::request_failed(other.to_string()),
        }
    }
}

/// Raw webhook delivery as received on the wire.
#[derive(Debug, Clone, Default)]
pub struct CallbackPayload {
    /// Correlation segment taken from the webhook path, if any.
    pub path_key: Option<String>,
    /// Header names are lower-cased.
    pub headers: HashMap<String, String>,
    /// Query parameters of the webhook URL.
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl CallbackPayload {
    pub fn new(path_key: Option<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            path_key,
            headers: HashMap::new(),
            query: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|v| v.as_str())
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|v| v.as_str())
    }

    pub fn path_payment_id(&self) -> Option<Uuid> {
        self.path_key
            .as_deref()
            .and_then(|k| Uuid::parse_str(k.trim()).ok())
    }

    pub fn json(&self) -> Result<JsonValue, PaymentError> {
        serde_json::from_slice(&self.body).map_err(|e| PaymentError::WebhookVerificationError {
            message: format!("invalid webhook JSON payload: {}", e),
        })
    }
}

/// How a callback points back at a payment record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationKey {
    PaymentId(Uuid),
    ChannelPaymentId(String),
}

/// What the webhook handler tells the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Accepted,
    NotFound,
    Rejected,
}

/// Routing rule mapping (method, currency, region, amount range) to an account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelRoute {
    pub router_id: String,
    pub channel_code: ChannelCode,
    pub channel_account_id: String,
    /// Exact method name or `*`.
    pub payment_method: String,
    pub currency: String,
    /// Exact region code or `*`.
    pub region: String,
    pub min_amount: BigDecimal,
    pub max_amount: Option<BigDecimal>,
    pub priority: i32,
    pub position: i32,
}

pub const WILDCARD: &str = "*";

impl ChannelRoute {
    pub fn is_method_wildcard(&self) -> bool {
        self.payment_method.trim() == WILDCARD
    }

    pub fn matches_method(&self, method: PaymentMethod) -> bool {
        self.is_method_wildcard()
            || PaymentMethod::from_str(&self.payment_method)
                .map(|m| m == method)
                .unwrap_or(false)
    }

    pub fn matches_region(&self, region: &str) -> bool {
        let pattern = self.region.trim();
        pattern == WILDCARD || pattern.eq_ignore_ascii_case(region.trim())
    }

    pub fn covers_amount(&self, currency: &str, amount: &BigDecimal) -> bool {
        if !self.currency.trim().eq_ignore_ascii_case(currency.trim()) {
            return false;
        }
        if amount <= &BigDecimal::zero() || amount < &self.min_amount {
            return false;
        }
        match &self.max_amount {
            Some(max) => amount <= max,
            None => true,
        }
    }
}

/// Configured provider account; the registry builds one adapter per enabled row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelAccount {
    pub account_id: String,
    pub channel_code: ChannelCode,
    pub is_enabled: bool,
    pub settings: JsonValue,
    pub updated_at: DateTime<Utc>,
}
