//! Shared fixtures: a scripted channel adapter and a fully wired in-memory app.

#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use marketpay_backend::database::memory::{
    InMemoryOrderGateway, InMemoryPaymentLedger, InMemoryRouteSource,
};
use marketpay_backend::database::order_repository::{OrderSnapshot, OrderStatus};
use marketpay_backend::payments::error::{PaymentError, PaymentResult};
use marketpay_backend::payments::factory::AdapterBuilder;
use marketpay_backend::payments::provider::ChannelAdapter;
use marketpay_backend::payments::registry::ChannelRegistry;
use marketpay_backend::payments::types::{
    CallbackPayload, ChannelAccount, ChannelCode, ChannelResult, ChannelRoute, CorrelationKey,
    PayerContact, PaymentMethod, PaymentRecord, PaymentStatus, ResultKind,
};
use marketpay_backend::services::checkout::{CheckoutService, InMemoryTicketStore};
use marketpay_backend::services::payment_orchestrator::{
    ChargeRequest, OrchestratorConfig, PaymentOrchestrator,
};
use marketpay_backend::services::webhook_processor::WebhookProcessor;
use marketpay_backend::workers::{BackgroundTask, TaskQueue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const SIGNATURE_HEADER: &str = "x-test-signature";
pub const GOOD_SIGNATURE: &str = "valid";

/// Adapter whose answers are set by the test. Callbacks look like
/// `{"reference": "...", "status": "...", "amount": "...", "currency": "..."}`
/// and must carry a good signature. `refunded` and `refund_failed` report on
/// a refund rather than the charge.
pub struct ScriptedAdapter {
    code: ChannelCode,
    account_id: String,
    pay_result: Mutex<ChannelResult>,
    refund_result: Mutex<ChannelResult>,
    query_result: Mutex<Option<ChannelResult>>,
    pay_delay: Duration,
    pay_calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(code: ChannelCode, account_id: &str) -> Self {
        Self {
            code,
            account_id: account_id.to_string(),
            pay_result: Mutex::new(ChannelResult::new(PaymentStatus::Pending, "initiated")),
            refund_result: Mutex::new(ChannelResult::new(PaymentStatus::Success, "refunded")),
            query_result: Mutex::new(None),
            pay_delay: Duration::ZERO,
            pay_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_pay_delay(mut self, delay: Duration) -> Self {
        self.pay_delay = delay;
        self
    }

    pub fn answer_pay(&self, result: ChannelResult) {
        *self.pay_result.lock().unwrap() = result;
    }

    pub fn answer_refund(&self, result: ChannelResult) {
        *self.refund_result.lock().unwrap() = result;
    }

    pub fn answer_query(&self, result: ChannelResult) {
        *self.query_result.lock().unwrap() = Some(result);
    }

    pub fn pay_calls(&self) -> usize {
        self.pay_calls.load(Ordering::SeqCst)
    }
}

fn map_status(native: &str) -> (ResultKind, PaymentStatus) {
    match native {
        "successful" => (ResultKind::Charge, PaymentStatus::Success),
        "failed" => (ResultKind::Charge, PaymentStatus::Failed),
        "refunded" => (ResultKind::Refund, PaymentStatus::Success),
        "refund_failed" => (ResultKind::Refund, PaymentStatus::Failed),
        _ => (ResultKind::Charge, PaymentStatus::Pending),
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedAdapter {
    fn channel_code(&self) -> ChannelCode {
        self.code
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn supported_methods(&self) -> &'static [PaymentMethod] {
        &[
            PaymentMethod::Card,
            PaymentMethod::MobileMoney,
            PaymentMethod::BankTransfer,
        ]
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["RWF", "NGN", "KES"]
    }

    async fn pay(&self, _record: &PaymentRecord) -> ChannelResult {
        self.pay_calls.fetch_add(1, Ordering::SeqCst);
        if !self.pay_delay.is_zero() {
            tokio::time::sleep(self.pay_delay).await;
        }
        self.pay_result.lock().unwrap().clone()
    }

    async fn refund(&self, _record: &PaymentRecord) -> ChannelResult {
        self.refund_result.lock().unwrap().clone()
    }

    async fn query_status(&self, _record: &PaymentRecord) -> PaymentResult<ChannelResult> {
        self.query_result
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PaymentError::NetworkError {
                message: "status endpoint unreachable".to_string(),
            })
    }

    fn extract_correlation_key(&self, callback: &CallbackPayload) -> Option<CorrelationKey> {
        if let Some(id) = callback.path_payment_id() {
            return Some(CorrelationKey::PaymentId(id));
        }
        let body = callback.json().ok()?;
        body["reference"]
            .as_str()
            .map(|r| CorrelationKey::ChannelPaymentId(r.to_string()))
    }

    fn normalize_callback(&self, callback: &CallbackPayload) -> PaymentResult<ChannelResult> {
        if callback.header(SIGNATURE_HEADER) != Some(GOOD_SIGNATURE) {
            return Err(PaymentError::WebhookVerificationError {
                message: "signature mismatch".to_string(),
            });
        }
        let body = callback.json()?;
        let native = body["status"].as_str().unwrap_or_default().to_string();
        let (kind, status) = map_status(&native);
        let amount = body["amount"]
            .as_str()
            .and_then(|a| a.parse::<BigDecimal>().ok());
        let currency = body["currency"].as_str().map(str::to_string);
        Ok(ChannelResult::new(status, native)
            .with_kind(kind)
            .with_channel_payment_id(body["reference"].as_str().map(str::to_string))
            .with_settlement(amount, currency))
    }
}

struct ScriptedBuilder {
    adapters: HashMap<String, Arc<ScriptedAdapter>>,
}

impl AdapterBuilder for ScriptedBuilder {
    fn build(&self, account: &ChannelAccount) -> PaymentResult<Arc<dyn ChannelAdapter>> {
        self.adapters
            .get(&account.account_id)
            .map(|a| a.clone() as Arc<dyn ChannelAdapter>)
            .ok_or_else(|| PaymentError::ConfigurationError {
                account_id: account.account_id.clone(),
                message: "no scripted adapter".to_string(),
            })
    }
}

pub const PRIMARY_ACCOUNT: &str = "fw-rw";
pub const SECONDARY_ACCOUNT: &str = "ps-rw";

pub struct TestApp {
    pub ledger: Arc<InMemoryPaymentLedger>,
    pub orders: Arc<InMemoryOrderGateway>,
    pub registry: Arc<ChannelRegistry>,
    pub checkout: Arc<CheckoutService>,
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub webhooks: Arc<WebhookProcessor>,
    /// Routed Flutterwave account
    pub primary: Arc<ScriptedAdapter>,
    /// Paystack account with no routes
    pub secondary: Arc<ScriptedAdapter>,
    pub tasks: mpsc::Receiver<BackgroundTask>,
}

fn account(id: &str, code: ChannelCode) -> ChannelAccount {
    ChannelAccount {
        account_id: id.to_string(),
        channel_code: code,
        is_enabled: true,
        settings: serde_json::json!({}),
        updated_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc),
    }
}

/// Any method, RWF or KES, any region.
fn routes() -> Vec<ChannelRoute> {
    ["RWF", "KES"]
        .iter()
        .enumerate()
        .map(|(i, currency)| ChannelRoute {
            router_id: format!("route-{}", currency.to_lowercase()),
            channel_code: ChannelCode::Flutterwave,
            channel_account_id: PRIMARY_ACCOUNT.to_string(),
            payment_method: "*".to_string(),
            currency: currency.to_string(),
            region: "*".to_string(),
            min_amount: BigDecimal::from(1),
            max_amount: None,
            priority: 10,
            position: i as i32,
        })
        .collect()
}

pub async fn test_app(primary: ScriptedAdapter, config: OrchestratorConfig) -> TestApp {
    let primary = Arc::new(primary);
    let secondary = Arc::new(ScriptedAdapter::new(ChannelCode::Paystack, SECONDARY_ACCOUNT));

    let mut adapters = HashMap::new();
    adapters.insert(PRIMARY_ACCOUNT.to_string(), primary.clone());
    adapters.insert(SECONDARY_ACCOUNT.to_string(), secondary.clone());

    let source = Arc::new(InMemoryRouteSource::new(
        routes(),
        vec![
            account(PRIMARY_ACCOUNT, ChannelCode::Flutterwave),
            account(SECONDARY_ACCOUNT, ChannelCode::Paystack),
        ],
    ));
    let registry = Arc::new(ChannelRegistry::new(
        source,
        Arc::new(ScriptedBuilder { adapters }),
    ));
    registry.refresh().await.unwrap();

    let ledger = Arc::new(InMemoryPaymentLedger::new());
    let orders = Arc::new(InMemoryOrderGateway::new());
    let checkout = Arc::new(CheckoutService::new(
        Arc::new(InMemoryTicketStore::new()),
        orders.clone(),
        ledger.clone(),
        Duration::from_secs(900),
    ));
    let (queue, tasks) = TaskQueue::channel(1024);
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        ledger.clone(),
        orders.clone(),
        registry.clone(),
        checkout.clone(),
        queue,
        config,
    ));
    let webhooks = Arc::new(WebhookProcessor::new(
        registry.clone(),
        ledger.clone(),
        orchestrator.clone(),
    ));

    TestApp {
        ledger,
        orders,
        registry,
        checkout,
        orchestrator,
        webhooks,
        primary,
        secondary,
        tasks,
    }
}

pub fn rwf_order(order_id: &str, amount: i64) -> OrderSnapshot {
    OrderSnapshot {
        order_id: order_id.to_string(),
        user_id: "buyer-1".to_string(),
        amount: BigDecimal::from(amount),
        currency: "RWF".to_string(),
        region: "RW".to_string(),
        status: OrderStatus::AwaitingPayment,
        is_test: false,
    }
}

pub fn mobile_money_charge(order_id: &str) -> ChargeRequest {
    ChargeRequest {
        order_id: order_id.to_string(),
        user_id: "buyer-1".to_string(),
        payment_method: PaymentMethod::MobileMoney,
        payer: PayerContact {
            phone: Some("+250788000000".to_string()),
            ..PayerContact::default()
        },
    }
}

pub fn signed_callback(path_key: Option<String>, body: serde_json::Value) -> CallbackPayload {
    CallbackPayload::new(path_key, serde_json::to_vec(&body).unwrap())
        .with_header(SIGNATURE_HEADER, GOOD_SIGNATURE)
}
