//! Payment Orchestrator Service
//!
//! Owns the payment lifecycle: validates a charge against the order, keeps at
//! most one active attempt per order, routes to a channel, persists what the
//! channel answered and applies later channel updates monotonically.

use crate::config::PaymentConfig;
use crate::database::error::DatabaseError;
use crate::database::order_repository::{OrderGateway, OrderSnapshot, OrderStatus};
use crate::database::payment_repository::{
    InsertOutcome, PaymentLedger, RecordPatch, TransitionOutcome,
};
use crate::error::{
    AppError, AppErrorKind, DomainError, ExternalError, InfrastructureError, ValidationError,
};
use crate::payments::provider::ChannelAdapter;
use crate::payments::registry::ChannelRegistry;
use crate::payments::router::{Router, RoutingError};
use crate::payments::types::{
    result_codes, ChannelCode, ChannelResult, NewPayment, PayerContact, PaymentMethod,
    PaymentRecord, PaymentStatus, ResultKind,
};
use crate::services::checkout::CheckoutService;
use crate::workers::background::{BackgroundTask, TaskQueue};
use bigdecimal::{BigDecimal, Zero};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Lifetime of a pending attempt before a new charge may replace it
    pub pending_ttl: chrono::Duration,
    /// Settle every charge through the sandbox channel
    pub sandbox_mode: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pending_ttl: chrono::Duration::minutes(30),
            sandbox_mode: false,
        }
    }
}

impl From<&PaymentConfig> for OrchestratorConfig {
    fn from(config: &PaymentConfig) -> Self {
        Self {
            pending_ttl: chrono::Duration::seconds(config.pending_ttl_secs as i64),
            sandbox_mode: config.sandbox_mode,
        }
    }
}

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub order_id: String,
    pub user_id: String,
    pub payment_method: PaymentMethod,
    pub payer: PayerContact,
}

#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub payment: PaymentRecord,
    pub result: ChannelResult,
    pub checkout_id: Option<String>,
    /// An already active attempt was returned instead of charging again
    pub replayed: bool,
}

impl ChargeOutcome {
    fn replay(payment: PaymentRecord) -> Self {
        Self {
            result: payment.to_channel_result(),
            payment,
            checkout_id: None,
            replayed: true,
        }
    }

    fn settled(payment: PaymentRecord, checkout_id: Option<String>) -> Self {
        Self {
            result: payment.to_channel_result(),
            payment,
            checkout_id,
            replayed: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub payment: PaymentRecord,
    pub result: ChannelResult,
}

/// What applying a channel update did to the record.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Record moved to a terminal state, or from `Success` to `Refunded`
    Settled(PaymentRecord),
    /// Still pending; channel fields refreshed
    Refreshed(PaymentRecord),
    /// Record was already terminal; nothing written
    Ignored(PaymentRecord),
}

impl ApplyOutcome {
    pub fn record(&self) -> &PaymentRecord {
        match self {
            ApplyOutcome::Settled(r) | ApplyOutcome::Refreshed(r) | ApplyOutcome::Ignored(r) => r,
        }
    }

    pub fn into_record(self) -> PaymentRecord {
        match self {
            ApplyOutcome::Settled(r) | ApplyOutcome::Refreshed(r) | ApplyOutcome::Ignored(r) => r,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("order {order_id} not found")]
    OrderNotFound { order_id: String },

    #[error("order {order_id} is {status}, not awaiting payment")]
    OrderNotChargeable { order_id: String, status: OrderStatus },

    #[error("payment {payment_id} not found")]
    PaymentNotFound { payment_id: Uuid },

    #[error("no channel available for {payment_method} in {currency}")]
    NoChannelAvailable {
        payment_id: Uuid,
        payment_method: PaymentMethod,
        currency: String,
    },

    #[error("payment {payment_id} is {status} and cannot be {action}")]
    InvalidState {
        payment_id: Uuid,
        status: PaymentStatus,
        action: &'static str,
    },

    #[error("channel account {account_id} is not registered")]
    ChannelNotRegistered { account_id: String },

    #[error("ledger error: {0}")]
    Ledger(#[from] DatabaseError),
}

impl OrchestratorError {
    fn validation(field: &str, message: impl Into<String>) -> Self {
        OrchestratorError::Validation {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        let kind = match err {
            OrchestratorError::Validation { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.unwrap_or_else(|| "request".to_string()),
                    reason: message,
                })
            }
            OrchestratorError::OrderNotFound { order_id } => {
                AppErrorKind::Domain(DomainError::OrderNotFound { order_id })
            }
            OrchestratorError::OrderNotChargeable { order_id, status } => {
                AppErrorKind::Domain(DomainError::OrderNotPayable {
                    order_id,
                    status: status.to_string(),
                })
            }
            OrchestratorError::PaymentNotFound { payment_id } => {
                AppErrorKind::Domain(DomainError::PaymentNotFound {
                    payment_id: payment_id.to_string(),
                })
            }
            OrchestratorError::NoChannelAvailable {
                payment_method,
                currency,
                ..
            } => AppErrorKind::External(ExternalError::NoChannelAvailable {
                payment_method: payment_method.to_string(),
                currency,
            }),
            OrchestratorError::InvalidState {
                payment_id,
                status,
                action,
            } => AppErrorKind::Domain(DomainError::InvalidPaymentState {
                payment_id: payment_id.to_string(),
                status: status.to_string(),
                action: action.to_string(),
            }),
            OrchestratorError::ChannelNotRegistered { account_id } => {
                AppErrorKind::Infrastructure(InfrastructureError::Configuration {
                    message: format!("channel account {} is not registered", account_id),
                })
            }
            OrchestratorError::Ledger(e) => return e.into(),
        };
        AppError::new(kind)
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

// ============================================================================
// Main Payment Orchestrator
// ============================================================================

pub struct PaymentOrchestrator {
    ledger: Arc<dyn PaymentLedger>,
    orders: Arc<dyn OrderGateway>,
    registry: Arc<ChannelRegistry>,
    router: Router,
    checkout: Arc<CheckoutService>,
    tasks: TaskQueue,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        orders: Arc<dyn OrderGateway>,
        registry: Arc<ChannelRegistry>,
        checkout: Arc<CheckoutService>,
        tasks: TaskQueue,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            router: Router::new(registry.clone()),
            ledger,
            orders,
            registry,
            checkout,
            tasks,
            config,
        }
    }

    // =========================================================================
    // Charge
    // =========================================================================

    /// Charge an order. Repeated calls while an attempt is live return that
    /// attempt instead of charging twice.
    pub async fn charge(&self, request: ChargeRequest) -> OrchestratorResult<ChargeOutcome> {
        let order = self.validate_charge(&request).await?;
        let now = Utc::now();

        if let Some(active) = self.ledger.find_active(&order.order_id).await? {
            if active.is_stale(now) {
                // The channel may have collected while its webhook was lost.
                let current = self.sync_status(active.id).await?;
                if current.status == PaymentStatus::Success {
                    info!(
                        payment_id = %current.id,
                        order_id = %current.order_id,
                        "stale payment attempt had settled, returning it"
                    );
                    return Ok(ChargeOutcome::replay(current));
                }
                if current.status == PaymentStatus::Pending {
                    self.ledger.expire(active.id, now).await?;
                }
                info!(
                    payment_id = %active.id,
                    order_id = %active.order_id,
                    expired_at = %active.expires_at,
                    "stale payment attempt recycled"
                );
            } else {
                info!(
                    payment_id = %active.id,
                    order_id = %active.order_id,
                    status = %active.status,
                    "returning active payment attempt"
                );
                return Ok(ChargeOutcome::replay(active));
            }
        }

        let record = PaymentRecord::new_pending(
            NewPayment {
                order_id: &order.order_id,
                user_id: &request.user_id,
                payment_method: request.payment_method,
                currency: &order.currency,
                amount: &order.amount,
                payer: request.payer.clone(),
            },
            now,
            self.config.pending_ttl,
        );

        let record = match self.ledger.insert_pending(record).await? {
            InsertOutcome::Created(record) => record,
            InsertOutcome::Existing(existing) => {
                info!(
                    payment_id = %existing.id,
                    order_id = %existing.order_id,
                    "concurrent charge won, returning its attempt"
                );
                return Ok(ChargeOutcome::replay(existing));
            }
        };

        info!(
            payment_id = %record.id,
            order_id = %record.order_id,
            method = %record.payment_method,
            amount = %record.amount,
            currency = %record.currency,
            "payment attempt created"
        );

        let outcome = if self.config.sandbox_mode || order.is_test {
            self.settle_internally(record, ChannelCode::Sandbox, result_codes::SANDBOX_SUCCESS)
                .await?
        } else if request.payment_method == PaymentMethod::Cash {
            self.settle_internally(record, ChannelCode::Cash, result_codes::CASH_SUCCESS)
                .await?
        } else {
            self.charge_through_channel(record, &order).await?
        };

        self.tasks.submit(BackgroundTask::RecheckOrderPayment {
            order_id: outcome.payment.order_id.clone(),
            payment_id: outcome.payment.id,
        });

        Ok(outcome)
    }

    async fn validate_charge(&self, request: &ChargeRequest) -> OrchestratorResult<OrderSnapshot> {
        if request.order_id.trim().is_empty() {
            return Err(OrchestratorError::validation("order_id", "order_id is required"));
        }
        if request.user_id.trim().is_empty() {
            return Err(OrchestratorError::validation("user_id", "caller is required"));
        }

        let order = self
            .orders
            .fetch_order(&request.order_id)
            .await?
            .filter(|order| order.user_id == request.user_id)
            .ok_or_else(|| OrchestratorError::OrderNotFound {
                order_id: request.order_id.clone(),
            })?;

        if order.status != OrderStatus::AwaitingPayment {
            return Err(OrchestratorError::OrderNotChargeable {
                order_id: order.order_id,
                status: order.status,
            });
        }
        if order.amount <= BigDecimal::zero() {
            return Err(OrchestratorError::validation(
                "amount",
                format!("order amount must be positive, got {}", order.amount),
            ));
        }
        if order.currency.trim().is_empty() {
            return Err(OrchestratorError::validation("currency", "order has no currency"));
        }
        Ok(order)
    }

    /// Sandbox and cash attempts never leave the process.
    async fn settle_internally(
        &self,
        record: PaymentRecord,
        channel: ChannelCode,
        code: &str,
    ) -> OrchestratorResult<ChargeOutcome> {
        let now = Utc::now();
        let result = ChannelResult::new(PaymentStatus::Success, "success").with_code(code);
        let patch = RecordPatch::from_result(&result, now).with_route(channel, channel.as_str());

        let stored = self.store_result(record.id, &patch).await?;
        info!(
            payment_id = %stored.id,
            order_id = %stored.order_id,
            channel = %channel,
            "payment settled internally"
        );
        self.after_settlement(&stored);
        Ok(ChargeOutcome::settled(stored, None))
    }

    async fn charge_through_channel(
        &self,
        record: PaymentRecord,
        order: &OrderSnapshot,
    ) -> OrchestratorResult<ChargeOutcome> {
        let selection = match self.router.select_route(
            record.payment_method,
            &record.currency,
            &order.region,
            &record.amount,
        ) {
            Ok(selection) => selection,
            Err(RoutingError::NotFound { .. }) => {
                let patch = RecordPatch::status(PaymentStatus::Failed, Utc::now()).with_result(
                    result_codes::CHANNEL_UNAVAILABLE,
                    "no payment service available",
                );
                self.ledger.record_result(record.id, &patch).await?;
                return Err(OrchestratorError::NoChannelAvailable {
                    payment_id: record.id,
                    payment_method: record.payment_method,
                    currency: record.currency,
                });
            }
        };

        let channel = selection.route.channel_code;
        let account_id = selection.route.channel_account_id.clone();

        // The route is stored before the provider is called so a callback
        // racing the response can already be matched to its channel.
        let assign = RecordPatch::status(PaymentStatus::Pending, Utc::now())
            .with_route(channel, &account_id);
        let record = match self.ledger.record_result(record.id, &assign).await? {
            TransitionOutcome::Applied(record) => record,
            TransitionOutcome::Unchanged(current) => {
                return Ok(ChargeOutcome::settled(current, None));
            }
            TransitionOutcome::Missing => {
                return Err(OrchestratorError::PaymentNotFound {
                    payment_id: record.id,
                });
            }
        };

        let result = call_pay(selection.adapter, record.clone()).await;
        let result = guard_settlement(&record, result);
        if result.status == PaymentStatus::Failed
            && result.result_code.as_deref() == Some(result_codes::REQUEST_FAILED)
        {
            warn!(
                payment_id = %record.id,
                channel = %channel,
                account_id = %account_id,
                message = result.result_message.as_deref().unwrap_or(""),
                "channel request failed"
            );
        }

        let now = Utc::now();
        let patch = RecordPatch::from_result(&result, now).with_expiry(now + self.config.pending_ttl);
        let stored = self.store_result(record.id, &patch).await?;

        info!(
            payment_id = %stored.id,
            order_id = %stored.order_id,
            channel = %channel,
            account_id = %account_id,
            status = %stored.status,
            channel_payment_id = stored.channel_payment_id.as_deref().unwrap_or(""),
            "channel charge completed"
        );

        if stored.status.is_terminal() {
            self.after_settlement(&stored);
        }

        let checkout_id = if stored.status == PaymentStatus::Pending {
            self.checkout.issue(&stored).await
        } else {
            None
        };

        Ok(ChargeOutcome::settled(stored, checkout_id))
    }

    /// Write a result onto a pending record. If something else settled it
    /// first, the stored state wins.
    async fn store_result(&self, id: Uuid, patch: &RecordPatch) -> OrchestratorResult<PaymentRecord> {
        match self.ledger.record_result(id, patch).await? {
            TransitionOutcome::Applied(record) => Ok(record),
            TransitionOutcome::Unchanged(current) => {
                info!(
                    payment_id = %id,
                    status = %current.status,
                    "payment changed before the channel response was stored"
                );
                Ok(current)
            }
            TransitionOutcome::Missing => Err(OrchestratorError::PaymentNotFound { payment_id: id }),
        }
    }

    // =========================================================================
    // Channel updates (callbacks and polls)
    // =========================================================================

    /// Apply a channel's view of a payment. Terminal records never change;
    /// pending results only refresh channel fields. Refund reports are the
    /// one way out of `Success`.
    pub async fn apply_channel_result(
        &self,
        record: &PaymentRecord,
        result: ChannelResult,
        source: &'static str,
    ) -> OrchestratorResult<ApplyOutcome> {
        if result.kind == ResultKind::Refund {
            return self.apply_refund_result(record, result, source).await;
        }

        if record.status.is_terminal() {
            info!(
                payment_id = %record.id,
                status = %record.status,
                incoming = %result.status,
                source = source,
                "ignoring channel update for settled payment"
            );
            return Ok(ApplyOutcome::Ignored(record.clone()));
        }

        let result = guard_settlement(record, result);
        let patch = RecordPatch::from_result(&result, Utc::now());
        match self
            .ledger
            .transition(record.id, &[PaymentStatus::Pending], &patch)
            .await?
        {
            TransitionOutcome::Applied(updated) if updated.status.is_terminal() => {
                info!(
                    payment_id = %updated.id,
                    order_id = %updated.order_id,
                    status = %updated.status,
                    channel_status = %result.channel_status,
                    source = source,
                    "payment settled"
                );
                self.after_settlement(&updated);
                Ok(ApplyOutcome::Settled(updated))
            }
            TransitionOutcome::Applied(updated) => Ok(ApplyOutcome::Refreshed(updated)),
            TransitionOutcome::Unchanged(current) => {
                info!(
                    payment_id = %current.id,
                    status = %current.status,
                    source = source,
                    "payment settled concurrently, channel update ignored"
                );
                Ok(ApplyOutcome::Ignored(current))
            }
            TransitionOutcome::Missing => Err(OrchestratorError::PaymentNotFound {
                payment_id: record.id,
            }),
        }
    }

    /// Poll the owning channel for a pending payment and apply the answer.
    /// An expired attempt is only failed once the channel has not reported
    /// it settled.
    pub async fn sync_status(&self, payment_id: Uuid) -> OrchestratorResult<PaymentRecord> {
        let record = self.require(payment_id).await?;
        if record.status.is_terminal() || record.is_internal_channel() {
            return Ok(record);
        }

        let stale = record.is_stale(Utc::now());
        if let Some(result) = self.query_channel(&record).await {
            if !stale || result.status.is_terminal() {
                return Ok(self
                    .apply_channel_result(&record, result, "status_poll")
                    .await?
                    .into_record());
            }
        }

        if stale {
            let expired = self.ledger.expire(record.id, Utc::now()).await?;
            info!(payment_id = %record.id, "pending payment expired on status poll");
            return Ok(expired.record().cloned().unwrap_or(record));
        }
        Ok(record)
    }

    async fn query_channel(&self, record: &PaymentRecord) -> Option<ChannelResult> {
        let account_id = record.channel_account_id.as_deref()?;
        let Some(adapter) = self.registry.adapter(account_id) else {
            warn!(
                payment_id = %record.id,
                account_id = %account_id,
                "channel account no longer registered, cannot poll"
            );
            return None;
        };

        match adapter.query_status(record).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(
                    payment_id = %record.id,
                    account_id = %account_id,
                    error = %e,
                    "channel status query failed"
                );
                None
            }
        }
    }

    /// A channel's report on a refund it accepted earlier.
    async fn apply_refund_result(
        &self,
        record: &PaymentRecord,
        result: ChannelResult,
        source: &'static str,
    ) -> OrchestratorResult<ApplyOutcome> {
        if record.status != PaymentStatus::Success || result.status != PaymentStatus::Success {
            info!(
                payment_id = %record.id,
                status = %record.status,
                refund_status = %result.status,
                channel_status = %result.channel_status,
                source = source,
                "refund update not applied"
            );
            return Ok(ApplyOutcome::Ignored(record.clone()));
        }

        match self.record_refund(record.id, &result).await? {
            TransitionOutcome::Applied(refunded) => Ok(ApplyOutcome::Settled(refunded)),
            TransitionOutcome::Unchanged(current) => Ok(ApplyOutcome::Ignored(current)),
            TransitionOutcome::Missing => Err(OrchestratorError::PaymentNotFound {
                payment_id: record.id,
            }),
        }
    }

    async fn record_refund(
        &self,
        payment_id: Uuid,
        result: &ChannelResult,
    ) -> OrchestratorResult<TransitionOutcome> {
        let outcome = self.ledger.mark_refunded(payment_id, result, Utc::now()).await?;
        if let TransitionOutcome::Applied(refunded) = &outcome {
            info!(payment_id = %payment_id, order_id = %refunded.order_id, "payment refunded");
            self.tasks.submit(BackgroundTask::Notify {
                payment: Box::new(refunded.clone()),
            });
        }
        Ok(outcome)
    }

    // =========================================================================
    // Cancel / refund / read
    // =========================================================================

    /// Buyer cancels their own pending, channel-routed attempt.
    pub async fn cancel(&self, payment_id: Uuid, user_id: &str) -> OrchestratorResult<PaymentRecord> {
        let record = self.require(payment_id).await?;
        if record.user_id != user_id {
            return Err(OrchestratorError::PaymentNotFound { payment_id });
        }
        if record.status != PaymentStatus::Pending || record.is_internal_channel() {
            return Err(OrchestratorError::InvalidState {
                payment_id,
                status: record.status,
                action: "cancelled",
            });
        }

        match self.ledger.mark_cancelled(payment_id, Utc::now()).await? {
            TransitionOutcome::Applied(cancelled) => {
                info!(payment_id = %payment_id, order_id = %cancelled.order_id, "payment cancelled");
                self.tasks.submit(BackgroundTask::Notify {
                    payment: Box::new(cancelled.clone()),
                });
                Ok(cancelled)
            }
            TransitionOutcome::Unchanged(current) => Err(OrchestratorError::InvalidState {
                payment_id,
                status: current.status,
                action: "cancelled",
            }),
            TransitionOutcome::Missing => Err(OrchestratorError::PaymentNotFound { payment_id }),
        }
    }

    /// Refund a settled payment. Only a successful channel refund moves the
    /// record to `Refunded`; a refund the channel accepted for processing is
    /// finished by its later refund callback.
    pub async fn refund(&self, payment_id: Uuid) -> OrchestratorResult<RefundOutcome> {
        let record = self.require(payment_id).await?;
        if record.status != PaymentStatus::Success {
            return Err(OrchestratorError::InvalidState {
                payment_id,
                status: record.status,
                action: "refunded",
            });
        }

        let result = if record.is_internal_channel() {
            ChannelResult::new(PaymentStatus::Success, "refunded")
        } else {
            let account_id = record.channel_account_id.clone().unwrap_or_default();
            let adapter = self
                .registry
                .adapter(&account_id)
                .ok_or(OrchestratorError::ChannelNotRegistered { account_id })?;
            adapter.refund(&record).await
        };

        match result.status {
            PaymentStatus::Success => {}
            PaymentStatus::Pending => {
                info!(
                    payment_id = %payment_id,
                    channel_status = %result.channel_status,
                    "refund accepted by channel, awaiting confirmation"
                );
                return Ok(RefundOutcome {
                    payment: record,
                    result,
                });
            }
            _ => {
                warn!(
                    payment_id = %payment_id,
                    status = %result.status,
                    result_code = result.result_code.as_deref().unwrap_or(""),
                    "refund not completed by channel"
                );
                return Ok(RefundOutcome {
                    payment: record,
                    result,
                });
            }
        }

        match self.record_refund(payment_id, &result).await? {
            TransitionOutcome::Applied(refunded) => Ok(RefundOutcome {
                payment: refunded,
                result,
            }),
            TransitionOutcome::Unchanged(current) => Err(OrchestratorError::InvalidState {
                payment_id,
                status: current.status,
                action: "refunded",
            }),
            TransitionOutcome::Missing => Err(OrchestratorError::PaymentNotFound { payment_id }),
        }
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> OrchestratorResult<PaymentRecord> {
        self.require(payment_id).await
    }

    async fn require(&self, payment_id: Uuid) -> OrchestratorResult<PaymentRecord> {
        self.ledger
            .find_by_id(payment_id)
            .await?
            .ok_or(OrchestratorError::PaymentNotFound { payment_id })
    }

    fn after_settlement(&self, record: &PaymentRecord) {
        self.tasks.submit(BackgroundTask::RecheckOrderPayment {
            order_id: record.order_id.clone(),
            payment_id: record.id,
        });
        self.tasks.submit(BackgroundTask::Notify {
            payment: Box::new(record.clone()),
        });
    }
}

/// A success for less than the record's amount, or in another currency,
/// fails the attempt instead of settling it.
fn guard_settlement(record: &PaymentRecord, result: ChannelResult) -> ChannelResult {
    if result.status != PaymentStatus::Success || result.settlement_covers(record) {
        return result;
    }
    warn!(
        payment_id = %record.id,
        amount = %record.amount,
        currency = %record.currency,
        settled_amount = ?result.settled_amount,
        settled_currency = ?result.settled_currency,
        "settled amount does not cover the payment"
    );
    let mut failed = ChannelResult::failed(
        result_codes::AMOUNT_MISMATCH,
        "settled amount does not cover the payment",
    )
    .with_channel_payment_id(result.channel_payment_id);
    failed.raw_payload = result.raw_payload;
    failed
}

/// `pay` runs on its own task so an adapter panic surfaces as a failed
/// result instead of unwinding the request.
async fn call_pay(adapter: Arc<dyn ChannelAdapter>, record: PaymentRecord) -> ChannelResult {
    let payment_id = record.id;
    let account_id = adapter.account_id().to_string();
    match tokio::spawn(async move { adapter.pay(&record).await }).await {
        Ok(result) => result,
        Err(e) => {
            error!(
                payment_id = %payment_id,
                account_id = %account_id,
                error = %e,
                "channel adapter aborted"
            );
            ChannelResult::request_failed("channel adapter aborted")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::{InMemoryOrderGateway, InMemoryPaymentLedger, InMemoryRouteSource};
    use crate::payments::factory::ChannelAdapterFactory;
    use crate::services::checkout::InMemoryTicketStore;
    use std::time::Duration;

    struct Harness {
        orchestrator: PaymentOrchestrator,
        ledger: Arc<InMemoryPaymentLedger>,
        orders: Arc<InMemoryOrderGateway>,
    }

    fn harness(config: OrchestratorConfig) -> Harness {
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
        let (tasks, _rx) = TaskQueue::channel(64);
        let orchestrator = PaymentOrchestrator::new(
            ledger.clone(),
            orders.clone(),
            registry,
            checkout,
            tasks,
            config,
        );
        Harness {
            orchestrator,
            ledger,
            orders,
        }
    }

    fn order(id: &str, amount: i64, is_test: bool) -> OrderSnapshot {
        OrderSnapshot {
            order_id: id.to_string(),
            user_id: "buyer".to_string(),
            amount: BigDecimal::from(amount),
            currency: "NGN".to_string(),
            region: "NG".to_string(),
            status: OrderStatus::AwaitingPayment,
            is_test,
        }
    }

    fn charge(order_id: &str, method: PaymentMethod) -> ChargeRequest {
        ChargeRequest {
            order_id: order_id.to_string(),
            user_id: "buyer".to_string(),
            payment_method: method,
            payer: PayerContact {
                phone: Some("+2348000000000".to_string()),
                ..PayerContact::default()
            },
        }
    }

    #[tokio::test]
    async fn validation_failures_never_touch_the_ledger() {
        let h = harness(OrchestratorConfig::default());
        h.orders.insert(order("zero", 0, false));
        let mut paid = order("paid", 100, false);
        paid.status = OrderStatus::Paid;
        h.orders.insert(paid);

        assert!(matches!(
            h.orchestrator.charge(charge("zero", PaymentMethod::Card)).await,
            Err(OrchestratorError::Validation { .. })
        ));
        assert!(matches!(
            h.orchestrator.charge(charge("paid", PaymentMethod::Card)).await,
            Err(OrchestratorError::OrderNotChargeable { .. })
        ));
        assert!(matches!(
            h.orchestrator.charge(charge("missing", PaymentMethod::Card)).await,
            Err(OrchestratorError::OrderNotFound { .. })
        ));

        let mut foreign = charge("paid", PaymentMethod::Card);
        foreign.user_id = "intruder".to_string();
        assert!(matches!(
            h.orchestrator.charge(foreign).await,
            Err(OrchestratorError::OrderNotFound { .. })
        ));

        assert!(h.ledger.all_for_order("zero").is_empty());
        assert!(h.ledger.all_for_order("paid").is_empty());
    }

    #[tokio::test]
    async fn test_orders_settle_through_sandbox() {
        let h = harness(OrchestratorConfig::default());
        h.orders.insert(order("T1", 2500, true));

        let outcome = h
            .orchestrator
            .charge(charge("T1", PaymentMethod::Card))
            .await
            .unwrap();
        assert_eq!(outcome.payment.status, PaymentStatus::Success);
        assert_eq!(outcome.payment.channel_code, Some(ChannelCode::Sandbox));
        assert_eq!(
            outcome.result.result_code.as_deref(),
            Some(result_codes::SANDBOX_SUCCESS)
        );
        assert!(outcome.payment.completed_at.is_some());
        assert!(outcome.checkout_id.is_none());

        let again = h
            .orchestrator
            .charge(charge("T1", PaymentMethod::Card))
            .await
            .unwrap();
        assert!(again.replayed);
        assert_eq!(again.payment.id, outcome.payment.id);
    }

    #[tokio::test]
    async fn cash_settles_and_cannot_be_cancelled() {
        let h = harness(OrchestratorConfig::default());
        h.orders.insert(order("C1", 800, false));

        let outcome = h
            .orchestrator
            .charge(charge("C1", PaymentMethod::Cash))
            .await
            .unwrap();
        assert_eq!(outcome.payment.channel_code, Some(ChannelCode::Cash));
        assert_eq!(outcome.payment.status, PaymentStatus::Success);

        assert!(matches!(
            h.orchestrator.cancel(outcome.payment.id, "buyer").await,
            Err(OrchestratorError::InvalidState { .. })
        ));

        let refunded = h.orchestrator.refund(outcome.payment.id).await.unwrap();
        assert_eq!(refunded.payment.status, PaymentStatus::Refunded);
        assert_eq!(refunded.payment.completed_at, outcome.payment.completed_at);
    }

    #[tokio::test]
    async fn no_route_marks_attempt_failed() {
        let h = harness(OrchestratorConfig::default());
        h.orders.insert(order("O9", 5000, false));

        let err = h
            .orchestrator
            .charge(charge("O9", PaymentMethod::MobileMoney))
            .await
            .unwrap_err();
        let payment_id = match err {
            OrchestratorError::NoChannelAvailable { payment_id, .. } => payment_id,
            other => panic!("expected no channel, got {:?}", other),
        };

        let stored = h.ledger.find_by_id(payment_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert_eq!(
            stored.result_code.as_deref(),
            Some(result_codes::CHANNEL_UNAVAILABLE)
        );
        // A failed attempt does not block the next one.
        assert!(h.ledger.find_active("O9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_result_keeps_expiry_and_terminal_is_final() {
        let h = harness(OrchestratorConfig::default());
        let amount = BigDecimal::from(100);
        let record = PaymentRecord::new_pending(
            NewPayment {
                order_id: "O1",
                user_id: "buyer",
                payment_method: PaymentMethod::Card,
                currency: "NGN",
                amount: &amount,
                payer: PayerContact::default(),
            },
            Utc::now(),
            chrono::Duration::minutes(30),
        );
        h.ledger.put(record.clone());

        let refreshed = h
            .orchestrator
            .apply_channel_result(
                &record,
                ChannelResult::new(PaymentStatus::Pending, "processing")
                    .with_channel_payment_id(Some("ch_1".to_string())),
                "test",
            )
            .await
            .unwrap();
        let refreshed = match refreshed {
            ApplyOutcome::Refreshed(r) => r,
            other => panic!("expected refresh, got {:?}", other),
        };
        assert_eq!(refreshed.expires_at, record.expires_at);
        assert_eq!(refreshed.channel_payment_id.as_deref(), Some("ch_1"));

        let settled = h
            .orchestrator
            .apply_channel_result(
                &refreshed,
                ChannelResult::new(PaymentStatus::Success, "successful"),
                "test",
            )
            .await
            .unwrap();
        assert!(matches!(settled, ApplyOutcome::Settled(_)));

        let late = h
            .orchestrator
            .apply_channel_result(
                settled.record(),
                ChannelResult::new(PaymentStatus::Failed, "failed"),
                "test",
            )
            .await
            .unwrap();
        assert!(matches!(late, ApplyOutcome::Ignored(_)));
        let stored = h.ledger.find_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Success);
    }

    #[tokio::test]
    async fn cancel_is_owner_only() {
        let h = harness(OrchestratorConfig::default());
        let amount = BigDecimal::from(100);
        let mut record = PaymentRecord::new_pending(
            NewPayment {
                order_id: "O1",
                user_id: "buyer",
                payment_method: PaymentMethod::Card,
                currency: "NGN",
                amount: &amount,
                payer: PayerContact::default(),
            },
            Utc::now(),
            chrono::Duration::minutes(30),
        );
        record.channel_code = Some(ChannelCode::Paystack);
        h.ledger.put(record.clone());

        assert!(matches!(
            h.orchestrator.cancel(record.id, "someone").await,
            Err(OrchestratorError::PaymentNotFound { .. })
        ));
        let cancelled = h.orchestrator.cancel(record.id, "buyer").await.unwrap();
        assert_eq!(cancelled.status, PaymentStatus::Cancelled);
        assert_eq!(
            cancelled.result_code.as_deref(),
            Some(result_codes::CANCELLED_BY_USER)
        );
    }

    fn pending_record(h: &Harness, amount: i64) -> PaymentRecord {
        let amount = BigDecimal::from(amount);
        let mut record = PaymentRecord::new_pending(
            NewPayment {
                order_id: "O1",
                user_id: "buyer",
                payment_method: PaymentMethod::MobileMoney,
                currency: "RWF",
                amount: &amount,
                payer: PayerContact::default(),
            },
            Utc::now(),
            chrono::Duration::minutes(30),
        );
        record.channel_code = Some(ChannelCode::Flutterwave);
        h.ledger.put(record.clone());
        record
    }

    #[tokio::test]
    async fn underpaid_success_fails_with_amount_mismatch() {
        let h = harness(OrchestratorConfig::default());
        let record = pending_record(&h, 5000);

        let outcome = h
            .orchestrator
            .apply_channel_result(
                &record,
                ChannelResult::new(PaymentStatus::Success, "successful")
                    .with_channel_payment_id(Some("TX9".to_string()))
                    .with_settlement(Some(BigDecimal::from(1)), Some("KES".to_string())),
                "webhook",
            )
            .await
            .unwrap();
        let stored = match outcome {
            ApplyOutcome::Settled(stored) => stored,
            other => panic!("expected settlement, got {:?}", other),
        };
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert_eq!(
            stored.result_code.as_deref(),
            Some(result_codes::AMOUNT_MISMATCH)
        );
        assert_eq!(stored.channel_payment_id.as_deref(), Some("TX9"));
    }

    #[tokio::test]
    async fn refund_report_moves_only_successful_payments() {
        let h = harness(OrchestratorConfig::default());
        let record = pending_record(&h, 5000);
        let refund = ChannelResult::new(PaymentStatus::Success, "refund.processed")
            .with_kind(ResultKind::Refund);

        let early = h
            .orchestrator
            .apply_channel_result(&record, refund.clone(), "webhook")
            .await
            .unwrap();
        assert!(matches!(early, ApplyOutcome::Ignored(_)));

        let settled = h
            .orchestrator
            .apply_channel_result(
                &record,
                ChannelResult::new(PaymentStatus::Success, "successful")
                    .with_channel_payment_id(Some("TX1".to_string())),
                "webhook",
            )
            .await
            .unwrap()
            .into_record();

        let failed_refund = ChannelResult::new(PaymentStatus::Failed, "refund.failed")
            .with_kind(ResultKind::Refund);
        let ignored = h
            .orchestrator
            .apply_channel_result(&settled, failed_refund, "webhook")
            .await
            .unwrap();
        assert_eq!(ignored.record().status, PaymentStatus::Success);

        let refunded = h
            .orchestrator
            .apply_channel_result(&settled, refund.clone(), "webhook")
            .await
            .unwrap();
        let refunded = match refunded {
            ApplyOutcome::Settled(r) => r,
            other => panic!("expected refund, got {:?}", other),
        };
        assert_eq!(refunded.status, PaymentStatus::Refunded);
        assert_eq!(refunded.channel_payment_id.as_deref(), Some("TX1"));
        assert_eq!(refunded.completed_at, settled.completed_at);

        let duplicate = h
            .orchestrator
            .apply_channel_result(&refunded, refund, "webhook")
            .await
            .unwrap();
        assert!(matches!(duplicate, ApplyOutcome::Ignored(_)));
    }

    #[tokio::test]
    async fn cash_needs_no_payer_contact() {
        let h = harness(OrchestratorConfig::default());
        h.orders.insert(order("C2", 300, false));
        let mut request = charge("C2", PaymentMethod::Cash);
        request.payer = PayerContact::default();

        let outcome = h.orchestrator.charge(request).await.unwrap();
        assert_eq!(outcome.payment.status, PaymentStatus::Success);
    }
}
