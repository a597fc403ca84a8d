use crate::database::error::DatabaseError;
use crate::payments::types::{
    result_codes, ChannelCode, ChannelResult, PayerContact, PaymentMethod, PaymentRecord,
    PaymentStatus,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// Result of `insert_pending`.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(PaymentRecord),
    /// Another attempt for the same order is already active; nothing was inserted.
    Existing(PaymentRecord),
}

/// Result of a conditional status transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(PaymentRecord),
    /// The record was not in an expected state; carries the current row.
    Unchanged(PaymentRecord),
    Missing,
}

impl TransitionOutcome {
    pub fn record(&self) -> Option<&PaymentRecord> {
        match self {
            TransitionOutcome::Applied(r) | TransitionOutcome::Unchanged(r) => Some(r),
            TransitionOutcome::Missing => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

/// Field changes written together with a status transition. `None` keeps the
/// stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPatch {
    pub status: PaymentStatus,
    pub channel_code: Option<ChannelCode>,
    pub channel_account_id: Option<String>,
    pub channel_payment_id: Option<String>,
    pub channel_status: Option<String>,
    pub result_code: Option<String>,
    pub result_message: Option<String>,
    pub redirect_url: Option<String>,
    pub client_token: Option<String>,
    pub channel_payload: Option<JsonValue>,
    pub expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RecordPatch {
    pub fn status(status: PaymentStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            channel_code: None,
            channel_account_id: None,
            channel_payment_id: None,
            channel_status: None,
            result_code: None,
            result_message: None,
            redirect_url: None,
            client_token: None,
            channel_payload: None,
            expires_at: None,
            completed_at: status.is_terminal().then_some(now),
            updated_at: now,
        }
    }

    pub fn from_result(result: &ChannelResult, now: DateTime<Utc>) -> Self {
        Self {
            channel_payment_id: result.channel_payment_id.clone(),
            channel_status: Some(result.channel_status.clone()).filter(|s| !s.is_empty()),
            result_code: result.result_code.clone(),
            result_message: result.result_message.clone(),
            redirect_url: result.redirect_url.clone(),
            client_token: result.client_token.clone(),
            channel_payload: result.raw_payload.clone(),
            ..Self::status(result.status, now)
        }
    }

    pub fn with_route(mut self, channel_code: ChannelCode, account_id: &str) -> Self {
        self.channel_code = Some(channel_code);
        self.channel_account_id = Some(account_id.to_string());
        self
    }

    pub fn with_result(mut self, code: &str, message: &str) -> Self {
        self.result_code = Some(code.to_string());
        self.result_message = Some(message.to_string());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn apply_to(&self, record: &mut PaymentRecord) {
        record.status = self.status;
        if self.channel_code.is_some() {
            record.channel_code = self.channel_code;
        }
        macro_rules! keep_or_set {
            ($($field:ident),*) => {
                $(if let Some(v) = &self.$field {
                    record.$field = Some(v.clone());
                })*
            };
        }
        keep_or_set!(
            channel_account_id,
            channel_payment_id,
            channel_status,
            result_code,
            result_message,
            redirect_url,
            client_token,
            channel_payload,
            completed_at
        );
        if let Some(expires_at) = self.expires_at {
            record.expires_at = expires_at;
        }
        record.updated_at = self.updated_at;
    }
}

/// Authoritative store of payment attempts.
///
/// Implementations must serialise `insert_pending` per order so two concurrent
/// callers cannot both create an active attempt, and `transition` must only
/// write when the stored status is one of `expected`.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRecord>, DatabaseError>;

    async fn find_by_channel_payment_id(
        &self,
        channel: ChannelCode,
        channel_payment_id: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError>;

    /// The single `Pending`, `Success` or `Refunded` attempt for an order.
    async fn find_active(&self, order_id: &str) -> Result<Option<PaymentRecord>, DatabaseError>;

    async fn insert_pending(&self, record: PaymentRecord) -> Result<InsertOutcome, DatabaseError>;

    async fn transition(
        &self,
        id: Uuid,
        expected: &[PaymentStatus],
        patch: &RecordPatch,
    ) -> Result<TransitionOutcome, DatabaseError>;

    /// Retire a stale pending attempt so the order can be charged again.
    async fn expire(&self, id: Uuid, now: DateTime<Utc>) -> Result<TransitionOutcome, DatabaseError> {
        let patch = RecordPatch::status(PaymentStatus::Failed, now)
            .with_result(result_codes::REQUEST_EXPIRED, "payment request expired");
        self.transition(id, &[PaymentStatus::Pending], &patch).await
    }

    /// Persist an adapter result on a still-pending record.
    async fn record_result(
        &self,
        id: Uuid,
        patch: &RecordPatch,
    ) -> Result<TransitionOutcome, DatabaseError> {
        self.transition(id, &[PaymentStatus::Pending], patch).await
    }

    async fn mark_cancelled(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let patch = RecordPatch::status(PaymentStatus::Cancelled, now)
            .with_result(result_codes::CANCELLED_BY_USER, "cancelled by customer");
        self.transition(id, &[PaymentStatus::Pending], &patch).await
    }

    async fn mark_refunded(
        &self,
        id: Uuid,
        result: &ChannelResult,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let mut patch = RecordPatch::from_result(result, now);
        patch.status = PaymentStatus::Refunded;
        // Keep the original settlement time and the customer-facing receipt id.
        patch.completed_at = None;
        patch.channel_payment_id = None;
        self.transition(id, &[PaymentStatus::Success], &patch).await
    }
}

#[derive(Debug, Clone, FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: String,
    user_id: String,
    payment_method: String,
    currency: String,
    amount: BigDecimal,
    status: String,
    channel_code: Option<String>,
    channel_account_id: Option<String>,
    channel_payment_id: Option<String>,
    channel_status: Option<String>,
    result_code: Option<String>,
    result_message: Option<String>,
    redirect_url: Option<String>,
    client_token: Option<String>,
    payer_email: Option<String>,
    payer_phone: Option<String>,
    payer_name: Option<String>,
    channel_payload: Option<JsonValue>,
    expires_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = DatabaseError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let decode = |e: crate::payments::error::PaymentError| DatabaseError::decode(e.to_string());
        Ok(PaymentRecord {
            id: row.id,
            order_id: row.order_id,
            user_id: row.user_id,
            payment_method: PaymentMethod::from_str(&row.payment_method).map_err(decode)?,
            currency: row.currency,
            amount: row.amount,
            status: PaymentStatus::from_str(&row.status).map_err(decode)?,
            channel_code: row
                .channel_code
                .as_deref()
                .map(ChannelCode::from_str)
                .transpose()
                .map_err(decode)?,
            channel_account_id: row.channel_account_id,
            channel_payment_id: row.channel_payment_id,
            channel_status: row.channel_status,
            result_code: row.result_code,
            result_message: row.result_message,
            redirect_url: row.redirect_url,
            client_token: row.client_token,
            payer: PayerContact {
                email: row.payer_email,
                phone: row.payer_phone,
                name: row.payer_name,
            },
            channel_payload: row.channel_payload,
            expires_at: row.expires_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const PAYMENT_COLUMNS: &str = "id, order_id, user_id, payment_method, currency, amount, status, \
     channel_code, channel_account_id, channel_payment_id, channel_status, result_code, \
     result_message, redirect_url, client_token, payer_email, payer_phone, payer_name, \
     channel_payload, expires_at, completed_at, created_at, updated_at";

fn status_names(states: &[PaymentStatus]) -> Vec<String> {
    states.iter().map(|s| s.as_str().to_string()).collect()
}

/// Postgres-backed ledger over the `payments` table.
pub struct PgPaymentLedger {
    pool: PgPool,
}

impl PgPaymentLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_active_in<'e, E>(
        executor: E,
        order_id: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments
             WHERE order_id = $1 AND status = ANY($2)
             ORDER BY created_at DESC
             LIMIT 1",
            PAYMENT_COLUMNS
        ))
        .bind(order_id)
        .bind(status_names(PaymentStatus::active_states()))
        .fetch_optional(executor)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        row.map(PaymentRecord::try_from).transpose()
    }
}

#[async_trait]
impl PaymentLedger for PgPaymentLedger {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRecord>, DatabaseError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        row.map(PaymentRecord::try_from).transpose()
    }

    async fn find_by_channel_payment_id(
        &self,
        channel: ChannelCode,
        channel_payment_id: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments
             WHERE channel_code = $1 AND channel_payment_id = $2
             ORDER BY created_at DESC
             LIMIT 1",
            PAYMENT_COLUMNS
        ))
        .bind(channel.as_str())
        .bind(channel_payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        row.map(PaymentRecord::try_from).transpose()
    }

    async fn find_active(&self, order_id: &str) -> Result<Option<PaymentRecord>, DatabaseError> {
        Self::fetch_active_in(&self.pool, order_id).await
    }

    async fn insert_pending(&self, record: PaymentRecord) -> Result<InsertOutcome, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        // Serialises concurrent charges for one order until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&record.order_id)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        if let Some(existing) = Self::fetch_active_in(&mut *tx, &record.order_id).await? {
            tx.commit().await.map_err(DatabaseError::from_sqlx)?;
            debug!(
                order_id = %record.order_id,
                payment_id = %existing.id,
                "active payment already exists for order"
            );
            return Ok(InsertOutcome::Existing(existing));
        }

        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "INSERT INTO payments (
                id, order_id, user_id, payment_method, currency, amount, status,
                payer_email, payer_phone, payer_name, expires_at, created_at, updated_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             RETURNING {}",
            PAYMENT_COLUMNS
        ))
        .bind(record.id)
        .bind(&record.order_id)
        .bind(&record.user_id)
        .bind(record.payment_method.as_str())
        .bind(&record.currency)
        .bind(&record.amount)
        .bind(record.status.as_str())
        .bind(&record.payer.email)
        .bind(&record.payer.phone)
        .bind(&record.payer.name)
        .bind(record.expires_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        info!(order_id = %record.order_id, payment_id = %record.id, "payment attempt created");
        Ok(InsertOutcome::Created(row.try_into()?))
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: &[PaymentStatus],
        patch: &RecordPatch,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let updated = sqlx::query_as::<_, PaymentRow>(&format!(
            "UPDATE payments SET
                status = $3,
                channel_code = COALESCE($4, channel_code),
                channel_account_id = COALESCE($5, channel_account_id),
                channel_payment_id = COALESCE($6, channel_payment_id),
                channel_status = COALESCE($7, channel_status),
                result_code = COALESCE($8, result_code),
                result_message = COALESCE($9, result_message),
                redirect_url = COALESCE($10, redirect_url),
                client_token = COALESCE($11, client_token),
                channel_payload = COALESCE($12, channel_payload),
                expires_at = COALESCE($13, expires_at),
                completed_at = COALESCE($14, completed_at),
                updated_at = $15
             WHERE id = $1 AND status = ANY($2)
             RETURNING {}",
            PAYMENT_COLUMNS
        ))
        .bind(id)
        .bind(status_names(expected))
        .bind(patch.status.as_str())
        .bind(patch.channel_code.map(|c| c.as_str()))
        .bind(&patch.channel_account_id)
        .bind(&patch.channel_payment_id)
        .bind(&patch.channel_status)
        .bind(&patch.result_code)
        .bind(&patch.result_message)
        .bind(&patch.redirect_url)
        .bind(&patch.client_token)
        .bind(&patch.channel_payload)
        .bind(patch.expires_at)
        .bind(patch.completed_at)
        .bind(patch.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        match updated {
            Some(row) => Ok(TransitionOutcome::Applied(row.try_into()?)),
            None => match self.find_by_id(id).await? {
                Some(current) => Ok(TransitionOutcome::Unchanged(current)),
                None => Ok(TransitionOutcome::Missing),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::NewPayment;

    fn pending() -> PaymentRecord {
        let amount = BigDecimal::from(5000);
        PaymentRecord::new_pending(
            NewPayment {
                order_id: "O1",
                user_id: "u1",
                payment_method: PaymentMethod::MobileMoney,
                currency: "RWF",
                amount: &amount,
                payer: PayerContact::default(),
            },
            Utc::now(),
            chrono::Duration::minutes(30),
        )
    }

    #[test]
    fn patch_from_terminal_result_sets_completion() {
        let now = Utc::now();
        let result = ChannelResult::new(PaymentStatus::Success, "successful")
            .with_channel_payment_id(Some("TX123".to_string()));
        let patch = RecordPatch::from_result(&result, now);
        assert_eq!(patch.completed_at, Some(now));

        let mut record = pending();
        record.redirect_url = Some("https://checkout".to_string());
        patch.apply_to(&mut record);
        assert_eq!(record.status, PaymentStatus::Success);
        assert_eq!(record.channel_payment_id.as_deref(), Some("TX123"));
        // Absent fields keep what was stored.
        assert_eq!(record.redirect_url.as_deref(), Some("https://checkout"));
    }

    #[test]
    fn pending_patch_does_not_complete() {
        let patch = RecordPatch::from_result(
            &ChannelResult::new(PaymentStatus::Pending, "pending"),
            Utc::now(),
        );
        assert_eq!(patch.completed_at, None);
        assert_eq!(patch.expires_at, None);
    }

    #[test]
    fn row_with_unknown_status_fails_to_decode() {
        let record = pending();
        let row = PaymentRow {
            id: record.id,
            order_id: record.order_id.clone(),
            user_id: record.user_id.clone(),
            payment_method: "mobile_money".to_string(),
            currency: "RWF".to_string(),
            amount: record.amount.clone(),
            status: "settled".to_string(),
            channel_code: None,
            channel_account_id: None,
            channel_payment_id: None,
            channel_status: None,
            result_code: None,
            result_message: None,
            redirect_url: None,
            client_token: None,
            payer_email: None,
            payer_phone: None,
            payer_name: None,
            channel_payload: None,
            expires_at: record.expires_at,
            completed_at: None,
            created_at: record.created_at,
            updated_at: record.updated_at,
        };
        assert!(PaymentRecord::try_from(row.clone()).is_err());

        let ok = PaymentRecord::try_from(PaymentRow {
            status: "pending".to_string(),
            channel_code: Some("flutterwave".to_string()),
            ..row
        })
        .expect("row decodes");
        assert_eq!(ok.channel_code, Some(ChannelCode::Flutterwave));
    }
}
