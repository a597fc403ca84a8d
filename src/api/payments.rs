//! Buyer-facing payment endpoints.

use crate::error::{AppError, AppErrorKind, DomainError, ValidationError};
use crate::middleware::error::get_request_id_from_headers;
use crate::payments::types::{ChannelCode, PayerContact, PaymentMethod, PaymentRecord, PaymentStatus};
use crate::services::payment_orchestrator::{ChargeRequest, PaymentOrchestrator};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Header carrying the authenticated buyer, set by the gateway in front of us.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct PaymentsState {
    pub orchestrator: Arc<PaymentOrchestrator>,
}

#[derive(Debug, Deserialize)]
pub struct ChargeBody {
    pub order_id: String,
    pub payment_method: String,
    #[serde(default)]
    pub payer: PayerContact,
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub payment_id: Uuid,
    pub order_id: String,
    pub status: PaymentStatus,
    pub channel_code: Option<ChannelCode>,
    pub redirect_url: Option<String>,
    pub client_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PaymentResponse {
    fn from_record(record: &PaymentRecord, checkout_id: Option<String>) -> Self {
        Self {
            payment_id: record.id,
            order_id: record.order_id.clone(),
            status: record.status,
            channel_code: record.channel_code,
            redirect_url: record.redirect_url.clone(),
            client_token: record.client_token.clone(),
            checkout_id,
            reason: record.client_reason(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub payment_id: Uuid,
    pub status: PaymentStatus,
    pub refund_status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_code: Option<String>,
}

fn caller_id(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            with_request(
                AppError::new(AppErrorKind::Domain(DomainError::Unauthenticated)),
                headers,
            )
        })
}

fn with_request(error: AppError, headers: &HeaderMap) -> AppError {
    match get_request_id_from_headers(headers) {
        Some(request_id) => error.with_request_id(request_id),
        None => error,
    }
}

/// POST /api/payments/charge
pub async fn charge(
    State(state): State<PaymentsState>,
    headers: HeaderMap,
    Json(body): Json<ChargeBody>,
) -> Result<Json<PaymentResponse>, AppError> {
    let user_id = caller_id(&headers)?;
    let payment_method = PaymentMethod::from_str(&body.payment_method).map_err(|_| {
        with_request(
            AppError::new(AppErrorKind::Validation(ValidationError::UnsupportedPaymentMethod {
                method: body.payment_method.clone(),
            })),
            &headers,
        )
    })?;

    info!(order_id = %body.order_id, method = %payment_method, "charge requested");

    let outcome = state
        .orchestrator
        .charge(ChargeRequest {
            order_id: body.order_id,
            user_id,
            payment_method,
            payer: body.payer,
        })
        .await
        .map_err(|e| with_request(e.into(), &headers))?;

    Ok(Json(PaymentResponse::from_record(
        &outcome.payment,
        outcome.checkout_id,
    )))
}

/// GET /api/payments/{payment_id}
pub async fn get_payment(
    State(state): State<PaymentsState>,
    headers: HeaderMap,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<PaymentResponse>, AppError> {
    let user_id = caller_id(&headers)?;
    let record = state
        .orchestrator
        .get_payment(payment_id)
        .await
        .map_err(|e| with_request(e.into(), &headers))?;
    if record.user_id != user_id {
        return Err(with_request(
            AppError::new(AppErrorKind::Domain(DomainError::PaymentNotFound {
                payment_id: payment_id.to_string(),
            })),
            &headers,
        ));
    }

    let record = if record.status == PaymentStatus::Pending {
        state
            .orchestrator
            .sync_status(payment_id)
            .await
            .map_err(|e| with_request(e.into(), &headers))?
    } else {
        record
    };

    Ok(Json(PaymentResponse::from_record(&record, None)))
}

/// POST /api/payments/{payment_id}/cancel
pub async fn cancel_payment(
    State(state): State<PaymentsState>,
    headers: HeaderMap,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<PaymentResponse>, AppError> {
    let user_id = caller_id(&headers)?;
    let record = state
        .orchestrator
        .cancel(payment_id, &user_id)
        .await
        .map_err(|e| with_request(e.into(), &headers))?;
    Ok(Json(PaymentResponse::from_record(&record, None)))
}

/// POST /api/payments/{payment_id}/refund
///
/// Refunds are an operator action; the caller header is still required so
/// every refund is attributable in the logs.
pub async fn refund_payment(
    State(state): State<PaymentsState>,
    headers: HeaderMap,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<RefundResponse>, AppError> {
    let operator = caller_id(&headers)?;
    info!(payment_id = %payment_id, operator = %operator, "refund requested");

    let outcome = state
        .orchestrator
        .refund(payment_id)
        .await
        .map_err(|e| with_request(e.into(), &headers))?;

    Ok(Json(RefundResponse {
        payment_id,
        status: outcome.payment.status,
        refund_status: outcome.result.status,
        result_code: outcome.result.result_code,
    }))
}
