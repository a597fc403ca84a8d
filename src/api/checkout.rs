use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;

use crate::api::payments::USER_ID_HEADER;
use crate::error::{AppError, AppErrorKind, DomainError};
use crate::middleware::error::get_request_id_from_headers;
use crate::services::checkout::{CheckoutService, CheckoutStatus};

#[derive(Clone)]
pub struct CheckoutState {
    pub checkout: Arc<CheckoutService>,
}

/// GET /api/checkout/{checkout_id}
pub async fn get_checkout(
    State(state): State<CheckoutState>,
    headers: HeaderMap,
    Path(checkout_id): Path<String>,
) -> Result<Json<CheckoutStatus>, AppError> {
    let request_id = get_request_id_from_headers(&headers).unwrap_or_default();
    let caller = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| {
            AppError::new(AppErrorKind::Domain(DomainError::Unauthenticated))
                .with_request_id(request_id.clone())
        })?;

    let status = state
        .checkout
        .get(&checkout_id, caller.trim())
        .await
        .map_err(|e| AppError::from(e).with_request_id(request_id.clone()))?;
    Ok(Json(status))
}
