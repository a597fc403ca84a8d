use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::payments::types::CallbackPayload;
use crate::services::webhook_processor::WebhookProcessor;

#[derive(Clone)]
pub struct WebhookState {
    pub processor: Arc<WebhookProcessor>,
}

/// POST /webhooks/{channel}
pub async fn handle_webhook(
    State(state): State<WebhookState>,
    Path(channel): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    reconcile(&state, &channel, None, query, &headers, body).await
}

/// POST /webhooks/{channel}/{payment_id}
pub async fn handle_webhook_with_key(
    State(state): State<WebhookState>,
    Path((channel, path_key)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    reconcile(&state, &channel, Some(path_key), query, &headers, body).await
}

/// Providers retry anything but a 200, so every outcome is a 200 and the ack
/// body carries the verdict.
async fn reconcile(
    state: &WebhookState,
    channel: &str,
    path_key: Option<String>,
    query: HashMap<String, String>,
    headers: &HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    info!(channel = %channel, path_key = path_key.as_deref().unwrap_or(""), "received webhook");

    let mut callback = CallbackPayload::new(path_key, body.to_vec());
    callback.query = query;
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            callback = callback.with_header(name.as_str(), value);
        }
    }

    let ack = state.processor.reconcile(channel, callback).await;
    info!(channel = %channel, outcome = ?ack.outcome, "webhook acknowledged");
    (StatusCode::OK, Json(ack.body))
}
