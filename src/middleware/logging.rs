//! Request logging and request-id generation for the HTTP stack.

use crate::middleware::error::get_request_id_from_headers;
use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tower_http::request_id::{MakeRequestId, RequestId};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Fills `x-request-id` with a v4 UUID when the caller did not send one.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// One span per request, one summary line per response.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = get_request_id_from_headers(request.headers()).unwrap_or_default();
    let span = info_span!(
        "http_request",
        method = %method,
        path = %path,
        request_id = %request_id
    );

    let start = Instant::now();
    let response = next.run(request).instrument(span.clone()).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    let _guard = span.enter();
    if response.status().is_server_error() {
        error!(status, latency_ms, "request failed");
    } else if response.status().is_client_error() {
        warn!(status, latency_ms, "request rejected");
    } else {
        info!(status, latency_ms, "request completed");
    }

    response
}
