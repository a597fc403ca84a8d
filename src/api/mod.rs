//! HTTP surface: route table, per-area state and the shared middleware stack.

pub mod checkout;
pub mod payments;
pub mod webhooks;

use crate::health::{HealthChecker, HealthState, HealthStatus};
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::services::checkout::CheckoutService;
use crate::services::payment_orchestrator::PaymentOrchestrator;
use crate::services::webhook_processor::WebhookProcessor;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Everything the handlers need, built once in `main`.
#[derive(Clone)]
pub struct ApiServices {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub webhooks: Arc<WebhookProcessor>,
    pub checkout: Arc<CheckoutService>,
    pub health: HealthChecker,
}

pub fn router(services: ApiServices) -> Router {
    let payment_routes = Router::new()
        .route("/api/payments/charge", post(payments::charge))
        .route("/api/payments/{payment_id}", get(payments::get_payment))
        .route(
            "/api/payments/{payment_id}/cancel",
            post(payments::cancel_payment),
        )
        .route(
            "/api/payments/{payment_id}/refund",
            post(payments::refund_payment),
        )
        .with_state(payments::PaymentsState {
            orchestrator: services.orchestrator,
        });

    let webhook_routes = Router::new()
        .route("/webhooks/{channel}", post(webhooks::handle_webhook))
        .route(
            "/webhooks/{channel}/{payment_id}",
            post(webhooks::handle_webhook_with_key),
        )
        .with_state(webhooks::WebhookState {
            processor: services.webhooks,
        });

    let checkout_routes = Router::new()
        .route("/api/checkout/{checkout_id}", get(checkout::get_checkout))
        .with_state(checkout::CheckoutState {
            checkout: services.checkout,
        });

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(health))
        .route("/health/live", get(liveness))
        .with_state(services.health);

    Router::new()
        .merge(payment_routes)
        .merge(webhook_routes)
        .merge(checkout_routes)
        .merge(health_routes)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

async fn health(
    State(checker): State<HealthChecker>,
) -> Result<Json<HealthStatus>, (StatusCode, String)> {
    let health_status = checker.check_health().await;

    if health_status.status == HealthState::Unhealthy {
        error!("health check failed, service unhealthy");
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable".to_string(),
        ))
    } else {
        Ok(Json(health_status))
    }
}

async fn liveness() -> &'static str {
    info!("liveness check");
    "OK"
}
