//! Unified error handling for the payment backend
//!
//! Every layer keeps its own `thiserror` enum; this module is where they meet
//! the HTTP boundary with a status code, a stable error code and a message
//! that is safe to show to a buyer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "PAYMENT_NOT_FOUND")]
    PaymentNotFound,
    #[serde(rename = "ORDER_NOT_FOUND")]
    OrderNotFound,
    #[serde(rename = "ORDER_NOT_PAYABLE")]
    OrderNotPayable,
    #[serde(rename = "INVALID_PAYMENT_STATE")]
    InvalidPaymentState,
    #[serde(rename = "CHECKOUT_NOT_FOUND")]
    CheckoutNotFound,
    #[serde(rename = "CHECKOUT_EXPIRED")]
    CheckoutExpired,
    #[serde(rename = "UNAUTHENTICATED")]
    Unauthenticated,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CACHE_ERROR")]
    CacheError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 504)
    #[serde(rename = "PAYMENT_PROVIDER_ERROR")]
    PaymentProviderError,
    #[serde(rename = "NO_PAYMENT_SERVICE_AVAILABLE")]
    NoPaymentServiceAvailable,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    PaymentNotFound { payment_id: String },
    OrderNotFound { order_id: String },
    /// Order exists but is not awaiting payment
    OrderNotPayable { order_id: String, status: String },
    /// Operation not allowed in the payment's current state
    InvalidPaymentState {
        payment_id: String,
        status: String,
        action: String,
    },
    CheckoutNotFound { checkout_id: String },
    CheckoutExpired { checkout_id: String },
    /// No caller identity on the request
    Unauthenticated,
}

/// Infrastructure-level errors (database, cache, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    /// Database connection or query failure
    Database { message: String, is_retryable: bool },
    /// Redis cache unavailable
    Cache { message: String },
    /// Missing or invalid configuration
    Configuration { message: String },
}

/// External service errors
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Payment channel (Flutterwave, Paystack, M-Pesa) error
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    /// No configured channel can take this payment
    NoChannelAvailable {
        payment_method: String,
        currency: String,
    },
    /// External service timeout
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// A field carries a value that cannot be accepted
    InvalidField { field: String, reason: String },
    /// Invalid amount (format or value)
    InvalidAmount { amount: String, reason: String },
    /// Required field missing
    MissingField { field: String },
    UnsupportedPaymentMethod { method: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { .. } => 404,
                DomainError::OrderNotFound { .. } => 404,
                DomainError::OrderNotPayable { .. } => 409, // Conflict
                DomainError::InvalidPaymentState { .. } => 409,
                DomainError::CheckoutNotFound { .. } => 404,
                DomainError::CheckoutExpired { .. } => 410, // Gone
                DomainError::Unauthenticated => 401,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => 502, // Bad Gateway
                ExternalError::NoChannelAvailable { .. } => 503,
                ExternalError::Timeout { .. } => 504, // Gateway Timeout
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { .. } => ErrorCode::PaymentNotFound,
                DomainError::OrderNotFound { .. } => ErrorCode::OrderNotFound,
                DomainError::OrderNotPayable { .. } => ErrorCode::OrderNotPayable,
                DomainError::InvalidPaymentState { .. } => ErrorCode::InvalidPaymentState,
                DomainError::CheckoutNotFound { .. } => ErrorCode::CheckoutNotFound,
                DomainError::CheckoutExpired { .. } => ErrorCode::CheckoutExpired,
                DomainError::Unauthenticated => ErrorCode::Unauthenticated,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Cache { .. } => ErrorCode::CacheError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => ErrorCode::PaymentProviderError,
                ExternalError::NoChannelAvailable { .. } => ErrorCode::NoPaymentServiceAvailable,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { payment_id } => {
                    format!("Payment '{}' not found", payment_id)
                }
                DomainError::OrderNotFound { order_id } => {
                    format!("Order '{}' not found", order_id)
                }
                DomainError::OrderNotPayable { order_id, status } => {
                    format!("Order '{}' cannot be paid while {}", order_id, status)
                }
                DomainError::InvalidPaymentState {
                    payment_id,
                    status,
                    action,
                } => {
                    format!(
                        "Payment '{}' is {} and cannot be {}",
                        payment_id, status, action
                    )
                }
                DomainError::CheckoutNotFound { .. } => "Checkout not found".to_string(),
                DomainError::CheckoutExpired { .. } => {
                    "Checkout has expired. Please start the payment again".to_string()
                }
                DomainError::Unauthenticated => "Authentication required".to_string(),
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment provider ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        "Payment processing failed. Please contact support".to_string()
                    }
                }
                ExternalError::NoChannelAvailable { .. } => {
                    "No payment service available".to_string()
                }
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => {
                    format!(
                        "{} request timed out after {} seconds. Please try again",
                        service, timeout_secs
                    )
                }
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::UnsupportedPaymentMethod { method } => {
                    format!("Payment method '{}' is not supported", method)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Cache { .. } => true,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => *is_retryable,
                ExternalError::NoChannelAvailable { .. } => true,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// Conversions from layer errors live next to those errors
// (database/error.rs, payments/error.rs, services/*).

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
