use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

/// Errors raised inside the channel adapter layer. Adapters fold most of these
/// into a `Failed` result before they reach the orchestrator.
#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Insufficient funds: {message}")]
    InsufficientFundsError { message: String },

    #[error("Payment declined: {message}")]
    PaymentDeclinedError {
        message: String,
        provider_code: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Webhook verification failed: {message}")]
    WebhookVerificationError { message: String },

    #[error("Channel account misconfigured: account={account_id}, {message}")]
    ConfigurationError { account_id: String, message: String },

    #[error("Provider error: provider={provider}, message={message}")]
    ProviderError {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::InsufficientFundsError { .. } => false,
            PaymentError::PaymentDeclinedError { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::WebhookVerificationError { .. } => false,
            PaymentError::ConfigurationError { .. } => false,
            PaymentError::ProviderError { retryable, .. } => *retryable,
        }
    }

    pub fn provider_error(provider: &str, message: impl Into<String>) -> Self {
        PaymentError::ProviderError {
            provider: provider.to_string(),
            message: message.into(),
            provider_code: None,
            retryable: false,
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

        match err {
            PaymentError::ValidationError { message, field } => {
                AppError::new(AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.unwrap_or_else(|| "request".to_string()),
                    reason: message,
                }))
            }
            PaymentError::ProviderError {
                provider,
                message,
                retryable,
                ..
            } => AppError::new(AppErrorKind::External(ExternalError::PaymentProvider {
                provider,
                message,
                is_retryable: retryable,
            })),
            other => AppError::new(AppErrorKind::External(ExternalError::PaymentProvider {
                provider: "payments".to_string(),
                message: other.to_string(),
                is_retryable: other.is_retryable(),
            })),
        }
    }
}
