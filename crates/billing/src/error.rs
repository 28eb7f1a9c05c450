//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Identity provider error: {0}")]
    Identity(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook event type not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Batch of {size} writes exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<bulldogo_shared::PlatformError> for BillingError {
    fn from(err: bulldogo_shared::PlatformError) -> Self {
        match err {
            bulldogo_shared::PlatformError::NotFound(msg) => BillingError::NotFound(msg),
            bulldogo_shared::PlatformError::Validation(msg)
            | bulldogo_shared::PlatformError::InvalidTimestamp(msg) => {
                BillingError::InvalidInput(msg)
            }
            other => BillingError::Internal(other.to_string()),
        }
    }
}

impl BillingError {
    /// Whether the failure came from an upstream provider and may succeed on retry
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            BillingError::Gateway(_) | BillingError::StripeApi(_) | BillingError::Identity(_)
        )
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
