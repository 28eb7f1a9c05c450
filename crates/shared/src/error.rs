//! Error types for Bulldogo

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Billing error: {0}")]
    Billing(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
