//! Billing error taxonomy

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors surfaced by the quota/subscription engine.
///
/// `PaymentDeclined` exists for completeness but never propagates out of the
/// lifecycle engine: a declined renewal is steady-state behavior handled by
/// the expire transition, visible only in logs.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{message}")]
    Validation {
        code: &'static str,
        message: String,
    },

    #[error("{0}")]
    Forbidden(String),

    #[error("payment declined: {0}")]
    PaymentDeclined(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(err: redis::RedisError) -> Self {
        Self::Queue(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
