//! API error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chatmeter_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP-facing error wrapper around the billing taxonomy.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: Option<&'static str>,
    message: String,
}

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: None,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: None,
            message: message.into(),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        let (status, code) = match &err {
            BillingError::QuotaExceeded(_) => (StatusCode::FORBIDDEN, None),
            BillingError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            BillingError::Validation { code, .. } => (StatusCode::BAD_REQUEST, Some(*code)),
            BillingError::Forbidden(_) => (StatusCode::FORBIDDEN, None),
            BillingError::PaymentDeclined(_)
            | BillingError::Storage(_)
            | BillingError::Queue(_)
            | BillingError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "Request failed");
            return Self {
                status,
                code,
                message: "Internal server error".to_string(),
            };
        }

        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "code": self.code,
        });
        (self.status, Json(body)).into_response()
    }
}
