use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::error::Error;
use std::fmt;

use crate::middleware::rate_limit::{apply_rate_limit_headers, RateLimitRejection};
use crate::store::StoreError;

/// The primary error type for the application.
///
/// Only two shapes ever reach a client as a deliberate outcome: the `429` throttling payload and
/// the generic `{ error: { code, message } }` body. Internal detail stays in the logs.
#[derive(Debug)]
pub enum AppError {
    /// For internal server errors that are not expected to be handled by the client.
    Internal(anyhow::Error),
    /// For client errors due to invalid requests.
    BadRequest(String),
    /// For request bodies larger than the inspection limit.
    PayloadTooLarge(String),
    /// For when a service is temporarily unavailable.
    ServiceUnavailable(String),
    /// For when a specific field in a request fails validation.
    ValidationError {
        /// The name of the field that failed validation.
        field: String,
        /// A message describing the validation error.
        message: String,
    },
    /// A submitted anti-forgery token was missing, stale or did not match.
    CsrfRejected(String),
    /// For when a client has exhausted its quota for the current window.
    RateLimited(RateLimitRejection),
    /// A counter or token store operation failed.
    TransientStore(StoreError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(e) => write!(f, "Internal error: {}", e),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::ValidationError { field, message } => {
                write!(f, "Validation error on field '{}': {}", field, message)
            }
            AppError::CsrfRejected(msg) => write!(f, "CSRF rejected: {}", msg),
            AppError::RateLimited(r) => {
                write!(f, "Rate limited. Retry after {} seconds", r.retry_after_secs)
            }
            AppError::TransientStore(e) => write!(f, "Store error: {}", e),
        }
    }
}

impl Error for AppError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AppError::Internal(e) => Some(e.as_ref()),
            AppError::TransientStore(e) => Some(e),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, error_message, details) = match self {
            AppError::RateLimited(rejection) => return rate_limited_response(rejection),
            AppError::Internal(e) => {
                let error_id = uuid::Uuid::new_v4();
                tracing::error!(%error_id, "Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                    Some(json!({ "error_id": error_id.to_string() })),
                )
            }
            AppError::TransientStore(e) => {
                let error_id = uuid::Uuid::new_v4();
                tracing::error!(%error_id, "Store error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                    Some(json!({ "error_id": error_id.to_string() })),
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg, None),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", msg, None),
            AppError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg, None)
            }
            AppError::ValidationError { field, message } => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                format!("Validation failed for field '{}'", field),
                Some(json!({ "field": field, "message": message })),
            ),
            AppError::CsrfRejected(msg) => (StatusCode::FORBIDDEN, "CSRF_REJECTED", msg, None),
        };

        let mut body = json!({
            "error": {
                "code": error_code,
                "message": error_message,
            },
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        if let Some(details) = details {
            body["error"]["details"] = details;
        }

        (status, Json(body)).into_response()
    }
}

/// `429` with the throttling payload `{ error, message, resetTime }` and quota headers.
fn rate_limited_response(rejection: RateLimitRejection) -> Response {
    let body = json!({
        "error": "Too many requests",
        "message": rejection.message,
        "resetTime": rejection.reset_at.to_rfc3339(),
    });
    let mut res = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = res.headers_mut();
    apply_rate_limit_headers(headers, rejection.limit, 0, rejection.reset_at);
    headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(rejection.retry_after_secs));
    res
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::TransientStore(err)
    }
}

/// A type alias for `Result<T, AppError>`, used throughout the application.
pub type AppResult<T> = Result<T, AppError>;

/// Coarse classification of what went wrong, independent of where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Configuration,
    TransientStore,
    Validation,
    LimitExceeded,
    TokenMismatch,
}

impl AppError {
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            AppError::Internal(_) | AppError::TransientStore(_) | AppError::ServiceUnavailable(_) => {
                FaultKind::TransientStore
            }
            AppError::BadRequest(_) | AppError::PayloadTooLarge(_) | AppError::ValidationError { .. } => {
                FaultKind::Validation
            }
            AppError::CsrfRejected(_) => FaultKind::TokenMismatch,
            AppError::RateLimited(_) => FaultKind::LimitExceeded,
        }
    }
}

/// The protective checks a fault can occur in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardSite {
    IdentifierResolution,
    RateLimitCheck,
    TokenIssue,
    TokenValidation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

/// What a guard does with a request once a check at `site` ended in `kind`.
///
/// Internal faults fail open everywhere except token validation, where a token that could not
/// be checked counts as a mismatch.
pub const fn verdict(site: GuardSite, kind: FaultKind) -> Verdict {
    match (site, kind) {
        (_, FaultKind::LimitExceeded) => Verdict::Deny,
        (_, FaultKind::TokenMismatch) => Verdict::Deny,
        (_, FaultKind::Configuration) => Verdict::Deny,
        (GuardSite::TokenValidation, _) => Verdict::Deny,
        (_, FaultKind::TransientStore) => Verdict::Allow,
        (_, FaultKind::Validation) => Verdict::Allow,
    }
}
