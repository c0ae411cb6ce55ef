//! Request-level error taxonomy shared by the gateway and the stores.
//!
//! Every failure a handler can produce maps to exactly one HTTP status:
//! validation/duplicate → 422, authentication → 401, authorization → 403,
//! missing resource → 404, storage outage → 503. 500 is reserved for
//! genuinely unexpected failures and never used for a normal auth rejection.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

/// A single field-level validation failure, reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Unified API error. The `Display` text is what the caller sees; anything
/// sensitive stays in the `tracing` log emitted at response time.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Validation failed")]
    Validation(Vec<FieldError>),

    #[error("Email is already registered")]
    DuplicateEmail,

    /// Deliberately identical for wrong-password and unknown-email so the
    /// response does not disclose which one it was.
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid session token")]
    InvalidToken,

    #[error("Session token has expired")]
    ExpiredToken,

    /// Authenticated, but acting on a resource owned by another identity.
    #[error("You do not own this resource")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Anti-forgery token missing or mismatched")]
    CsrfMismatch,

    /// Token/credential storage is structurally unavailable. Surfaced as a
    /// distinct 503 — never masked by a weaker fallback credential.
    #[error("Authentication system unavailable")]
    Infrastructure(#[source] anyhow::Error),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::DuplicateEmail => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidCredentials | Self::InvalidToken | Self::ExpiredToken => {
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden | Self::CsrfMismatch => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Infrastructure(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Full context server-side only; the wire message stays opaque.
        match &self {
            Self::Infrastructure(source) => {
                tracing::error!(error = %source, "storage unavailable");
            }
            Self::Internal(source) => {
                tracing::error!(error = ?source, "unexpected request failure");
            }
            _ => {}
        }

        let body = match &self {
            Self::Validation(fields) => {
                let mut errors = serde_json::Map::new();
                for fe in fields {
                    let entry = errors
                        .entry(fe.field.to_string())
                        .or_insert_with(|| json!([]));
                    if let Some(list) = entry.as_array_mut() {
                        list.push(json!(fe.message));
                    }
                }
                json!({"message": self.to_string(), "errors": errors})
            }
            Self::DuplicateEmail => {
                json!({
                    "message": "Validation failed",
                    "errors": {"email": [self.to_string()]},
                })
            }
            _ => json!({"message": self.to_string()}),
        };

        (status, Json(body)).into_response()
    }
}
