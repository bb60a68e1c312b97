use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::types::ApiErrorResponse;

/// Application error codes following the pattern E{range}{sequence}.
///
/// Single range for this engine (E5xxx, the range the notification service
/// used in the teacher pack — this engine supersedes it):
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InternalError,
    ValidationError,
    NotFound,
    Unauthorized,
    Forbidden,
    BadRequest,
    PayloadTooLarge,
    SubscriptionNotFound,
    DeliveryNotFound,
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InternalError => "E5001",
            Self::ValidationError => "E5002",
            Self::NotFound => "E5003",
            Self::Unauthorized => "E5004",
            Self::Forbidden => "E5005",
            Self::BadRequest => "E5006",
            Self::PayloadTooLarge => "E5007",
            Self::SubscriptionNotFound => "E5008",
            Self::DeliveryNotFound => "E5009",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ValidationError | Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound | Self::SubscriptionNotFound | Self::DeliveryNotFound => {
                StatusCode::NOT_FOUND
            }
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            // Cross-tenant access collapses to 404, never 403 — callers must not
            // be able to distinguish "not yours" from "doesn't exist".
            Self::Forbidden => StatusCode::NOT_FOUND,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{message}")]
    Known {
        code: ErrorCode,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: ErrorCode,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// Collapses into the same response shape as `not_found` — tenant
    /// isolation means a caller never learns a resource exists under a
    /// tenant that isn't theirs.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PayloadTooLarge, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            AppError::Known {
                code,
                message,
                details,
            } => {
                let status = code.status_code();
                let mut resp = ApiErrorResponse::new(code.code(), message);
                if let Some(d) = details {
                    resp = resp.with_details(d.clone());
                }
                (status, resp)
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiErrorResponse::new("E5001", "internal server error"),
                )
            }
            AppError::Database(err) => {
                tracing::error!(error = %err, "database error");
                match err {
                    diesel::result::Error::NotFound => (
                        StatusCode::NOT_FOUND,
                        ApiErrorResponse::new("E5003", "resource not found"),
                    ),
                    _ => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        ApiErrorResponse::new("E5001", "database error"),
                    ),
                }
            }
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, ApiErrorResponse::new("E5002", msg))
            }
        };

        (status, Json(error_response)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Outcome of a single delivery attempt against a receiver endpoint.
///
/// This never crosses the admin HTTP boundary — it drives Outbox state
/// transitions inside the dispatcher and is not an `AppError` variant.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Success { status: u16, duration_ms: i32 },
    RemoteRetriable { status: Option<u16>, error: String },
    RemoteTerminal { status: Option<u16>, error: String },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::RemoteRetriable { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Success { status, .. } => Some(*status),
            Self::RemoteRetriable { status, .. } | Self::RemoteTerminal { status, .. } => *status,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::RemoteRetriable { error, .. } | Self::RemoteTerminal { error, .. } => {
                Some(error.as_str())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_maps_to_expected_status() {
        assert_eq!(ErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorCode::Forbidden.status_code(),
            StatusCode::NOT_FOUND,
            "forbidden must collapse to not_found for tenant isolation"
        );
        assert_eq!(
            ErrorCode::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn known_error_carries_its_code_string() {
        let err = AppError::new(ErrorCode::SubscriptionNotFound, "no such subscription");
        match err {
            AppError::Known { code, .. } => assert_eq!(code.code(), "E5008"),
            _ => panic!("expected Known variant"),
        }
    }

    #[test]
    fn delivery_outcome_classification_helpers() {
        let ok = DeliveryOutcome::Success {
            status: 204,
            duration_ms: 12,
        };
        assert!(ok.is_success());
        assert!(!ok.is_retriable());

        let retriable = DeliveryOutcome::RemoteRetriable {
            status: Some(503),
            error: "service unavailable".into(),
        };
        assert!(!retriable.is_success());
        assert!(retriable.is_retriable());
        assert_eq!(retriable.status_code(), Some(503));
    }
}
