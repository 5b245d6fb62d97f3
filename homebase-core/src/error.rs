//! Error types and HTTP response conversion
//!
//! The outward mapping is deliberately coarse: authentication failures are
//! indistinguishable between unknown user, wrong password, and deactivated
//! account, and internal detail (SQL, storage, provider errors) is logged
//! server-side but never serialized into a response body.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::repository::RepositoryError;

/// Result type alias using the platform error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the platform core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Persistence error, already categorized by the repository layer
    #[error("{0}")]
    Repository(#[from] RepositoryError),

    /// Bearer token error (signature, expiry, malformed)
    #[error("Token error: {0}")]
    Jwt(Box<jsonwebtoken::errors::Error>),

    /// I/O error (storage backend, key files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failure (401)
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Authorization failure (403)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Resource not found (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Resource conflict (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Validation error (422)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Storage admission veto (507)
    #[error("Insufficient storage: {0}")]
    QuotaExceeded(String),

    /// Rate limit exceeded (429)
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Outbound call to an OAuth provider or other collaborator failed
    #[error("External service error: {0}")]
    External(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl Error {
    /// Missing or unparseable credential (stable wording)
    pub fn no_authorization() -> Self {
        Error::Unauthorized("No authorization provided".to_string())
    }

    /// Credential present but rejected (stable wording)
    pub fn invalid_token() -> Self {
        Error::Unauthorized("Invalid token".to_string())
    }

    /// Login failure; identical for unknown email and wrong password
    pub fn invalid_credentials() -> Self {
        Error::Unauthorized("Invalid credentials".to_string())
    }

    /// Ownership or policy check failure (stable wording)
    pub fn access_denied() -> Self {
        Error::Forbidden("Access denied".to_string())
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Optional error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// HTTP status code
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            status: status.as_u16(),
        }
    }

    /// Create error response with a code
    pub fn with_code(
        status: StatusCode,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
            status: status.as_u16(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_response) = match self {
            Error::Config(e) => {
                tracing::error!("Configuration error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "CONFIG_ERROR",
                        "Internal server error",
                    ),
                )
            }

            Error::Repository(e) => {
                return repository_error_response(e);
            }

            Error::Jwt(e) => {
                tracing::debug!("Token rejected: {}", e);
                (
                    StatusCode::UNAUTHORIZED,
                    ErrorResponse::with_code(
                        StatusCode::UNAUTHORIZED,
                        "INVALID_TOKEN",
                        "Invalid token",
                    ),
                )
            }

            Error::Io(e) => {
                tracing::error!("I/O error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "IO_ERROR",
                        "Internal server error",
                    ),
                )
            }

            Error::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::with_code(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            ),

            Error::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                ErrorResponse::with_code(StatusCode::FORBIDDEN, "FORBIDDEN", msg),
            ),

            Error::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_code(StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ),

            Error::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_code(StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ),

            Error::Conflict(msg) => (
                StatusCode::CONFLICT,
                ErrorResponse::with_code(StatusCode::CONFLICT, "CONFLICT", msg),
            ),

            Error::ValidationError(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorResponse::with_code(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", msg),
            ),

            Error::QuotaExceeded(msg) => (
                StatusCode::INSUFFICIENT_STORAGE,
                ErrorResponse::with_code(StatusCode::INSUFFICIENT_STORAGE, "QUOTA_EXCEEDED", msg),
            ),

            Error::RateLimitExceeded => {
                let body = ErrorResponse::with_code(
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMIT_EXCEEDED",
                    "Rate limit exceeded",
                );
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, "60")],
                    Json(body),
                )
                    .into_response();
            }

            Error::External(msg) => {
                tracing::error!("External service error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "Internal server error",
                    ),
                )
            }

            Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "Internal server error",
                    ),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

fn repository_error_response(e: RepositoryError) -> Response {
    let (status, body) = match e {
        RepositoryError::NotFound => (
            StatusCode::NOT_FOUND,
            ErrorResponse::with_code(StatusCode::NOT_FOUND, "NOT_FOUND", "Not found"),
        ),
        RepositoryError::Conflict(msg) => (
            StatusCode::CONFLICT,
            ErrorResponse::with_code(StatusCode::CONFLICT, "CONFLICT", msg),
        ),
        RepositoryError::AlreadyUsed => (
            StatusCode::CONFLICT,
            ErrorResponse::with_code(
                StatusCode::CONFLICT,
                "TOKEN_USED",
                "Token has already been used",
            ),
        ),
        RepositoryError::Unavailable(msg) => {
            tracing::error!("Store unavailable: {}", msg);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::with_code(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORE_UNAVAILABLE",
                    "Internal server error",
                ),
            )
        }
        RepositoryError::Backend(msg) => {
            tracing::error!("Store error: {}", msg);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::with_code(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORE_ERROR",
                    "Internal server error",
                ),
            )
        }
    };
    (status, Json(body)).into_response()
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Error::Jwt(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let response = Error::RateLimitExceeded.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &"60"
        );
    }

    #[test]
    fn test_internal_detail_is_not_leaked() {
        let response =
            Error::Internal("connection refused at 10.0.0.3:5432".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_stable_auth_wordings() {
        assert!(matches!(
            Error::invalid_credentials(),
            Error::Unauthorized(msg) if msg == "Invalid credentials"
        ));
        assert!(matches!(
            Error::access_denied(),
            Error::Forbidden(msg) if msg == "Access denied"
        ));
    }

    #[test]
    fn test_token_reuse_maps_to_conflict() {
        let response = Error::from(RepositoryError::AlreadyUsed).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
