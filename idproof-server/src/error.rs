//! API error handling module
//!
//! One error type for every endpoint. Engine errors keep their own taxonomy and
//! are mapped to a status code and a stable `code` string here.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use idproof_core::VerificationError;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// Body of every error response
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Human-readable message, safe to show to the end user
    pub error: String,
    /// Stable code for programmatic handling (e.g. `CHALLENGE_EXPIRED`)
    pub code: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad request - client provided invalid input
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Authentication error with specific error code
    #[error("{message}")]
    AuthError { message: String, code: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal server error - unexpected server-side failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// Service unavailable - a dependency is down
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Verification(#[from] VerificationError),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable(message.into())
    }

    pub fn auth_error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthError {
            message: message.into(),
            code: code.into(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::AuthError { .. } => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Verification(e) => match e {
                VerificationError::Validation(_) => StatusCode::BAD_REQUEST,
                VerificationError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                VerificationError::ExpiredOrConsumedChallenge => StatusCode::GONE,
                VerificationError::InvalidProof(_) => StatusCode::UNPROCESSABLE_ENTITY,
                VerificationError::ResubmissionNotAllowed(_) => StatusCode::FORBIDDEN,
                VerificationError::ConflictingDecision(_) => StatusCode::CONFLICT,
                VerificationError::ProviderFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
                VerificationError::NotFound(_) => StatusCode::NOT_FOUND,
                VerificationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Get the error code for programmatic error handling
    pub fn error_code(&self) -> &str {
        match self {
            Self::BadRequest(_) => "INVALID_INPUT",
            Self::AuthError { code, .. } => code,
            Self::NotFound(_) => "NOT_FOUND",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Verification(e) => match e {
                VerificationError::Validation(_) => "INVALID_INPUT",
                VerificationError::RateLimited { .. } => "RATE_LIMITED",
                VerificationError::ExpiredOrConsumedChallenge => "CHALLENGE_EXPIRED",
                VerificationError::InvalidProof(_) => "INVALID_PROOF",
                VerificationError::ResubmissionNotAllowed(_) => "RESUBMISSION_NOT_ALLOWED",
                VerificationError::ConflictingDecision(_) => "CONFLICTING_DECISION",
                VerificationError::ProviderFailure(_) => "PROVIDER_UNAVAILABLE",
                VerificationError::NotFound(_) => "NOT_FOUND",
                VerificationError::Storage(_) => "INTERNAL_ERROR",
            },
        }
    }

    /// Sanitized message for the response body. Proof failures stay generic so
    /// the response never reveals which part of a proof was wrong.
    fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "An internal error occurred".to_string(),
            Self::Verification(e) => match e {
                VerificationError::Validation(message) => message.clone(),
                VerificationError::RateLimited { retry_after_secs } => {
                    format!("Too many attempts, retry after {retry_after_secs} seconds")
                }
                VerificationError::ExpiredOrConsumedChallenge => {
                    "Challenge expired or already used, request a new one".to_string()
                }
                VerificationError::InvalidProof(_) => "Verification failed".to_string(),
                VerificationError::ResubmissionNotAllowed(message) => message.clone(),
                VerificationError::ConflictingDecision(_) => {
                    "This attempt has already been decided".to_string()
                }
                VerificationError::ProviderFailure(_) => {
                    "An upstream provider is unavailable, try again later".to_string()
                }
                VerificationError::NotFound(message) => message.clone(),
                VerificationError::Storage(_) => "An internal error occurred".to_string(),
            },
            _ => self.to_string(),
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Verification(VerificationError::RateLimited { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            _ => None,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code().to_string();
        let internal_message = self.to_string();

        // Internal details are logged, never returned
        if status.is_server_error() {
            tracing::error!(status = %status, code = %code, error = %internal_message, "Server error");
        } else if matches!(self, Self::AuthError { .. }) {
            tracing::warn!(status = %status, code = %code, error = %internal_message, "Authentication error");
        } else {
            tracing::warn!(status = %status, code = %code, error = %internal_message, "Client error");
        }

        let body = ErrorBody {
            error: self.client_message(),
            code,
        };
        let mut response = (status, Json(body)).into_response();

        if let Some(secs) = self.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idproof_core::StorageError;
    use uuid::Uuid;

    #[test]
    fn test_verification_error_mapping() {
        let cases: Vec<(VerificationError, StatusCode, &str)> = vec![
            (VerificationError::validation("bad"), StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            (
                VerificationError::RateLimited { retry_after_secs: 30 },
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
            ),
            (
                VerificationError::ExpiredOrConsumedChallenge,
                StatusCode::GONE,
                "CHALLENGE_EXPIRED",
            ),
            (
                VerificationError::invalid_proof("code mismatch"),
                StatusCode::UNPROCESSABLE_ENTITY,
                "INVALID_PROOF",
            ),
            (
                VerificationError::ResubmissionNotAllowed("cap".into()),
                StatusCode::FORBIDDEN,
                "RESUBMISSION_NOT_ALLOWED",
            ),
            (
                VerificationError::ConflictingDecision(Uuid::nil()),
                StatusCode::CONFLICT,
                "CONFLICTING_DECISION",
            ),
            (
                VerificationError::provider("timeout"),
                StatusCode::SERVICE_UNAVAILABLE,
                "PROVIDER_UNAVAILABLE",
            ),
            (VerificationError::not_found("attempt"), StatusCode::NOT_FOUND, "NOT_FOUND"),
            (
                VerificationError::Storage(StorageError::Query("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
            ),
        ];

        for (error, status, code) in cases {
            let api = ApiError::from(error);
            assert_eq!(api.status_code(), status);
            assert_eq!(api.error_code(), code);
        }
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response =
            ApiError::from(VerificationError::RateLimited { retry_after_secs: 42 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }

    #[test]
    fn test_storage_details_not_exposed() {
        let api = ApiError::from(VerificationError::Storage(StorageError::Query(
            "relation \"identity_attempts\" does not exist".into(),
        )));
        assert_eq!(api.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_invalid_proof_message_is_generic() {
        let api = ApiError::from(VerificationError::invalid_proof("code mismatch, 2 attempts left"));
        assert_eq!(api.client_message(), "Verification failed");
    }

    #[test]
    fn test_auth_error_uses_own_code() {
        let api = ApiError::auth_error("AUTH_MISSING_TOKEN", "Missing Authorization header");
        assert_eq!(api.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(api.error_code(), "AUTH_MISSING_TOKEN");
    }
}
