//! Structured errors for the remote build server.
//!
//! Every failure leaves as an [`ErrorResponse`] body whose `code` the client
//! maps back to a core error class.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use scenariodb_core::Error;
use scenariodb_core::remote::{ErrorResponse, codes};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("protocol version {got} is not supported (expected {expected})")]
    VersionMismatch { expected: u32, got: u32 },

    #[error("build hash {got} does not match this checkout ({expected})")]
    BuildHashMismatch { expected: String, got: String },

    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Build(#[from] Error),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::VersionMismatch { .. } => (StatusCode::CONFLICT, codes::VERSION_MISMATCH),
            ApiError::BuildHashMismatch { .. } => (StatusCode::CONFLICT, codes::BUILD_HASH_MISMATCH),
            ApiError::InvalidRequest(_) | ApiError::Build(Error::Config(_)) => {
                (StatusCode::BAD_REQUEST, codes::INVALID_REQUEST)
            }
            ApiError::Build(Error::HashingError { .. }) => (StatusCode::INTERNAL_SERVER_ERROR, codes::HASHING_ERROR),
            ApiError::Build(_) => (StatusCode::INTERNAL_SERVER_ERROR, codes::BUILD_FAILED),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        tracing::warn!(code, "remote build refused: {}", self);
        (status, Json(ErrorResponse { error: self.to_string(), code: code.to_string() })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenariodb_core::config::ConfigError;

    #[test]
    fn test_error_codes() {
        let cases = [
            (ApiError::VersionMismatch { expected: 1, got: 2 }, StatusCode::CONFLICT, codes::VERSION_MISMATCH),
            (
                ApiError::BuildHashMismatch { expected: "a".into(), got: "b".into() },
                StatusCode::CONFLICT,
                codes::BUILD_HASH_MISMATCH,
            ),
            (
                ApiError::Build(Error::Config(ConfigError::LoadFailed("x".into()))),
                StatusCode::BAD_REQUEST,
                codes::INVALID_REQUEST,
            ),
            (
                ApiError::Build(Error::HashingError { path: "p".into(), reason: "r".into() }),
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::HASHING_ERROR,
            ),
            (ApiError::Build(Error::SnapshotIo("x".into())), StatusCode::INTERNAL_SERVER_ERROR, codes::BUILD_FAILED),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status_and_code(), (status, code), "{err}");
        }
    }
}
