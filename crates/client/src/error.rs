//! Remote build client error types.

use std::sync::Arc;

use scenariodb_core::Error;
use scenariodb_core::remote::{ErrorResponse, codes};

/// Errors from the remote build client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// The base URL could not be parsed or joined.
    #[error("invalid remote build URL: {0}")]
    InvalidUrl(String),

    /// Request timeout.
    #[error("no answer after {0}ms")]
    Timeout(u64),

    /// Network error.
    #[error("network error: {0}")]
    Network(Arc<reqwest::Error>),

    /// The remote answered with a structured error body.
    #[error("remote refused the build ({status} {code}): {message}")]
    Refused { status: u16, code: String, message: String },

    /// HTTP error without a readable body.
    #[error("HTTP error: {status}")]
    HttpError { status: u16 },

    /// Response parse error.
    #[error("parse error: {0}")]
    Parse(String),
}

impl RemoteError {
    pub(crate) fn refused(status: u16, body: ErrorResponse) -> Self {
        RemoteError::Refused { status, code: body.code, message: body.error }
    }
}

impl From<RemoteError> for Error {
    /// Remote build failures keep their class: timeouts stay timeouts, a
    /// failed remote build stays `BuildFailed`, everything else is a sharing
    /// problem the builder may fall back from.
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Timeout(_) => Error::RemoteBuildTimeout(err.to_string()),
            RemoteError::Refused { ref code, ref message, .. } if code == codes::BUILD_FAILED => Error::BuildFailed {
                connection: String::new(),
                driver: String::new(),
                hashes: String::new(),
                reason: format!("remote: {message}"),
            },
            RemoteError::Refused { ref code, ref message, .. } if code == codes::HASHING_ERROR => {
                Error::HashingError { path: "remote".into(), reason: message.clone() }
            }
            other => Error::RemoteShare(other.to_string()),
        }
    }
}
