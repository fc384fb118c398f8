//! Unified error types for scenariodb.
//!
//! The display strings carry a stable code prefix so test output can be
//! grepped for the failure class.

use tokio_rusqlite::rusqlite;

use crate::config::ConfigError;

/// Unified error types for database provisioning.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A hash-path could not be read. Aborts the whole run.
    #[error("HASHING_ERROR: {path}: {reason}")]
    HashingError { path: String, reason: String },

    /// Migrations, seeders or an import failed while building a database.
    #[error("BUILD_FAILED: connection \"{connection}\" ({driver}) [{hashes}]: {reason}")]
    BuildFailed { connection: String, driver: String, hashes: String, reason: String },

    /// The schema applier (migrations or seeders) failed.
    #[error("APPLIER_FAILED: {0}")]
    Applier(String),

    /// Snapshot import or export failed.
    #[error("SNAPSHOT_IO: {0}")]
    SnapshotIo(String),

    /// The remote build did not answer in time.
    #[error("REMOTE_BUILD_TIMEOUT: {0}")]
    RemoteBuildTimeout(String),

    /// The remote build answered with something unusable (version mismatch, bad payload).
    #[error("REMOTE_SHARE: {0}")]
    RemoteShare(String),

    /// SQLite operation failed.
    #[error("DATABASE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Query against a network database engine failed.
    #[error("DATABASE_ERROR: {0}")]
    Sql(String),

    /// Configuration could not be loaded or is invalid.
    #[error("CONFIG_ERROR: {0}")]
    Config(#[from] ConfigError),

    /// An operation was called in the wrong builder state.
    #[error("INVALID_STATE: {0}")]
    InvalidState(String),

    /// Filesystem operation failed.
    #[error("IO_ERROR: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a local build may be attempted after this remote failure.
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, Error::RemoteBuildTimeout(_) | Error::RemoteShare(_))
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        Error::Sql(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::HashingError { path: "database/migrations".into(), reason: "not found".into() };
        assert!(err.to_string().contains("HASHING_ERROR"));
        assert!(err.to_string().contains("database/migrations"));
    }

    #[test]
    fn test_build_failed_carries_context() {
        let err = Error::BuildFailed {
            connection: "main".into(),
            driver: "pgsql".into(),
            hashes: "build=aa snapshot=bb scenario=cc".into(),
            reason: "migration 003 failed".into(),
        };
        let text = err.to_string();
        assert!(text.starts_with("BUILD_FAILED"));
        assert!(text.contains("\"main\""));
        assert!(text.contains("pgsql"));
        assert!(text.contains("scenario=cc"));
    }

    #[test]
    fn test_remote_failure_classification() {
        assert!(Error::RemoteBuildTimeout("x".into()).is_remote_failure());
        assert!(Error::RemoteShare("x".into()).is_remote_failure());
        assert!(!Error::SnapshotIo("x".into()).is_remote_failure());
    }
}
