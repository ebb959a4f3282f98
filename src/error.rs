//! Error types for sak
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad args, unknown namespace or task)
//! - 4: Operation failed (log, index, lock or task body failure)

use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the sak CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Main error type for sak operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Storage not found: {0}")]
    StorageNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    // Operation failures (exit code 4)
    #[error("Metadata log unavailable: {0}")]
    TransientStore(String),

    #[error("Corrupt log record {fingerprint}: {reason}")]
    CorruptRecord { fingerprint: String, reason: String },

    #[error("Task {fingerprint} failed: {source}")]
    TaskFailed {
        fingerprint: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Task {fingerprint} failed: {source}; recording the failure also failed: {record}")]
    FailureNotRecorded {
        fingerprint: String,
        #[source]
        source: anyhow::Error,
        record: Box<Error>,
    },

    #[error("Index gap in namespace {namespace}: {missing} row(s) could not be restored")]
    ConsistencyGap { namespace: String, missing: usize },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Lock acquisition failed: {0}")]
    LockFailed(PathBuf),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl Error {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors
            Error::InvalidConfig(_)
            | Error::InvalidArgument(_)
            | Error::NamespaceNotFound(_)
            | Error::StorageNotFound(_)
            | Error::TaskNotFound(_) => exit_codes::USER_ERROR,

            // Operation failures
            Error::TransientStore(_)
            | Error::CorruptRecord { .. }
            | Error::TaskFailed { .. }
            | Error::FailureNotRecorded { .. }
            | Error::ConsistencyGap { .. }
            | Error::Git(_)
            | Error::Sql(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::LockFailed(_)
            | Error::OperationFailed(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Whether retrying after reconnecting may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientStore(_) => true,
            Error::Sql(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Structured details for JSON output, when the variant carries any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::CorruptRecord { fingerprint, reason } => Some(serde_json::json!({
                "fingerprint": fingerprint,
                "reason": reason,
            })),
            Error::TaskFailed { fingerprint, .. } => Some(serde_json::json!({
                "fingerprint": fingerprint,
            })),
            Error::FailureNotRecorded { fingerprint, record, .. } => Some(serde_json::json!({
                "fingerprint": fingerprint,
                "record_error": record.to_string(),
            })),
            Error::ConsistencyGap { namespace, missing } => Some(serde_json::json!({
                "namespace": namespace,
                "missing": missing,
            })),
            Error::LockFailed(path) => Some(serde_json::json!({
                "path": path.to_string_lossy(),
            })),
            _ => None,
        }
    }

    pub(crate) fn corrupt(fingerprint: &str, reason: impl Into<String>) -> Self {
        Error::CorruptRecord {
            fingerprint: fingerprint.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for sak operations
pub type Result<T> = std::result::Result<T, Error>;
