//! Error types for the sync engine core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for coordinator/conflict/rollback/checkpoint/scm
/// operations. This is the `?`-propagated error; per-item failures that a
/// caller should inspect rather than abort on are represented by
/// [`SyncError`] instead.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("operation not found: {0}")]
    OperationNotFound(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("rollback point not found: {0}")]
    RollbackPointNotFound(String),

    #[error("store not initialized")]
    StoreNotInitialized,

    #[error("no rollback point configured for operation {0}")]
    NoRollbackPoint(String),

    #[error("rollback capabilities not configured")]
    RollbackCapabilitiesNotConfigured,

    #[error("invalid resolution strategy: {0}")]
    InvalidResolutionStrategy(String),

    #[error("no resolved value provided for conflict {0}")]
    NoResolvedValue(String),

    #[error("operation cancelled: {0}")]
    OperationCancelled(String),

    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("SCM provider not configured")]
    ScmProviderNotConfigured,

    #[error("git command failed: git {args}\n{stderr}\n{stdout}\n{message}")]
    GitCommandFailed {
        args: String,
        stdout: String,
        stderr: String,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("checkpoint enqueue failed: {0}")]
    CheckpointEnqueueFailed(String),

    #[error("storage error: {0}")]
    Storage(#[from] graph_storage::StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn serialization(message: impl Into<String>) -> Self {
        OrchestratorError::Serialization(message.into())
    }
}

/// Recoverability/retry classification for a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(ErrorCategory::Transient),
            "permanent" => Some(ErrorCategory::Permanent),
            "infrastructure" => Some(ErrorCategory::Infrastructure),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The error taxonomy tag carried on a [`SyncError`] (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    Parse,
    Database,
    Conflict,
    Rollback,
    Cancelled,
    Capability,
    /// Not part of §7's core taxonomy; emitted specifically on the
    /// `session_checkpoint` manual_intervention event (spec S4).
    Checkpoint,
    Unknown,
}

impl SyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorKind::Parse => "parse",
            SyncErrorKind::Database => "database",
            SyncErrorKind::Conflict => "conflict",
            SyncErrorKind::Rollback => "rollback",
            SyncErrorKind::Cancelled => "cancelled",
            SyncErrorKind::Capability => "capability",
            SyncErrorKind::Checkpoint => "checkpoint",
            SyncErrorKind::Unknown => "unknown",
        }
    }
}

/// A per-item failure collected onto `SyncOperation.errors`. Never
/// `?`-propagated — the coordinator appends these and decides
/// recoverability/finalization from the collected set (spec §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncError {
    pub file: Option<String>,
    #[serde(rename = "type")]
    pub kind: SyncErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
}

impl SyncError {
    pub fn new(kind: SyncErrorKind, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            file: None,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            recoverable,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Database, message, true)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Parse, message, true)
    }

    pub fn rollback(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Rollback, message, false)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Cancelled, message, true)
    }

    pub fn capability(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Capability, message, false)
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Checkpoint, message, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_round_trip() {
        for cat in [
            ErrorCategory::Transient,
            ErrorCategory::Permanent,
            ErrorCategory::Infrastructure,
        ] {
            let s = cat.as_str();
            assert_eq!(ErrorCategory::from_str(s), Some(cat));
        }
    }

    #[test]
    fn test_error_category_unknown() {
        assert_eq!(ErrorCategory::from_str("bogus"), None);
    }

    #[test]
    fn test_sync_error_database_is_recoverable() {
        let err = SyncError::database("bulk create failed");
        assert!(err.recoverable);
        assert_eq!(err.kind.as_str(), "database");
    }

    #[test]
    fn test_sync_error_rollback_is_not_recoverable() {
        let err = SyncError::rollback("reversal failed");
        assert!(!err.recoverable);
    }

    #[test]
    fn test_sync_error_with_file() {
        let err = SyncError::parse("unexpected token").with_file("src/a.ts");
        assert_eq!(err.file.as_deref(), Some("src/a.ts"));
    }
}
