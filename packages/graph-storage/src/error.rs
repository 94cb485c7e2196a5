//! Error types for graph-storage

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Database errors (SQLite, etc)
    Database,
    /// Serialization/deserialization errors
    Serialization,
    /// Commit record not found
    CommitNotFound,
    /// Transaction errors
    Transaction,
    /// Configuration errors
    Config,
    /// I/O errors
    IO,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::CommitNotFound => "commit_not_found",
            ErrorKind::Transaction => "transaction",
            ErrorKind::Config => "config",
            ErrorKind::IO => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn commit_not_found(commit_hash: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::CommitNotFound,
            format!("Commit record not found: {}", commit_hash.into()),
        )
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transaction, message)
    }
}

// SQLite error conversions
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::database(format!("SQLite error: {}", err)).with_source(err)
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_display() {
        let err = StorageError::commit_not_found("abc123def");
        let msg = format!("{}", err);
        assert!(msg.contains("commit_not_found"));
        assert!(msg.contains("abc123def"));
    }

    #[test]
    fn test_database_error() {
        let err = StorageError::database("Connection failed");
        assert_eq!(err.kind, ErrorKind::Database);
        assert_eq!(err.message, "Connection failed");
        assert!(err.source.is_none());

        let msg = format!("{}", err);
        assert_eq!(msg, "[database] Connection failed");
    }

    #[test]
    fn test_serialization_error() {
        let err = StorageError::serialization("Invalid JSON");
        assert_eq!(err.kind, ErrorKind::Serialization);
        assert_eq!(err.message, "Invalid JSON");

        let msg = format!("{}", err);
        assert_eq!(msg, "[serialization] Invalid JSON");
    }

    #[test]
    fn test_commit_not_found() {
        let err = StorageError::commit_not_found("abc123def");
        assert_eq!(err.kind, ErrorKind::CommitNotFound);
        assert!(err.message.contains("abc123def"));
    }

    #[test]
    fn test_transaction_error() {
        let err = StorageError::transaction("ROLLBACK failed");
        assert_eq!(err.kind, ErrorKind::Transaction);
        assert_eq!(err.message, "ROLLBACK failed");
    }

    #[test]
    fn test_with_source() {
        use std::io;

        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = StorageError::database("DB file missing").with_source(io_err);

        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.source.is_some());

        let source = err.source().unwrap();
        assert!(source.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_kind_as_str() {
        assert_eq!(ErrorKind::Database.as_str(), "database");
        assert_eq!(ErrorKind::Serialization.as_str(), "serialization");
        assert_eq!(ErrorKind::CommitNotFound.as_str(), "commit_not_found");
        assert_eq!(ErrorKind::Transaction.as_str(), "transaction");
        assert_eq!(ErrorKind::Config.as_str(), "config");
        assert_eq!(ErrorKind::IO.as_str(), "io");
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_from_rusqlite_error() {
        use rusqlite::Error as SqliteError;

        let sqlite_err = SqliteError::QueryReturnedNoRows;
        let err: StorageError = sqlite_err.into();

        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.message.contains("SQLite error"));
        assert!(err.source.is_some());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json")
            .err()
            .unwrap();
        let err: StorageError = json_err.into();

        assert_eq!(err.kind, ErrorKind::Serialization);
        assert!(err.message.contains("JSON error"));
    }

    #[test]
    fn test_result_propagation() {
        fn inner() -> Result<()> {
            Err(StorageError::commit_not_found("test"))
        }

        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }

        let result = outer();
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, ErrorKind::CommitNotFound);
    }
}
