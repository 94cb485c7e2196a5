//! Domain layer for the SCM commit record store.
//!
//! # Core Principles
//!
//! 1. **Immutability**: once a commit record is written it is never mutated
//!    except through `update_status`, which is the only supported transition
//!    (`pending` -> `committed` / `failed`).
//! 2. **Identity**: `commit_hash` is the natural key. Records are looked up
//!    by hash, not by a surrogate id.
//! 3. **Scope**: this crate persists `SCMCommitRecord`s only. It does not
//!    persist the knowledge graph itself — that store is an external
//!    collaborator the orchestration crate consumes through a trait it
//!    defines, not one this crate implements.
//!
//! # Domain Models
//!
//! - `SCMCommitRecord`: one row per commit the SCM flow produced.
//!
//! # Port Trait
//!
//! - `SyncStore`: commit-record persistence abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Status of a recorded commit, mirroring the outcome of the SCM flow (C6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Committed,
    Pending,
    Failed,
}

impl CommitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStatus::Committed => "committed",
            CommitStatus::Pending => "pending",
            CommitStatus::Failed => "failed",
        }
    }
}

/// A single file changed by a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
}

/// Record of one commit produced by the SCM flow (C6).
///
/// # Examples
///
/// ```rust
/// use graph_storage::domain::SCMCommitRecord;
///
/// let record = SCMCommitRecord::new("abc123", "main", "Fix bug", "alice");
/// assert_eq!(record.commit_hash, "abc123");
/// assert_eq!(record.status.as_str(), "pending");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SCMCommitRecord {
    pub commit_hash: String,
    pub branch: String,
    pub title: String,
    pub description: Option<String>,
    pub author: String,
    #[serde(default)]
    pub changes: Vec<String>,
    pub related_spec_id: Option<String>,
    #[serde(default)]
    pub test_results: Vec<serde_json::Value>,
    pub validation_results: Option<serde_json::Value>,
    pub pr_url: Option<String>,
    pub provider: Option<String>,
    pub status: CommitStatus,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SCMCommitRecord {
    pub fn new(
        commit_hash: impl Into<String>,
        branch: impl Into<String>,
        title: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            commit_hash: commit_hash.into(),
            branch: branch.into(),
            title: title.into(),
            description: None,
            author: author.into(),
            changes: Vec::new(),
            related_spec_id: None,
            test_results: Vec::new(),
            validation_results: None,
            pr_url: None,
            provider: None,
            status: CommitStatus::Pending,
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Commit-record storage abstraction consumed by the SCM flow (C6).
///
/// This is the "Database service" referenced in the external interfaces:
/// `recordSCMCommit`, `getSCMCommitByHash`, `listSCMCommits`.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Returns whether the backing store has been initialized (schema
    /// created, connection pool warmed, etc).
    async fn is_initialized(&self) -> bool;

    /// Idempotently prepares the backing store for use.
    async fn initialize(&self) -> Result<()>;

    /// Persists a commit record. Overwrites any existing record with the
    /// same `commit_hash`.
    async fn record_scm_commit(&self, record: &SCMCommitRecord) -> Result<()>;

    /// Looks up a commit record by hash.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::CommitNotFound` if no record matches.
    async fn get_scm_commit_by_hash(&self, commit_hash: &str) -> Result<SCMCommitRecord>;

    /// Lists the most recently created commit records, newest first.
    async fn list_scm_commits(&self, limit: usize) -> Result<Vec<SCMCommitRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_record_new() {
        let record = SCMCommitRecord::new("abc123", "main", "Fix bug", "alice");
        assert_eq!(record.commit_hash, "abc123");
        assert_eq!(record.branch, "main");
        assert_eq!(record.title, "Fix bug");
        assert_eq!(record.author, "alice");
        assert_eq!(record.status, CommitStatus::Pending);
        assert!(record.changes.is_empty());
    }

    #[test]
    fn test_commit_record_serde() {
        let record = SCMCommitRecord::new("abc123", "main", "Fix bug", "alice");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("abc123"));
        let deserialized: SCMCommitRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.commit_hash, record.commit_hash);
        assert_eq!(deserialized.status, record.status);
    }

    #[test]
    fn test_commit_status_as_str() {
        assert_eq!(CommitStatus::Committed.as_str(), "committed");
        assert_eq!(CommitStatus::Pending.as_str(), "pending");
        assert_eq!(CommitStatus::Failed.as_str(), "failed");
    }
}
