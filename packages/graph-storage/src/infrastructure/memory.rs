//! In-memory `SyncStore` adapter.
//!
//! Always available (no feature flag). Used by orchestration's tests and
//! as a drop-in store when no database is configured.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::{SCMCommitRecord, SyncStore};
use crate::error::StorageError;
use crate::Result;

#[derive(Default)]
pub struct InMemorySyncStore {
    commits: Mutex<Vec<SCMCommitRecord>>,
}

impl InMemorySyncStore {
    pub fn new() -> Self {
        Self {
            commits: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SyncStore for InMemorySyncStore {
    async fn is_initialized(&self) -> bool {
        true
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn record_scm_commit(&self, record: &SCMCommitRecord) -> Result<()> {
        let mut commits = self
            .commits
            .lock()
            .map_err(|_| StorageError::database("commit store lock poisoned"))?;
        if let Some(existing) = commits
            .iter_mut()
            .find(|c| c.commit_hash == record.commit_hash)
        {
            *existing = record.clone();
        } else {
            commits.push(record.clone());
        }
        Ok(())
    }

    async fn get_scm_commit_by_hash(&self, commit_hash: &str) -> Result<SCMCommitRecord> {
        let commits = self
            .commits
            .lock()
            .map_err(|_| StorageError::database("commit store lock poisoned"))?;
        commits
            .iter()
            .find(|c| c.commit_hash == commit_hash)
            .cloned()
            .ok_or_else(|| StorageError::commit_not_found(commit_hash))
    }

    async fn list_scm_commits(&self, limit: usize) -> Result<Vec<SCMCommitRecord>> {
        let commits = self
            .commits
            .lock()
            .map_err(|_| StorageError::database("commit store lock poisoned"))?;
        let mut sorted: Vec<SCMCommitRecord> = commits.clone();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sorted.truncate(limit);
        Ok(sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_get() {
        let store = InMemorySyncStore::new();
        let record = SCMCommitRecord::new("abc123", "main", "Fix bug", "alice");
        store.record_scm_commit(&record).await.unwrap();

        let fetched = store.get_scm_commit_by_hash("abc123").await.unwrap();
        assert_eq!(fetched.title, "Fix bug");
    }

    #[tokio::test]
    async fn test_get_missing_returns_not_found() {
        let store = InMemorySyncStore::new();
        let err = store.get_scm_commit_by_hash("missing").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::CommitNotFound);
    }

    #[tokio::test]
    async fn test_record_overwrites_existing() {
        let store = InMemorySyncStore::new();
        let mut record = SCMCommitRecord::new("abc123", "main", "Fix bug", "alice");
        store.record_scm_commit(&record).await.unwrap();
        record.title = "Fix bug, take two".to_string();
        store.record_scm_commit(&record).await.unwrap();

        let fetched = store.get_scm_commit_by_hash("abc123").await.unwrap();
        assert_eq!(fetched.title, "Fix bug, take two");
        assert_eq!(store.list_scm_commits(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_orders_newest_first_and_respects_limit() {
        let store = InMemorySyncStore::new();
        for hash in ["c1", "c2", "c3"] {
            store
                .record_scm_commit(&SCMCommitRecord::new(hash, "main", "t", "a"))
                .await
                .unwrap();
        }
        let listed = store.list_scm_commits(2).await.unwrap();
        assert_eq!(listed.len(), 2);
    }
}
