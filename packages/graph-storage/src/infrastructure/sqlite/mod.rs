//! SQLite adapter for the commit-record store.
//!
//! `rusqlite` is synchronous; every call hops to a blocking task via
//! `tokio::task::spawn_blocking` so the `SyncStore` trait stays async.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::domain::{CommitStatus, SCMCommitRecord, SyncStore};
use crate::error::StorageError;
use crate::Result;

pub struct SqliteSyncStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSyncStore {
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        Ok(store)
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scm_commits (
                commit_hash TEXT PRIMARY KEY,
                branch TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                author TEXT NOT NULL,
                changes TEXT NOT NULL,
                related_spec_id TEXT,
                test_results TEXT NOT NULL,
                validation_results TEXT,
                pr_url TEXT,
                provider TEXT,
                status TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )?;
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<SCMCommitRecord> {
        let changes: String = row.get("changes")?;
        let test_results: String = row.get("test_results")?;
        let metadata: String = row.get("metadata")?;
        let validation_results: Option<String> = row.get("validation_results")?;
        let status: String = row.get("status")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        let parse_dt = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now())
        };

        Ok(SCMCommitRecord {
            commit_hash: row.get("commit_hash")?,
            branch: row.get("branch")?,
            title: row.get("title")?,
            description: row.get("description")?,
            author: row.get("author")?,
            changes: serde_json::from_str(&changes).unwrap_or_default(),
            related_spec_id: row.get("related_spec_id")?,
            test_results: serde_json::from_str(&test_results).unwrap_or_default(),
            validation_results: validation_results
                .and_then(|v| serde_json::from_str(&v).ok()),
            pr_url: row.get("pr_url")?,
            provider: row.get("provider")?,
            status: match status.as_str() {
                "committed" => CommitStatus::Committed,
                "failed" => CommitStatus::Failed,
                _ => CommitStatus::Pending,
            },
            metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
            created_at: parse_dt(&created_at),
            updated_at: parse_dt(&updated_at),
        })
    }
}

#[async_trait]
impl SyncStore for SqliteSyncStore {
    async fn is_initialized(&self) -> bool {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='scm_commits'",
                [],
                |_| Ok(()),
            )
            .is_ok()
        })
        .await
        .unwrap_or(false)
    }

    async fn initialize(&self) -> Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            Self::create_schema(&conn)
        })
        .await
        .map_err(|e| StorageError::database(format!("join error: {e}")))?
    }

    async fn record_scm_commit(&self, record: &SCMCommitRecord) -> Result<()> {
        let conn = self.conn.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO scm_commits
                    (commit_hash, branch, title, description, author, changes,
                     related_spec_id, test_results, validation_results, pr_url,
                     provider, status, metadata, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
                 ON CONFLICT(commit_hash) DO UPDATE SET
                    branch=excluded.branch, title=excluded.title,
                    description=excluded.description, author=excluded.author,
                    changes=excluded.changes, related_spec_id=excluded.related_spec_id,
                    test_results=excluded.test_results,
                    validation_results=excluded.validation_results,
                    pr_url=excluded.pr_url, provider=excluded.provider,
                    status=excluded.status, metadata=excluded.metadata,
                    updated_at=excluded.updated_at",
                params![
                    record.commit_hash,
                    record.branch,
                    record.title,
                    record.description,
                    record.author,
                    serde_json::to_string(&record.changes).unwrap_or_default(),
                    record.related_spec_id,
                    serde_json::to_string(&record.test_results).unwrap_or_default(),
                    record
                        .validation_results
                        .as_ref()
                        .map(|v| v.to_string()),
                    record.pr_url,
                    record.provider,
                    record.status.as_str(),
                    record.metadata.to_string(),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .map_err(StorageError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::database(format!("join error: {e}")))?
    }

    async fn get_scm_commit_by_hash(&self, commit_hash: &str) -> Result<SCMCommitRecord> {
        let conn = self.conn.clone();
        let commit_hash = commit_hash.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT * FROM scm_commits WHERE commit_hash = ?1",
                params![commit_hash],
                Self::row_to_record,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StorageError::commit_not_found(commit_hash.clone())
                }
                other => StorageError::from(other),
            })
        })
        .await
        .map_err(|e| StorageError::database(format!("join error: {e}")))?
    }

    async fn list_scm_commits(&self, limit: usize) -> Result<Vec<SCMCommitRecord>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT * FROM scm_commits ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], Self::row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StorageError::from)?;
            Ok(rows)
        })
        .await
        .map_err(|e| StorageError::database(format!("join error: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let store = SqliteSyncStore::new_in_memory().unwrap();
        store.initialize().await.unwrap();
        assert!(store.is_initialized().await);

        let mut record = SCMCommitRecord::new("abc123", "main", "Fix bug", "alice");
        record.changes = vec!["src/a.ts".to_string()];
        store.record_scm_commit(&record).await.unwrap();

        let fetched = store.get_scm_commit_by_hash("abc123").await.unwrap();
        assert_eq!(fetched.title, "Fix bug");
        assert_eq!(fetched.changes, vec!["src/a.ts".to_string()]);
    }

    #[tokio::test]
    async fn test_sqlite_not_found() {
        let store = SqliteSyncStore::new_in_memory().unwrap();
        store.initialize().await.unwrap();
        let err = store.get_scm_commit_by_hash("missing").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::CommitNotFound);
    }

    #[tokio::test]
    async fn test_sqlite_list_limit() {
        let store = SqliteSyncStore::new_in_memory().unwrap();
        store.initialize().await.unwrap();
        for hash in ["c1", "c2", "c3"] {
            store
                .record_scm_commit(&SCMCommitRecord::new(hash, "main", "t", "a"))
                .await
                .unwrap();
        }
        assert_eq!(store.list_scm_commits(2).await.unwrap().len(), 2);
    }
}
