//! Commit-record storage for the sync engine's SCM flow (C6).
//!
//! # Core Principles
//!
//! 1. **Scope**: this crate persists `SCMCommitRecord`s only — the external
//!    "database service" referenced by the SCM flow. It does not persist
//!    the knowledge graph itself; that store is a separate external
//!    collaborator the orchestration crate consumes through its own trait.
//! 2. **Identity**: `commit_hash` is the natural key.
//! 3. **Backends**: an always-available in-memory adapter, and a SQLite
//!    adapter behind the `sqlite` feature (default).
//!
//! # Usage
//!
//! ```rust
//! use graph_storage::{SyncStore, SCMCommitRecord, InMemorySyncStore};
//!
//! # async fn example() -> Result<(), graph_storage::StorageError> {
//! let store = InMemorySyncStore::new();
//! store.initialize().await?;
//!
//! let record = SCMCommitRecord::new("abc123", "main", "Fix bug", "alice");
//! store.record_scm_commit(&record).await?;
//!
//! let fetched = store.get_scm_commit_by_hash("abc123").await?;
//! assert_eq!(fetched.title, "Fix bug");
//! # Ok(())
//! # }
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{Result, StorageError};

pub use domain::{ChangedFile, CommitStatus, SCMCommitRecord, SyncStore};
pub use infrastructure::InMemorySyncStore;

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteSyncStore;
