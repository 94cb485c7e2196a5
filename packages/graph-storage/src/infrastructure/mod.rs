//! Infrastructure layer - SyncStore adapters

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemorySyncStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSyncStore;
