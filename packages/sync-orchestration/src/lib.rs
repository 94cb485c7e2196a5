/*
 * Sync Orchestration - source-control-aware knowledge-graph synchronization
 *
 * Owns conflict resolution, rollback/checkpoint history, the sync
 * coordinator's queue/lifecycle, session event sequencing, and the SCM
 * commit-recording layer. The knowledge graph, source parser, embedding
 * service, and checkpoint job execution are consumed as trait objects;
 * this crate implements none of them.
 */

// Public modules
pub mod canonical;
pub mod checkpoint;
pub mod conflict;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod kg;
pub mod rollback;
pub mod scm;
pub mod session;

// Re-exports
pub use checkpoint::{
    CheckpointJobEvent, CheckpointJobRequest, CheckpointJobRunner, CheckpointMetricsSnapshot,
    DeadLetterEntry, InMemoryCheckpointJobRunner,
};
pub use config::{ScmServiceConfig, SyncCoordinatorConfig, Tuning};
pub use conflict::{Conflict, ConflictResolver, ConflictType, MergeStrategy, Resolution};
pub use coordinator::{
    CommitMetadata, ConflictResolutionMode, CoordinatorEvent, FileChange, FileChangeType,
    FileParser, ModuleIndexer, OperationCounters, OperationStatistics, OperationStatus,
    OperationType, ParseResult, PartialUpdate, RelationshipResolution, SyncCoordinator,
    SyncOperation, SyncOptions,
};
pub use error::{ErrorCategory, OrchestratorError, Result, SyncError, SyncErrorKind};
pub use kg::{Entity, KnowledgeGraph, Relationship};
pub use rollback::{RollbackEngine, RollbackMode, RollbackPoint, RollbackResult};
pub use scm::{CreateCommitRequest, GitService, LocalGitProvider, SCMService, ScmProvider};
pub use session::{SessionEvent, SessionSequenceAnomaly, SessionStream};

#[cfg(test)]
mod tests {
    #[test]
    fn it_works() {
        assert_eq!(2 + 2, 4);
    }
}
