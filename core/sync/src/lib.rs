//! TwinSync Sync Engine
//!
//! This module reconciles a local store with a remote store, including:
//! - Watermark-driven incremental change selection in both directions
//! - Conflict detection and strategy-based resolution
//! - Grace-windowed deletion reconciliation over soft-deleted remote rows
//! - Relationship validation between records and contacts
//! - Retry strategy with exponential backoff
//! - Manual and periodic scheduling

pub mod clock;
pub mod collector;
pub mod config;
pub mod conflict;
pub mod deletion;
pub mod engine;
pub mod progress;
pub mod relationship;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod watermark;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use collector::{ChangeBatches, ChangeCollector, ChangeFetcher, RemoteRows};
pub use config::SyncConfig;
pub use conflict::{Conflict, ConflictDetector, ConflictResolver, ConflictStrategy, Resolution};
pub use deletion::{DeletionContext, DeletionPlan, DeletionReconciler, DeletionSide};
pub use engine::{SyncEngine, SyncResult};
pub use progress::{EngineStatus, NoProgress, ProgressSink};
pub use relationship::RelationshipValidator;
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use stats::{CollectionStats, OutcomeKind, SyncHistory, SyncOutcome, SyncStats};
pub use watermark::{
    initial_watermark, Direction, FileWatermarkStore, MemoryWatermarkStore, WatermarkStore,
    Watermarks,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _resolver = ConflictResolver::default();
        let _detector = ConflictDetector::default();
        let _history = SyncHistory::new(10);
        let _watermarks = Watermarks::default();
    }
}
