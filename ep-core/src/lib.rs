//! The durable write pipeline: per-vBucket hash table, CheckpointManager,
//! DurabilityMonitor, Flusher and the background reclamation/expiry tasks
//! that keep a bucket within its memory and durability budgets.

pub mod checkpoint;
pub mod checkpoint_manager;
pub mod config;
pub mod context;
pub mod durability;
pub mod expiry;
pub mod flusher;
pub mod reclamation;
pub mod stats;
pub mod vbucket;

pub use checkpoint::{Checkpoint, Cursor, CursorKind, CursorName, CursorPosition};
pub use checkpoint_manager::{CheckpointManager, CheckpointManagerConfig, PeekedBatch, QueueResult, PERSISTENCE_CURSOR};
pub use config::{BucketConfig, ReclamationMode};
pub use context::RuntimeContext;
pub use durability::{
    ActiveDurabilityMonitor, DurabilityMonitor, DurabilityTimeoutTask, MigratedPrepare, PassiveDurabilityMonitor,
    Resolution,
};
pub use expiry::ExpiryPager;
pub use flusher::Flusher;
pub use reclamation::{CheckpointDestroyer, CheckpointRemover};
pub use stats::{CheckpointManagerStats, VBucketStats};
pub use vbucket::{Applied, BucketType, MutationKind, MutationRequest, VBucket, WriteOutcome};
