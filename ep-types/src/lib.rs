//! Shared data model for the durable write pipeline: keys, queued items,
//! durability requirements, checkpoint value types, vbucket state, and the
//! error taxonomy. No behavior lives here -- that's `ep-core`.

pub mod cas;
pub mod checkpoint;
pub mod durability;
pub mod error;
pub mod item;
pub mod key;
pub mod vbucket;

pub use cas::{Cas, HlcClock};
pub use checkpoint::{CheckpointId, CheckpointState, CheckpointType, SnapshotRange};
pub use durability::{DurabilityLevel, DurabilityRequirements, DurabilityTimeout, NodeId, Topology};
pub use error::{EpError, EpResult};
pub use item::{BySeqno, CommittedState, Datatype, OperationType, QueuedItem, RevSeqno};
pub use key::{CollectionId, Key, KeySpace};
pub use vbucket::{FailoverEntry, VBucketId, VBucketStateName, VBucketStateRecord};
