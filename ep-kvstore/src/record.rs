//! Batch/compaction/scan value types for the [`crate::KvStore`] trait.

use ep_types::{BySeqno, KeySpace, Key, QueuedItem, VBucketId};

/// One write queued into a [`WriteBatch`]. A Commit writes the new
/// committed-space value and removes the prepared-space entry in the same
/// batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put { space: KeySpace, key: Key, item: QueuedItem },
    Delete { space: KeySpace, key: Key },
}

/// A logically atomic set of writes for one vbucket, built by the Flusher
/// from a drained batch of `QueuedItem`s and committed in one call to
/// [`crate::KvStore::commit`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, space: KeySpace, key: Key, item: QueuedItem) {
        self.ops.push(WriteOp::Put { space, key, item });
    }

    pub fn delete(&mut self, space: KeySpace, key: Key) {
        self.ops.push(WriteOp::Delete { space, key });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// One record yielded by [`crate::KvStore::scan`].
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub space: KeySpace,
    pub key: Key,
    pub item: QueuedItem,
}

#[derive(Debug, Clone, Copy)]
pub struct SeqnoRange {
    pub start: BySeqno,
    pub end: BySeqno,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionConfig {
    /// Records with `committed_state == Pending` (outstanding Prepares,
    /// including SyncDeletes) are never expired regardless of their expiry
    /// field: a SyncDelete Prepare repurposes that field as a deletion
    /// timestamp, not a TTL. This flag exists so tests can assert the
    /// compactor actually checks committed-state and not merely "is the
    /// expiry field non-zero".
    pub purge_tombstones_older_than: Option<BySeqno>,
}

/// Callbacks invoked by [`crate::KvStore::compact`] for records it decides
/// to purge during compaction.
pub trait CompactionCallbacks {
    /// Called for a committed, non-pending item whose expiry has elapsed.
    fn on_expired(&mut self, vbid: VBucketId, key: &Key, item: &QueuedItem);
    /// Called for a key dropped because its collection was removed, or a
    /// purged tombstone.
    fn on_dropped_key(&mut self, vbid: VBucketId, key: &Key);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackResult {
    pub items_removed: usize,
    pub new_high_seqno: BySeqno,
}
