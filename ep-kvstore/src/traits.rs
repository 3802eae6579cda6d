//! The narrow KVStore facade. Everything the core needs from durable storage
//! goes through this trait; the wire protocol, replication, and the storage
//! engine's own internals live outside it.

use ep_types::{BySeqno, Key, KeySpace, QueuedItem, VBucketId, VBucketStateRecord};

use crate::error::StorageResult;
use crate::record::{CompactionCallbacks, CompactionConfig, RollbackResult, ScanEntry, SeqnoRange, WriteBatch};

pub trait KvStore: Send + Sync {
    fn put(&self, vbid: VBucketId, space: KeySpace, key: &Key, item: &QueuedItem) -> StorageResult<()>;

    fn get(&self, vbid: VBucketId, space: KeySpace, key: &Key) -> StorageResult<Option<QueuedItem>>;

    fn delete(&self, vbid: VBucketId, space: KeySpace, key: &Key) -> StorageResult<()>;

    /// Writes `batch` and `vbstate` atomically: either every op and the
    /// state record land together, or none do.
    fn commit(&self, vbid: VBucketId, batch: WriteBatch, vbstate: &VBucketStateRecord) -> StorageResult<()>;

    fn compact(
        &self,
        vbid: VBucketId,
        config: &CompactionConfig,
        callbacks: &mut dyn CompactionCallbacks,
    ) -> StorageResult<()>;

    fn scan(&self, vbid: VBucketId, range: SeqnoRange) -> StorageResult<Vec<ScanEntry>>;

    fn rollback(&self, vbid: VBucketId, target_seqno: BySeqno) -> StorageResult<RollbackResult>;

    fn load_vbucket_state(&self, vbid: VBucketId) -> StorageResult<Option<VBucketStateRecord>>;
}
