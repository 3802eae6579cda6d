//! An in-memory `KvStore` fixture so tests get a real `Bucket`/`VBucket`
//! without a RocksDB dependency. Modeled on the reference workspace's own
//! in-memory `Map` test double (`typed-store::test_db::TestDB`): a
//! `BTreeMap` guarded by a lock, no partial-failure injection.

use std::collections::BTreeMap;

use ep_types::{BySeqno, Key, KeySpace, QueuedItem, VBucketId, VBucketStateRecord};
use parking_lot::RwLock;

use crate::disk_key::{seqno_index_key, seqno_index_prefix, DiskKey};
use crate::error::StorageResult;
use crate::record::{
    CompactionCallbacks, CompactionConfig, RollbackResult, ScanEntry, SeqnoRange, WriteBatch, WriteOp,
};
use crate::traits::KvStore;

#[derive(Default)]
struct Inner {
    records: BTreeMap<Vec<u8>, (KeySpace, Key, QueuedItem)>,
    by_seqno: BTreeMap<Vec<u8>, Vec<u8>>, // seqno index key -> disk key
    vbstates: BTreeMap<VBucketId, VBucketStateRecord>,
}

pub struct MemoryKvStore {
    inner: RwLock<Inner>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner::default()) }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn put(&self, vbid: VBucketId, space: KeySpace, key: &Key, item: &QueuedItem) -> StorageResult<()> {
        let disk_key = DiskKey::encode(vbid, space, key).into_bytes();
        let mut inner = self.inner.write();
        inner
            .by_seqno
            .insert(seqno_index_key(vbid, item.by_seqno), disk_key.clone());
        inner.records.insert(disk_key, (space, key.clone(), item.clone()));
        Ok(())
    }

    fn get(&self, vbid: VBucketId, space: KeySpace, key: &Key) -> StorageResult<Option<QueuedItem>> {
        let disk_key = DiskKey::encode(vbid, space, key).into_bytes();
        Ok(self.inner.read().records.get(&disk_key).map(|(_, _, item)| item.clone()))
    }

    fn delete(&self, vbid: VBucketId, space: KeySpace, key: &Key) -> StorageResult<()> {
        let disk_key = DiskKey::encode(vbid, space, key).into_bytes();
        let mut inner = self.inner.write();
        if let Some((_, _, item)) = inner.records.remove(&disk_key) {
            inner.by_seqno.remove(&seqno_index_key(vbid, item.by_seqno));
        }
        Ok(())
    }

    fn commit(&self, vbid: VBucketId, batch: WriteBatch, vbstate: &VBucketStateRecord) -> StorageResult<()> {
        let mut inner = self.inner.write();
        for op in batch.ops {
            match op {
                WriteOp::Put { space, key, item } => {
                    let disk_key = DiskKey::encode(vbid, space, &key).into_bytes();
                    inner
                        .by_seqno
                        .insert(seqno_index_key(vbid, item.by_seqno), disk_key.clone());
                    inner.records.insert(disk_key, (space, key, item));
                }
                WriteOp::Delete { space, key } => {
                    let disk_key = DiskKey::encode(vbid, space, &key).into_bytes();
                    if let Some((_, _, item)) = inner.records.remove(&disk_key) {
                        inner.by_seqno.remove(&seqno_index_key(vbid, item.by_seqno));
                    }
                }
            }
        }
        inner.vbstates.insert(vbid, vbstate.clone());
        Ok(())
    }

    fn compact(
        &self,
        vbid: VBucketId,
        config: &CompactionConfig,
        callbacks: &mut dyn CompactionCallbacks,
    ) -> StorageResult<()> {
        use ep_types::CommittedState;

        let mut inner = self.inner.write();
        let prefix = DiskKey::vbucket_prefix(vbid);
        let to_purge: Vec<(Vec<u8>, Key, QueuedItem)> = inner
            .records
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, (_, key, item))| {
                // Never treat a Prepare's (possibly SyncDelete-repurposed)
                // expiry field as expiry.
                if item.committed_state == CommittedState::Pending {
                    return None;
                }
                let expired = item.expiry != 0
                    && config
                        .purge_tombstones_older_than
                        .map(|floor| item.by_seqno <= floor)
                        .unwrap_or(true);
                if expired {
                    Some((k.clone(), key.clone(), item.clone()))
                } else {
                    None
                }
            })
            .collect();

        for (disk_key, key, item) in to_purge {
            inner.records.remove(&disk_key);
            inner.by_seqno.remove(&seqno_index_key(vbid, item.by_seqno));
            callbacks.on_expired(vbid, &key, &item);
        }
        Ok(())
    }

    fn scan(&self, vbid: VBucketId, range: SeqnoRange) -> StorageResult<Vec<ScanEntry>> {
        let inner = self.inner.read();
        let lo = seqno_index_key(vbid, range.start);
        let hi = seqno_index_key(vbid, range.end);
        let mut out = Vec::new();
        for (_, disk_key) in inner.by_seqno.range(lo..=hi) {
            if let Some((space, key, item)) = inner.records.get(disk_key) {
                out.push(ScanEntry { space: *space, key: key.clone(), item: item.clone() });
            }
        }
        Ok(out)
    }

    fn rollback(&self, vbid: VBucketId, target_seqno: BySeqno) -> StorageResult<RollbackResult> {
        let mut inner = self.inner.write();
        let prefix = seqno_index_prefix(vbid);
        let cutoff = seqno_index_key(vbid, target_seqno + 1);
        let upper = {
            let mut v = prefix.clone();
            v.extend(std::iter::repeat(0xFFu8).take(8));
            v
        };
        let stale: Vec<(Vec<u8>, Vec<u8>)> = inner
            .by_seqno
            .range(cutoff..=upper)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut removed = 0usize;
        for (seqno_key, disk_key) in &stale {
            inner.by_seqno.remove(seqno_key);
            if inner.records.remove(disk_key).is_some() {
                removed += 1;
            }
        }
        let new_high = inner
            .by_seqno
            .range(prefix..=seqno_index_key(vbid, target_seqno))
            .next_back()
            .map(|(k, _)| u64::from_be_bytes(k[2..10].try_into().unwrap()))
            .unwrap_or(0);
        Ok(RollbackResult { items_removed: removed, new_high_seqno: new_high })
    }

    fn load_vbucket_state(&self, vbid: VBucketId) -> StorageResult<Option<VBucketStateRecord>> {
        Ok(self.inner.read().vbstates.get(&vbid).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ep_types::{CommittedState, Datatype, OperationType, VBucketStateName};

    fn item(seqno: BySeqno, expiry: u32, state: CommittedState) -> QueuedItem {
        QueuedItem {
            key: Key::from_bytes(b"k".to_vec()),
            value: b"v".to_vec(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry,
            cas: 1,
            by_seqno: seqno,
            rev_seqno: 1,
            operation: OperationType::Mutation,
            committed_state: state,
            durability: None,
            sync_delete: false,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = MemoryKvStore::new();
        let key = Key::from_bytes(b"k".to_vec());
        let it = item(1, 0, CommittedState::CommittedViaMutation);
        store.put(0, KeySpace::Committed, &key, &it).unwrap();
        let got = store.get(0, KeySpace::Committed, &key).unwrap().unwrap();
        assert_eq!(got.by_seqno, 1);
        assert!(store.get(0, KeySpace::Prepared, &key).unwrap().is_none());
    }

    #[test]
    fn commit_writes_batch_and_vbstate_atomically() {
        let store = MemoryKvStore::new();
        let key = Key::from_bytes(b"k".to_vec());
        let mut batch = WriteBatch::new();
        batch.put(KeySpace::Committed, key.clone(), item(1, 0, CommittedState::CommittedViaMutation));
        let mut vbstate = VBucketStateRecord::new_empty(VBucketStateName::Active);
        vbstate.high_seqno = 1;
        store.commit(0, batch, &vbstate).unwrap();

        assert!(store.get(0, KeySpace::Committed, &key).unwrap().is_some());
        assert_eq!(store.load_vbucket_state(0).unwrap().unwrap().high_seqno, 1);
    }

    #[test]
    fn scan_returns_items_in_seqno_order() {
        let store = MemoryKvStore::new();
        for i in 1..=3u64 {
            let key = Key::from_bytes(format!("k{i}").into_bytes());
            store
                .put(0, KeySpace::Committed, &key, &item(i, 0, CommittedState::CommittedViaMutation))
                .unwrap();
        }
        let entries = store.scan(0, SeqnoRange { start: 1, end: 3 }).unwrap();
        let seqnos: Vec<_> = entries.iter().map(|e| e.item.by_seqno).collect();
        assert_eq!(seqnos, vec![1, 2, 3]);
    }

    #[test]
    fn rollback_removes_everything_above_target() {
        let store = MemoryKvStore::new();
        for i in 1..=5u64 {
            let key = Key::from_bytes(format!("k{i}").into_bytes());
            store
                .put(0, KeySpace::Committed, &key, &item(i, 0, CommittedState::CommittedViaMutation))
                .unwrap();
        }
        let result = store.rollback(0, 2).unwrap();
        assert_eq!(result.items_removed, 3);
        assert_eq!(result.new_high_seqno, 2);
        let remaining = store.scan(0, SeqnoRange { start: 0, end: 10 }).unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn compact_skips_pending_prepares_even_with_expiry_set() {
        struct Recorder(Vec<Key>);
        impl CompactionCallbacks for Recorder {
            fn on_expired(&mut self, _vbid: VBucketId, key: &Key, _item: &QueuedItem) {
                self.0.push(key.clone());
            }
            fn on_dropped_key(&mut self, _vbid: VBucketId, _key: &Key) {}
        }

        let store = MemoryKvStore::new();
        let pending_key = Key::from_bytes(b"pending".to_vec());
        let mut pending_item = item(1, 1, CommittedState::Pending);
        pending_item.operation = OperationType::PendingSyncWrite;
        store.put(0, KeySpace::Prepared, &pending_key, &pending_item).unwrap();

        let expired_key = Key::from_bytes(b"expired".to_vec());
        store
            .put(0, KeySpace::Committed, &expired_key, &item(2, 1, CommittedState::CommittedViaMutation))
            .unwrap();

        let mut recorder = Recorder(Vec::new());
        store.compact(0, &CompactionConfig::default(), &mut recorder).unwrap();

        assert_eq!(recorder.0, vec![expired_key.clone()]);
        assert!(store.get(0, KeySpace::Prepared, &pending_key).unwrap().is_some());
        assert!(store.get(0, KeySpace::Committed, &expired_key).unwrap().is_none());
    }
}
