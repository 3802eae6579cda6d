//! RocksDB-backed [`KvStore`], the production storage engine. Three column
//! families do the work of the three tables the trait implies:
//! `records` (disk key -> bincode `QueuedItem`), `by_seqno` (per-vbucket
//! seqno index -> disk key, for ordered scan/rollback/compaction) and
//! `vbstate` (vbid -> bincode `VBucketStateRecord`). Modeled on
//! `typed-store`'s column-family-per-table convention and its use of
//! `WriteBatch` for atomic multi-CF commits.

use std::path::Path;
use std::sync::Arc;

use ep_types::{BySeqno, CommittedState, Key, KeySpace, QueuedItem, VBucketId, VBucketStateRecord};
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch as RocksWriteBatch, DB};

use crate::disk_key::{seqno_index_key, seqno_index_prefix, DiskKey};
use crate::error::{StorageError, StorageResult};
use crate::record::{
    CompactionCallbacks, CompactionConfig, RollbackResult, ScanEntry, SeqnoRange, WriteBatch, WriteOp,
};
use crate::traits::KvStore;

const CF_RECORDS: &str = "records";
const CF_BY_SEQNO: &str = "by_seqno";
const CF_VBSTATE: &str = "vbstate";

pub struct RocksKvStore {
    db: Arc<DB>,
}

impl RocksKvStore {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_opts = Options::default();
        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_RECORDS, cf_opts.clone()),
            ColumnFamilyDescriptor::new(CF_BY_SEQNO, cf_opts.clone()),
            ColumnFamilyDescriptor::new(CF_VBSTATE, cf_opts),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cfs)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn cf_records(&self) -> &rocksdb::ColumnFamily {
        self.db.cf_handle(CF_RECORDS).expect("records cf registered at open")
    }

    fn cf_by_seqno(&self) -> &rocksdb::ColumnFamily {
        self.db.cf_handle(CF_BY_SEQNO).expect("by_seqno cf registered at open")
    }

    fn cf_vbstate(&self) -> &rocksdb::ColumnFamily {
        self.db.cf_handle(CF_VBSTATE).expect("vbstate cf registered at open")
    }

    fn decode_item(bytes: &[u8]) -> StorageResult<QueuedItem> {
        bincode::deserialize(bytes).map_err(StorageError::Serialization)
    }

    fn encode_item(item: &QueuedItem) -> StorageResult<Vec<u8>> {
        bincode::serialize(item).map_err(StorageError::Serialization)
    }
}

impl KvStore for RocksKvStore {
    fn put(&self, vbid: VBucketId, space: KeySpace, key: &Key, item: &QueuedItem) -> StorageResult<()> {
        let disk_key = DiskKey::encode(vbid, space, key).into_bytes();
        let value = Self::encode_item(item)?;
        let mut batch = RocksWriteBatch::default();
        batch.put_cf(self.cf_by_seqno(), seqno_index_key(vbid, item.by_seqno), &disk_key);
        batch.put_cf(self.cf_records(), &disk_key, &value);
        self.db.write(batch)?;
        Ok(())
    }

    fn get(&self, vbid: VBucketId, space: KeySpace, key: &Key) -> StorageResult<Option<QueuedItem>> {
        let disk_key = DiskKey::encode(vbid, space, key).into_bytes();
        match self.db.get_cf(self.cf_records(), disk_key)? {
            Some(bytes) => Ok(Some(Self::decode_item(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, vbid: VBucketId, space: KeySpace, key: &Key) -> StorageResult<()> {
        let disk_key = DiskKey::encode(vbid, space, key).into_bytes();
        let mut batch = RocksWriteBatch::default();
        if let Some(bytes) = self.db.get_cf(self.cf_records(), &disk_key)? {
            let item = Self::decode_item(&bytes)?;
            batch.delete_cf(self.cf_by_seqno(), seqno_index_key(vbid, item.by_seqno));
        }
        batch.delete_cf(self.cf_records(), &disk_key);
        self.db.write(batch)?;
        Ok(())
    }

    fn commit(&self, vbid: VBucketId, batch: WriteBatch, vbstate: &VBucketStateRecord) -> StorageResult<()> {
        let mut rocks_batch = RocksWriteBatch::default();
        for op in batch.ops {
            match op {
                WriteOp::Put { space, key, item } => {
                    let disk_key = DiskKey::encode(vbid, space, &key).into_bytes();
                    let value = Self::encode_item(&item)?;
                    rocks_batch.put_cf(self.cf_by_seqno(), seqno_index_key(vbid, item.by_seqno), &disk_key);
                    rocks_batch.put_cf(self.cf_records(), &disk_key, &value);
                }
                WriteOp::Delete { space, key } => {
                    let disk_key = DiskKey::encode(vbid, space, &key).into_bytes();
                    if let Some(bytes) = self.db.get_cf(self.cf_records(), &disk_key)? {
                        let item = Self::decode_item(&bytes)?;
                        rocks_batch.delete_cf(self.cf_by_seqno(), seqno_index_key(vbid, item.by_seqno));
                    }
                    rocks_batch.delete_cf(self.cf_records(), &disk_key);
                }
            }
        }
        let vbstate_bytes = bincode::serialize(vbstate).map_err(StorageError::Serialization)?;
        rocks_batch.put_cf(self.cf_vbstate(), vbid.to_be_bytes(), vbstate_bytes);
        self.db.write(rocks_batch)?;
        Ok(())
    }

    fn compact(
        &self,
        vbid: VBucketId,
        config: &CompactionConfig,
        callbacks: &mut dyn CompactionCallbacks,
    ) -> StorageResult<()> {
        let prefix = DiskKey::vbucket_prefix(vbid);
        let iter = self.db.prefix_iterator_cf(self.cf_records(), &prefix);
        let mut rocks_batch = RocksWriteBatch::default();
        for entry in iter {
            let (disk_key, value) = entry?;
            if !disk_key.starts_with(&prefix) {
                break;
            }
            let item = Self::decode_item(&value)?;
            if item.committed_state == CommittedState::Pending {
                continue;
            }
            let expired = item.expiry != 0
                && config
                    .purge_tombstones_older_than
                    .map(|floor| item.by_seqno <= floor)
                    .unwrap_or(true);
            if !expired {
                continue;
            }
            let Some((_, _, _, raw_key)) = DiskKey::decode(&disk_key) else { continue };
            rocks_batch.delete_cf(self.cf_records(), &disk_key);
            rocks_batch.delete_cf(self.cf_by_seqno(), seqno_index_key(vbid, item.by_seqno));
            callbacks.on_expired(vbid, &Key::from_bytes(raw_key), &item);
        }
        self.db.write(rocks_batch)?;
        Ok(())
    }

    fn scan(&self, vbid: VBucketId, range: SeqnoRange) -> StorageResult<Vec<ScanEntry>> {
        let lo = seqno_index_key(vbid, range.start);
        let hi = seqno_index_key(vbid, range.end);
        let iter = self.db.iterator_cf(
            self.cf_by_seqno(),
            rocksdb::IteratorMode::From(&lo, rocksdb::Direction::Forward),
        );
        let mut out = Vec::new();
        for entry in iter {
            let (seqno_key, disk_key) = entry?;
            if seqno_key.as_ref() > hi.as_slice() {
                break;
            }
            if let Some(value) = self.db.get_cf(self.cf_records(), &disk_key)? {
                let item = Self::decode_item(&value)?;
                if let Some((_, space, collection, raw_key)) = DiskKey::decode(&disk_key) {
                    out.push(ScanEntry { space, key: Key::new(collection, raw_key), item });
                }
            }
        }
        Ok(out)
    }

    fn rollback(&self, vbid: VBucketId, target_seqno: BySeqno) -> StorageResult<RollbackResult> {
        let prefix = seqno_index_prefix(vbid);
        let cutoff = seqno_index_key(vbid, target_seqno + 1);
        let iter = self.db.iterator_cf(
            self.cf_by_seqno(),
            rocksdb::IteratorMode::From(&cutoff, rocksdb::Direction::Forward),
        );
        let mut rocks_batch = RocksWriteBatch::default();
        let mut removed = 0usize;
        for entry in iter {
            let (seqno_key, disk_key) = entry?;
            if !seqno_key.starts_with(&prefix[..]) {
                break;
            }
            rocks_batch.delete_cf(self.cf_by_seqno(), &seqno_key);
            if self.db.get_cf(self.cf_records(), &disk_key)?.is_some() {
                rocks_batch.delete_cf(self.cf_records(), &disk_key);
                removed += 1;
            }
        }
        self.db.write(rocks_batch)?;

        let rev_iter = self.db.iterator_cf(
            self.cf_by_seqno(),
            rocksdb::IteratorMode::From(&seqno_index_key(vbid, target_seqno), rocksdb::Direction::Reverse),
        );
        let new_high = rev_iter
            .filter_map(|e| e.ok())
            .find(|(k, _)| k.starts_with(&prefix[..]))
            .map(|(k, _)| u64::from_be_bytes(k[2..10].try_into().unwrap()))
            .unwrap_or(0);

        Ok(RollbackResult { items_removed: removed, new_high_seqno: new_high })
    }

    fn load_vbucket_state(&self, vbid: VBucketId) -> StorageResult<Option<VBucketStateRecord>> {
        match self.db.get_cf(self.cf_vbstate(), vbid.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(StorageError::Serialization)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ep_types::{Datatype, OperationType, VBucketStateName};
    use tempfile::tempdir;

    fn item(seqno: BySeqno) -> QueuedItem {
        QueuedItem {
            key: Key::from_bytes(b"k".to_vec()),
            value: b"v".to_vec(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: 1,
            by_seqno: seqno,
            rev_seqno: 1,
            operation: OperationType::Mutation,
            committed_state: CommittedState::CommittedViaMutation,
            durability: None,
            sync_delete: false,
        }
    }

    #[test]
    fn put_then_get_round_trips_through_rocksdb() {
        let dir = tempdir().unwrap();
        let store = RocksKvStore::open(dir.path()).unwrap();
        let key = Key::from_bytes(b"k".to_vec());
        store.put(0, KeySpace::Committed, &key, &item(1)).unwrap();
        let got = store.get(0, KeySpace::Committed, &key).unwrap().unwrap();
        assert_eq!(got.by_seqno, 1);
    }

    #[test]
    fn commit_persists_vbstate_alongside_records() {
        let dir = tempdir().unwrap();
        let store = RocksKvStore::open(dir.path()).unwrap();
        let key = Key::from_bytes(b"k".to_vec());
        let mut batch = WriteBatch::new();
        batch.put(KeySpace::Committed, key.clone(), item(1));
        let mut vbstate = VBucketStateRecord::new_empty(VBucketStateName::Active);
        vbstate.high_seqno = 1;
        store.commit(0, batch, &vbstate).unwrap();

        assert!(store.get(0, KeySpace::Committed, &key).unwrap().is_some());
        assert_eq!(store.load_vbucket_state(0).unwrap().unwrap().high_seqno, 1);
    }

    #[test]
    fn rollback_drops_entries_above_target_seqno() {
        let dir = tempdir().unwrap();
        let store = RocksKvStore::open(dir.path()).unwrap();
        for i in 1..=4u64 {
            let key = Key::from_bytes(format!("k{i}").into_bytes());
            store.put(0, KeySpace::Committed, &key, &item(i)).unwrap();
        }
        let result = store.rollback(0, 2).unwrap();
        assert_eq!(result.items_removed, 2);
        assert_eq!(result.new_high_seqno, 2);
    }

    #[test]
    fn reopening_the_same_path_preserves_data() {
        let dir = tempdir().unwrap();
        let key = Key::from_bytes(b"k".to_vec());
        {
            let store = RocksKvStore::open(dir.path()).unwrap();
            store.put(0, KeySpace::Committed, &key, &item(1)).unwrap();
        }
        let store = RocksKvStore::open(dir.path()).unwrap();
        assert!(store.get(0, KeySpace::Committed, &key).unwrap().is_some());
    }
}
