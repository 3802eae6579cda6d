//! Startup warmup: opens one [`VBucket`] per configured id, resuming its
//! scalar state from a persisted `vbucket_state` record and rebuilding the
//! in-memory hash table from a KVStore scan when one exists.
//! `VBucket::resume`'s own doc notes the hash table is rebuilt separately
//! by the caller.

use ep_core::{BucketType, RuntimeContext, VBucket};
use ep_kvstore::{KvStore, SeqnoRange};
use ep_types::{KeySpace, VBucketId, VBucketStateName};
use parking_lot::Mutex;

pub fn open_vbuckets<S: KvStore>(store: &S, num_vbuckets: u16, ctx: &RuntimeContext) -> anyhow::Result<Vec<Mutex<VBucket>>> {
    let mut vbuckets = Vec::with_capacity(num_vbuckets as usize);
    for vbid in 0..num_vbuckets as VBucketId {
        let vb = match store.load_vbucket_state(vbid)? {
            Some(record) => {
                let mut vb = VBucket::resume(vbid, BucketType::Persistent, record, ctx.clone());
                seed_from_scan(store, vbid, &mut vb)?;
                vb
            }
            None => VBucket::new(vbid, BucketType::Persistent, VBucketStateName::Active, None, ctx.clone()),
        };
        vbuckets.push(Mutex::new(vb));
    }
    Ok(vbuckets)
}

fn seed_from_scan<S: KvStore>(store: &S, vbid: VBucketId, vb: &mut VBucket) -> anyhow::Result<()> {
    let entries = store.scan(vbid, SeqnoRange { start: 0, end: u64::MAX })?;
    for entry in entries {
        if entry.space != KeySpace::Committed || entry.item.is_deleted() {
            continue;
        }
        let item = entry.item;
        vb.seed_committed(entry.key, item.value, item.datatype, item.flags, item.expiry, item.cas, item.by_seqno, item.rev_seqno);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ep_kvstore::MemoryKvStore;
    use ep_types::{Cas, CommittedState, Datatype, Key, OperationType, QueuedItem, VBucketStateRecord};

    fn committed_item(value: &str, seqno: u64, cas: Cas) -> QueuedItem {
        QueuedItem {
            key: Key::from_bytes(b"unused".to_vec()),
            value: value.as_bytes().to_vec(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas,
            by_seqno: seqno,
            rev_seqno: 1,
            operation: OperationType::Mutation,
            committed_state: CommittedState::CommittedViaMutation,
            durability: None,
            sync_delete: false,
        }
    }

    #[test]
    fn fresh_bucket_with_no_persisted_state_starts_empty_and_active() {
        let store = MemoryKvStore::new();
        let ctx = RuntimeContext::for_test();
        let vbuckets = open_vbuckets(&store, 2, &ctx).unwrap();
        assert_eq!(vbuckets.len(), 2);
        assert_eq!(vbuckets[0].lock().state(), VBucketStateName::Active);
        assert_eq!(vbuckets[0].lock().num_items(), 0);
    }

    #[test]
    fn resumed_bucket_reseeds_committed_items_from_scan() {
        let store = MemoryKvStore::new();
        let key = Key::from_bytes(b"k".to_vec());
        store.put(0, KeySpace::Committed, &key, &committed_item("v1", 1, 10)).unwrap();
        let record = VBucketStateRecord { high_seqno: 1, disk_item_count: 1, ..VBucketStateRecord::new_empty(VBucketStateName::Active) };
        store.commit(0, ep_kvstore::WriteBatch::new(), &record).unwrap();

        let ctx = RuntimeContext::for_test();
        let vbuckets = open_vbuckets(&store, 1, &ctx).unwrap();
        let vb = vbuckets[0].lock();
        assert_eq!(vb.num_items(), 1);
        assert_eq!(vb.disk_item_count(), 1);
        let (value, cas, ..) = vb.get(&key).unwrap();
        assert_eq!(value, b"v1");
        assert_eq!(cas, 10);
    }
}
