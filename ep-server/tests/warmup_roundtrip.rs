//! End-to-end round-trip: write through a real `VBucket`/`Flusher` pair
//! backed by `RocksKvStore`, reopen against the same directory, and confirm
//! warmup reconstructs the same committed state (the persistence
//! round-trip invariant).

use std::sync::Arc;

use ep_core::{BucketType, Flusher, RuntimeContext, VBucket};
use ep_kvstore::RocksKvStore;
use ep_types::{Datatype, Key, VBucketStateName};

fn mutation_req(key: &str, value: &str) -> ep_core::MutationRequest {
    ep_core::MutationRequest {
        key: Key::from_bytes(key.as_bytes().to_vec()),
        value: value.as_bytes().to_vec(),
        datatype: Datatype::RAW,
        flags: 0,
        expiry: 0,
        cas: None,
    }
}

#[test]
fn committed_items_survive_a_flush_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = RuntimeContext::for_test();

    {
        let store = Arc::new(RocksKvStore::open(dir.path()).unwrap());
        let flusher = Flusher::new(store.clone(), ctx.flusher_metrics.clone(), 100);
        let mut vb = VBucket::new(0, BucketType::Persistent, VBucketStateName::Active, None, ctx.clone());
        vb.mutate(ep_core::MutationKind::Set, mutation_req("a", "1"), None).unwrap();
        vb.mutate(ep_core::MutationKind::Set, mutation_req("b", "2"), None).unwrap();
        flusher.flush_once(&mut vb).unwrap();
    }

    let store = RocksKvStore::open(dir.path()).unwrap();
    let vbuckets = ep_server::warmup::open_vbuckets(&store, 1, &ctx).unwrap();
    let vb = vbuckets[0].lock();
    assert_eq!(vb.num_items(), 2);
    let (value, ..) = vb.get(&Key::from_bytes(b"a".to_vec())).unwrap();
    assert_eq!(value, b"1");
}
