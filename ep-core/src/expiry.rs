//! `ExpiryPager`: a background task that proactively walks
//! committed items past their expiry and turns them into tombstones, rather
//! than waiting for a read to discover one is stale.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::vbucket::VBucket;

pub struct ExpiryPager;

impl ExpiryPager {
    /// One sweep over every vBucket in `vbuckets`, expiring everything past
    /// `now` (epoch seconds). Returns the number of items expired.
    pub fn run_once(vbuckets: &[Mutex<VBucket>], now: u32) -> usize {
        let mut expired = 0;
        for vb in vbuckets {
            let mut vb = vb.lock();
            if vb.state() != ep_types::VBucketStateName::Active {
                continue;
            }
            let keys = vb.expired_keys(now);
            for key in keys {
                if vb.expire_item(&key, now) {
                    expired += 1;
                }
            }
        }
        expired
    }

    /// Background loop, started from `ep-server` alongside the Flusher's.
    pub async fn run(vbuckets: Arc<Vec<Mutex<VBucket>>>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0);
            let expired = Self::run_once(&vbuckets, now);
            if expired > 0 {
                debug!(count = expired, "expiry pager expired items");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RuntimeContext;
    use crate::vbucket::{BucketType, MutationKind, MutationRequest};
    use ep_types::{Datatype, Key, VBucketStateName};

    fn req(key: &str, value: &str, expiry: u32) -> MutationRequest {
        MutationRequest { key: Key::from_bytes(key.as_bytes().to_vec()), value: value.as_bytes().to_vec(), datatype: Datatype::RAW, flags: 0, expiry, cas: None }
    }

    #[test]
    fn run_once_expires_stale_items_and_leaves_fresh_ones() {
        let mut vb = VBucket::new(0, BucketType::Persistent, VBucketStateName::Active, None, RuntimeContext::for_test());
        vb.mutate(MutationKind::Set, req("stale", "v", 100), None).unwrap();
        vb.mutate(MutationKind::Set, req("fresh", "v", 1_000_000), None).unwrap();
        vb.mutate(MutationKind::Set, req("forever", "v", 0), None).unwrap();

        let vbuckets = vec![Mutex::new(vb)];
        let expired = ExpiryPager::run_once(&vbuckets, 500);
        assert_eq!(expired, 1);

        let vb = vbuckets[0].lock();
        assert!(vb.get(&Key::from_bytes(b"stale".to_vec())).is_err());
        assert!(vb.get(&Key::from_bytes(b"fresh".to_vec())).is_ok());
        assert!(vb.get(&Key::from_bytes(b"forever".to_vec())).is_ok());
    }

    #[test]
    fn replica_vbuckets_are_skipped() {
        let mut vb = VBucket::new(0, BucketType::Persistent, VBucketStateName::Replica, None, RuntimeContext::for_test());
        // Replica vBuckets never accept a direct mutate (NotMyVBucket), so
        // seed the committed table directly, as warmup replay would.
        vb.seed_committed(Key::from_bytes(b"k".to_vec()), b"v".to_vec(), Datatype::RAW, 0, 1, 1, 1, 1);

        let vbuckets = vec![Mutex::new(vb)];
        assert_eq!(ExpiryPager::run_once(&vbuckets, u32::MAX), 0);
    }
}
