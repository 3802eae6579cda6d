//! `CheckpointRemover` / `CheckpointDestroyer`: the memory-pressure-driven
//! reclamation loop and the asynchronous free it hands detached Checkpoints
//! off to, so the hot path that notices a Checkpoint is unreferenced never
//! pays for freeing its items itself.

use std::sync::Arc;
use std::time::Duration;

use ep_metrics::ReclamationMetrics;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::checkpoint::Checkpoint;
use crate::config::BucketConfig;
use crate::vbucket::VBucket;

/// Owns the list of detached Checkpoints awaiting a free. On wake, swaps
/// the pending list out under a lock and frees it outside the lock, and
/// tracks a running count of bytes still waiting to be freed.
pub struct CheckpointDestroyer {
    pending: Mutex<Vec<Checkpoint>>,
    metrics: ReclamationMetrics,
}

impl CheckpointDestroyer {
    pub fn new(metrics: ReclamationMetrics) -> Self {
        Self { pending: Mutex::new(Vec::new()), metrics }
    }

    /// Producers (the Remover, or a cursor advance in eager mode) splice
    /// detached Checkpoints in here instead of dropping them inline.
    pub fn splice_in(&self, checkpoints: Vec<Checkpoint>) {
        if checkpoints.is_empty() {
            return;
        }
        let bytes: usize = checkpoints.iter().map(Checkpoint::memory_usage).sum();
        self.metrics.checkpoints_removed_total.inc_by(checkpoints.len() as u64);
        self.metrics.pending_destruction_bytes.add(bytes as i64);
        self.pending.lock().extend(checkpoints);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Swaps the pending list out under the lock and frees it outside --
    /// the only `Checkpoint` drops on this path happen after the lock is
    /// released, so a slow free never blocks a producer splicing more in.
    /// Returns the number of bytes freed.
    pub fn destroy_pending(&self) -> usize {
        let drained = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut *pending)
        };
        if drained.is_empty() {
            return 0;
        }
        let bytes: usize = drained.iter().map(Checkpoint::memory_usage).sum();
        drop(drained);
        self.metrics.pending_destruction_bytes.sub(bytes as i64);
        bytes
    }

    /// Background loop: frees whatever accumulated since the last wakeup.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let freed = self.destroy_pending();
            if freed > 0 {
                debug!(bytes = freed, "destroyer freed pending checkpoints");
            }
        }
    }
}

/// Memory-pressure-driven reclamation. Wakes periodically (or would be
/// woken on an explicit memory-pressure signal, in a deployment that wires
/// one up) and, if the configured budget is exceeded, works through three
/// escalating tactics in order: closed-checkpoint removal, then item
/// expelling, then dropping slow replication cursors.
pub struct CheckpointRemover {
    config: BucketConfig,
    metrics: ReclamationMetrics,
    destroyer: Arc<CheckpointDestroyer>,
}

impl CheckpointRemover {
    pub fn new(config: BucketConfig, metrics: ReclamationMetrics, destroyer: Arc<CheckpointDestroyer>) -> Self {
        Self { config, metrics, destroyer }
    }

    /// One reclamation pass over every vBucket in `vbuckets`. Returns the
    /// number of bytes recovered (from closed-checkpoint removal and item
    /// expelling; dropping a cursor doesn't itself free memory until a later
    /// pass finds the checkpoints it was pinning newly unreferenced).
    pub fn reclaim_once(&self, vbuckets: &[Mutex<VBucket>]) -> usize {
        let total_before: usize = vbuckets.iter().map(|vb| vb.lock().checkpoint_manager().memory_usage()).sum();
        if total_before <= self.config.checkpoint_memory_high_watermark_bytes {
            return 0;
        }
        let target = self.config.checkpoint_memory_low_watermark_bytes;
        let mut recovered = 0usize;

        // Rank vBuckets by descending checkpoint memory once, up front, so
        // the heaviest consumers are reclaimed from first.
        let mut by_memory: Vec<usize> = (0..vbuckets.len()).collect();
        by_memory.sort_by_key(|&i| std::cmp::Reverse(vbuckets[i].lock().checkpoint_manager().memory_usage()));

        // (a) closed-checkpoint removal.
        for &i in &by_memory {
            if total_before.saturating_sub(recovered) <= target {
                break;
            }
            let removed = vbuckets[i].lock().checkpoint_manager_mut().remove_unreferenced_closed_checkpoints();
            if removed.is_empty() {
                continue;
            }
            let bytes: usize = removed.iter().map(Checkpoint::memory_usage).sum();
            self.destroyer.splice_in(removed);
            recovered += bytes;
        }

        // (b) item expelling, if still short.
        if total_before.saturating_sub(recovered) > target {
            for &i in &by_memory {
                let still_over = total_before.saturating_sub(recovered).saturating_sub(target);
                if still_over == 0 {
                    break;
                }
                let (_, bytes) = vbuckets[i].lock().checkpoint_manager_mut().expel_items(still_over);
                recovered += bytes;
            }
        }

        // (c) drop slow replication cursors, if still short. This does not
        // itself add to `recovered`: the stream falls back to backfill and
        // the checkpoints it was pinning become reclaimable on a later pass.
        if total_before.saturating_sub(recovered) > target {
            for &i in &by_memory {
                if total_before.saturating_sub(recovered) <= target {
                    break;
                }
                let dropped = vbuckets[i].lock().checkpoint_manager_mut().drop_slowest_stream_cursor();
                if let Some(name) = dropped {
                    info!(vbid = i, cursor = %name, "dropped stream cursor under memory pressure");
                }
            }
        }

        self.metrics.bytes_recovered_total.inc_by(recovered as u64);
        recovered
    }

    /// Background loop, started from `ep-server` alongside the Destroyer's.
    pub async fn run(self: Arc<Self>, vbuckets: Arc<Vec<Mutex<VBucket>>>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let recovered = self.reclaim_once(&vbuckets);
            if recovered > 0 {
                info!(bytes = recovered, "checkpoint remover recovered memory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CursorKind;
    use crate::checkpoint_manager::PERSISTENCE_CURSOR;
    use crate::context::RuntimeContext;
    use crate::vbucket::{BucketType, MutationKind, MutationRequest};
    use ep_types::{Datatype, Key, VBucketStateName};

    fn config_with_watermarks(high: usize, low: usize) -> BucketConfig {
        BucketConfig { checkpoint_memory_high_watermark_bytes: high, checkpoint_memory_low_watermark_bytes: low, ..BucketConfig::default() }
    }

    fn req(key: &str, value: &str) -> MutationRequest {
        MutationRequest { key: Key::from_bytes(key.as_bytes().to_vec()), value: value.as_bytes().to_vec(), datatype: Datatype::RAW, flags: 0, expiry: 0, cas: None }
    }

    fn vbucket_with_items(n: usize) -> VBucket {
        let mut vb = VBucket::new(0, BucketType::Persistent, VBucketStateName::Active, None, RuntimeContext::for_test());
        for i in 0..n {
            vb.mutate(MutationKind::Set, req(&format!("k{i}"), "value-payload"), None).unwrap();
        }
        vb
    }

    #[test]
    fn below_high_watermark_does_nothing() {
        let config = config_with_watermarks(1_000_000, 500_000);
        let destroyer = Arc::new(CheckpointDestroyer::new(ReclamationMetrics::for_test()));
        let remover = CheckpointRemover::new(config, ReclamationMetrics::for_test(), destroyer);

        let vbuckets = vec![Mutex::new(vbucket_with_items(10))];
        assert_eq!(remover.reclaim_once(&vbuckets), 0);
    }

    #[test]
    fn closed_checkpoint_removal_hands_off_to_destroyer() {
        let config = config_with_watermarks(1, 0);
        let metrics = ReclamationMetrics::for_test();
        let destroyer = Arc::new(CheckpointDestroyer::new(metrics.clone()));
        let remover = CheckpointRemover::new(config, metrics, destroyer.clone());

        let mut vb = vbucket_with_items(5);
        // Advance the persistence cursor past everything so the checkpoint
        // becomes unreferenced once a new one is opened.
        vb.checkpoint_manager_mut().force_new_checkpoint(ep_types::CheckpointType::Memory);
        let end = vb.checkpoint_manager().cursor_position(PERSISTENCE_CURSOR).unwrap();
        let _ = end;
        vb.checkpoint_manager_mut().advance_cursor_to(PERSISTENCE_CURSOR, crate::checkpoint::CursorPosition::new(2, 0));

        let vbuckets = vec![Mutex::new(vb)];
        let recovered = remover.reclaim_once(&vbuckets);
        assert!(recovered > 0);
        assert!(destroyer.pending_count() > 0);

        assert_eq!(destroyer.destroy_pending(), recovered.max(destroyer.destroy_pending()));
    }

    #[test]
    fn drops_slow_stream_cursor_once_expelling_is_not_enough() {
        let config = config_with_watermarks(1, 0);
        let metrics = ReclamationMetrics::for_test();
        let destroyer = Arc::new(CheckpointDestroyer::new(metrics.clone()));
        let remover = CheckpointRemover::new(config, metrics, destroyer);

        let mut vb = vbucket_with_items(5);
        vb.checkpoint_manager_mut().register_cursor("replica-1", CursorKind::Stream);

        let vbuckets = vec![Mutex::new(vb)];
        remover.reclaim_once(&vbuckets);

        let vb = vbuckets[0].lock();
        // The stream cursor pinned every item at offset 0, so expelling
        // alone can't clear the budget and the cursor must be dropped.
        assert!(vb.checkpoint_manager().cursor_position("replica-1").is_none());
    }

    #[tokio::test]
    async fn destroyer_run_loop_frees_on_tick() {
        let metrics = ReclamationMetrics::for_test();
        let destroyer = Arc::new(CheckpointDestroyer::new(metrics));
        let vb = vbucket_with_items(3);
        let cp = Checkpoint::new(99, ep_types::CheckpointType::Memory, 1);
        let _ = vb; // keep a live vbucket around to mirror real usage shape
        destroyer.splice_in(vec![cp]);
        assert_eq!(destroyer.pending_count(), 1);

        let handle = tokio::spawn({
            let destroyer = destroyer.clone();
            async move { destroyer.run(Duration::from_millis(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();

        assert_eq!(destroyer.pending_count(), 0);
    }
}
