//! `Flusher`: drains a vBucket's persistence cursor in batches, applies
//! persist-time dedup, and commits each batch to the `KVStore` atomically
//! alongside the updated `vbucket_state` record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ep_kvstore::{KvStore, WriteBatch};
use ep_metrics::FlusherMetrics;
use ep_types::{CommittedState, EpResult, Key, KeySpace, OperationType, QueuedItem};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::vbucket::VBucket;

/// One entry in the batch being assembled: `None` means "delete this key",
/// matching the dedup rule that the last operation for a key within a
/// flush batch is the only one that reaches the store.
enum PendingOp {
    Put(QueuedItem),
    Delete,
}

pub struct Flusher<S> {
    store: Arc<S>,
    metrics: FlusherMetrics,
    batch_size: usize,
}

impl<S: KvStore> Flusher<S> {
    pub fn new(store: Arc<S>, metrics: FlusherMetrics, batch_size: usize) -> Self {
        Self { store, metrics, batch_size }
    }

    /// Drains at most one batch from `vbucket`'s persistence cursor and
    /// persists it. Returns the number of `QueuedItem`s the batch covered
    /// (`0` if nothing was pending). Leaves the cursor untouched on
    /// failure so the next call retries the same batch: the cursor only
    /// advances once `commit` succeeds.
    pub fn flush_once(&self, vbucket: &mut VBucket) -> EpResult<usize> {
        let cursor = vbucket.persistence_cursor_name();
        let batch = vbucket.checkpoint_manager().peek_batch(cursor, self.batch_size);
        if batch.items.is_empty() {
            return Ok(0);
        }

        let mut dedup: HashMap<(KeySpace, Key), PendingOp> = HashMap::new();
        let mut prepared_in_batch: HashMap<Key, QueuedItem> = HashMap::new();
        let mut max_seqno = 0;

        for (_, item) in &batch.items {
            max_seqno = max_seqno.max(item.by_seqno);
            match item.operation {
                OperationType::Mutation | OperationType::Deletion | OperationType::Expiration => {
                    let op = if item.is_deleted() { PendingOp::Delete } else { PendingOp::Put(item.clone()) };
                    dedup.insert((KeySpace::Committed, item.key.clone()), op);
                }
                OperationType::PendingSyncWrite => {
                    prepared_in_batch.insert(item.key.clone(), item.clone());
                    dedup.insert((KeySpace::Prepared, item.key.clone()), PendingOp::Put(item.clone()));
                }
                OperationType::CommitSyncWrite => {
                    let prepare_item = match prepared_in_batch.remove(&item.key) {
                        Some(p) => Some(p),
                        None => self.store.get(vbucket.vbid(), KeySpace::Prepared, &item.key)?,
                    };
                    if let Some(prepare_item) = prepare_item {
                        if prepare_item.is_sync_delete() {
                            dedup.insert((KeySpace::Committed, item.key.clone()), PendingOp::Delete);
                        } else {
                            let mut committed_item = prepare_item;
                            committed_item.operation = OperationType::Mutation;
                            committed_item.committed_state = CommittedState::CommittedViaPrepare;
                            committed_item.by_seqno = item.by_seqno;
                            dedup.insert((KeySpace::Committed, item.key.clone()), PendingOp::Put(committed_item));
                        }
                    }
                    dedup.insert((KeySpace::Prepared, item.key.clone()), PendingOp::Delete);
                }
                OperationType::AbortSyncWrite => {
                    prepared_in_batch.remove(&item.key);
                    dedup.insert((KeySpace::Prepared, item.key.clone()), PendingOp::Delete);
                }
                OperationType::CheckpointStart | OperationType::CheckpointEnd | OperationType::SetVBucketState => {}
            }
        }

        // Commit-of-insert/Commit-of-delete against the committed keyspace
        // move the on-disk item count; overwrites of an already-resident key
        // and anything touching the prepared keyspace do not. Resolved
        // against the store's current state before the batch lands, since a
        // `Delete` to a key never flushed before is a no-op, not a decrement.
        let mut disk_item_delta: i64 = 0;
        for ((space, key), op) in &dedup {
            if *space != KeySpace::Committed {
                continue;
            }
            let already_on_disk = self.store.get(vbucket.vbid(), KeySpace::Committed, key)?.is_some();
            match (op, already_on_disk) {
                (PendingOp::Put(_), false) => disk_item_delta += 1,
                (PendingOp::Delete, true) => disk_item_delta -= 1,
                _ => {}
            }
        }

        let mut write_batch = WriteBatch::new();
        for ((space, key), op) in dedup {
            match op {
                PendingOp::Put(item) => write_batch.put(space, key, item),
                PendingOp::Delete => write_batch.delete(space, key),
            }
        }

        let mut vbstate = vbucket.to_vbucket_state_record();
        vbstate.high_seqno = max_seqno;
        vbstate.disk_item_count += disk_item_delta;

        let item_count = batch.items.len();
        match self.store.commit(vbucket.vbid(), write_batch, &vbstate) {
            Ok(()) => {
                if let Some(end) = batch.end_position {
                    vbucket.checkpoint_manager_mut().advance_cursor_to(vbucket.persistence_cursor_name(), end);
                }
                vbucket.adjust_disk_item_count(disk_item_delta);
                vbucket.notify_persisted_seqno(max_seqno);
                self.metrics.batches_flushed_total.inc();
                self.metrics.items_flushed_total.inc_by(item_count as u64);
                debug!(vbid = %vbucket.vbid(), items = item_count, high_seqno = max_seqno, "flushed batch");
                Ok(item_count)
            }
            Err(e) => {
                self.metrics.flush_failures_total.inc();
                warn!(vbid = %vbucket.vbid(), error = %e, "flush batch failed, will retry");
                Err(e.into())
            }
        }
    }

    /// Background loop: flushes every vBucket in `vbuckets` on a fixed
    /// interval until cancelled. Started from `ep-server`'s main via
    /// `ep_metrics::spawn::spawn_monitored_task`.
    pub async fn run(self: Arc<Self>, vbuckets: Arc<Vec<Mutex<VBucket>>>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for vb in vbuckets.iter() {
                let mut vb = vb.lock();
                loop {
                    match self.flush_once(&mut vb) {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(error = %e, "flusher iteration failed");
                            break;
                        }
                    }
                }
            }
        }
    }
}
