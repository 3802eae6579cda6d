//! `CheckpointManager`: per-vBucket owner of the open/closed
//! Checkpoint arena, the cursor registry, and reclamation bookkeeping.

use std::collections::HashMap;
use std::ops::Bound;

use ep_metrics::CheckpointManagerMetrics;
use ep_types::{BySeqno, CheckpointId, CheckpointType, EpError, EpResult, Key, OperationType, QueuedItem, VBucketId};

use crate::checkpoint::{Checkpoint, Cursor, CursorKind, CursorName, CursorPosition};

pub const PERSISTENCE_CURSOR: &str = "persistence";

#[derive(Debug, Clone, Copy)]
pub struct CheckpointManagerConfig {
    /// Open Checkpoint item count above which the next append forces a new
    /// Checkpoint.
    pub item_count_threshold: usize,
}

impl Default for CheckpointManagerConfig {
    fn default() -> Self {
        Self { item_count_threshold: 500 }
    }
}

/// What [`CheckpointManager::queue_item`] did, for the VBucket to react to
/// (assign the seqno into its hash table entry, log at `debug`).
#[derive(Debug, Clone, Copy)]
pub struct QueueResult {
    pub seqno: BySeqno,
    pub checkpoint_id: CheckpointId,
    pub opened_new_checkpoint: bool,
}

/// Items collected by [`CheckpointManager::peek_batch`] without advancing
/// the cursor.
#[derive(Debug, Default)]
pub struct PeekedBatch {
    pub items: Vec<(CursorPosition, QueuedItem)>,
    pub end_position: Option<CursorPosition>,
}

pub struct CheckpointManager {
    vbid: VBucketId,
    checkpoints: std::collections::BTreeMap<CheckpointId, Checkpoint>,
    next_checkpoint_id: CheckpointId,
    next_seqno: BySeqno,
    high_completed_seqno: BySeqno,
    cursors: HashMap<CursorName, Cursor>,
    config: CheckpointManagerConfig,
    metrics: CheckpointManagerMetrics,
}

impl CheckpointManager {
    pub fn new(vbid: VBucketId, config: CheckpointManagerConfig, metrics: CheckpointManagerMetrics) -> Self {
        Self::resume(vbid, config, metrics, 0, 0)
    }

    /// Opens with seqno/high-completed-seqno resumed from a persisted
    /// `vbucket_state` record (warmup path).
    pub fn resume(
        vbid: VBucketId,
        config: CheckpointManagerConfig,
        metrics: CheckpointManagerMetrics,
        high_seqno: BySeqno,
        high_completed_seqno: BySeqno,
    ) -> Self {
        let mut checkpoints = std::collections::BTreeMap::new();
        let first = Checkpoint::new(1, CheckpointType::Memory, high_seqno + 1);
        checkpoints.insert(1, first);

        let mut cursors = HashMap::new();
        cursors.insert(
            PERSISTENCE_CURSOR.to_string(),
            Cursor { name: PERSISTENCE_CURSOR.to_string(), kind: CursorKind::Persistence, position: CursorPosition::new(1, 0) },
        );

        metrics.num_open_checkpoints.set(1);
        metrics.num_closed_checkpoints.set(0);

        Self {
            vbid,
            checkpoints,
            next_checkpoint_id: 2,
            next_seqno: high_seqno + 1,
            high_completed_seqno,
            cursors,
            config,
            metrics,
        }
    }

    pub fn vbid(&self) -> VBucketId {
        self.vbid
    }

    pub fn high_seqno(&self) -> BySeqno {
        self.next_seqno.saturating_sub(1)
    }

    pub fn high_completed_seqno(&self) -> BySeqno {
        self.high_completed_seqno
    }

    fn open_checkpoint_id(&self) -> CheckpointId {
        *self.checkpoints.keys().next_back().expect("at least one checkpoint always open")
    }

    fn open_checkpoint(&self) -> &Checkpoint {
        self.checkpoints.get(&self.open_checkpoint_id()).unwrap()
    }

    fn open_checkpoint_mut(&mut self) -> &mut Checkpoint {
        let id = self.open_checkpoint_id();
        self.checkpoints.get_mut(&id).unwrap()
    }

    /// Closes the current open Checkpoint and opens a fresh one of
    /// `checkpoint_type`, starting at the next unassigned seqno.
    pub fn force_new_checkpoint(&mut self, checkpoint_type: CheckpointType) -> CheckpointId {
        let hcs = self.high_completed_seqno;
        self.open_checkpoint_mut().close(hcs);
        let id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;
        self.checkpoints.insert(id, Checkpoint::new(id, checkpoint_type, self.next_seqno));

        self.metrics.num_open_checkpoints.set(1);
        self.metrics.num_closed_checkpoints.set(self.checkpoints.len() as i64 - 1);
        id
    }

    /// Assigns the next seqno, builds the item, and appends it to the open
    /// Checkpoint, opening a new one first if required by the queue
    /// rules. `dedup_key` is the key a Prepare would collide against in the
    /// open Checkpoint's committed space (`None` for non-Prepare writes,
    /// which decide via their own operation tag).
    pub fn queue_item<F>(&mut self, dedup_key: Option<&Key>, build: F) -> QueueResult
    where
        F: FnOnce(BySeqno) -> QueuedItem,
    {
        let seqno = self.next_seqno;
        self.next_seqno += 1;
        self.queue_item_at_seqno(seqno, dedup_key, build)
    }

    /// Appends at a seqno dictated by an upstream producer rather than this
    /// manager's own counter -- the replica path, where seqnos are assigned
    /// by the Active and must match exactly across the chain.
    pub fn queue_item_at_seqno<F>(&mut self, seqno: BySeqno, dedup_key: Option<&Key>, build: F) -> QueueResult
    where
        F: FnOnce(BySeqno) -> QueuedItem,
    {
        if seqno >= self.next_seqno {
            self.next_seqno = seqno + 1;
        }
        let item = build(seqno);
        let operation = item.operation;

        let mut opened_new = false;
        if operation.always_opens_new_checkpoint() {
            self.force_new_checkpoint(CheckpointType::Memory);
            opened_new = true;
        } else if operation == OperationType::PendingSyncWrite {
            if let Some(key) = dedup_key {
                if self.open_checkpoint().has_committed_entry_for(key) {
                    self.force_new_checkpoint(CheckpointType::Memory);
                    opened_new = true;
                }
            }
        }

        if !opened_new && self.open_checkpoint().len() >= self.config.item_count_threshold {
            self.force_new_checkpoint(self.open_checkpoint().checkpoint_type());
            opened_new = true;
        }

        if operation == OperationType::CommitSyncWrite || operation == OperationType::AbortSyncWrite {
            self.high_completed_seqno = seqno;
        }

        let checkpoint_id = self.open_checkpoint_id();
        self.open_checkpoint_mut().push(item);
        self.refresh_persistence_gauge();

        QueueResult { seqno, checkpoint_id, opened_new_checkpoint: opened_new }
    }

    pub fn register_cursor(&mut self, name: impl Into<String>, kind: CursorKind) -> CursorPosition {
        let name = name.into();
        let start = *self.checkpoints.keys().next().expect("at least one checkpoint");
        let position = CursorPosition::new(start, 0);
        self.cursors.insert(name.clone(), Cursor { name, kind, position });
        position
    }

    pub fn drop_cursor(&mut self, name: &str) -> EpResult<()> {
        if name == PERSISTENCE_CURSOR {
            return Err(EpError::EInval);
        }
        if self.cursors.remove(name).is_some() {
            self.metrics.num_cursors_dropped.inc();
            Ok(())
        } else {
            Err(EpError::EInval)
        }
    }

    pub fn cursor_position(&self, name: &str) -> Option<CursorPosition> {
        self.cursors.get(name).map(|c| c.position)
    }

    /// Single-step advance. Returns `None` once
    /// the cursor has caught up to the open Checkpoint's end.
    pub fn next(&mut self, name: &str) -> Option<QueuedItem> {
        loop {
            let pos = self.cursors.get(name)?.position;
            let cp = self.checkpoints.get(&pos.checkpoint_id)?;
            if pos.offset < cp.len() {
                let item = cp.get(pos.offset).cloned();
                self.cursors.get_mut(name).unwrap().position = CursorPosition::new(pos.checkpoint_id, pos.offset + 1);
                if item.is_some() {
                    return item;
                }
                continue;
            }
            if cp.is_open() {
                return None;
            }
            match self.next_checkpoint_id_after(pos.checkpoint_id) {
                Some(id) => self.cursors.get_mut(name).unwrap().position = CursorPosition::new(id, 0),
                None => return None,
            }
        }
    }

    fn next_checkpoint_id_after(&self, id: CheckpointId) -> Option<CheckpointId> {
        self.checkpoints.range((Bound::Excluded(id), Bound::Unbounded)).next().map(|(&id, _)| id)
    }

    /// Collects up to `max_items` without mutating the cursor's stored
    /// position. A Memory Checkpoint is always drained in full once
    /// entered; a Disk Checkpoint may be cut off mid-way.
    pub fn peek_batch(&self, cursor_name: &str, max_items: usize) -> PeekedBatch {
        let mut batch = PeekedBatch::default();
        let Some(cursor) = self.cursors.get(cursor_name) else { return batch };
        let mut pos = cursor.position;

        'outer: loop {
            let Some(cp) = self.checkpoints.get(&pos.checkpoint_id) else { break };
            while pos.offset < cp.len() {
                if let Some(item) = cp.get(pos.offset) {
                    batch.items.push((CursorPosition::new(pos.checkpoint_id, pos.offset), item.clone()));
                }
                pos.offset += 1;
                if batch.items.len() >= max_items && cp.checkpoint_type().may_split_across_batches() {
                    batch.end_position = Some(pos);
                    break 'outer;
                }
            }
            batch.end_position = Some(pos);
            if batch.items.len() >= max_items || cp.is_open() {
                break;
            }
            match self.next_checkpoint_id_after(pos.checkpoint_id) {
                Some(id) => pos = CursorPosition::new(id, 0),
                None => break,
            }
        }
        batch
    }

    pub fn advance_cursor_to(&mut self, cursor_name: &str, position: CursorPosition) {
        if let Some(cursor) = self.cursors.get_mut(cursor_name) {
            cursor.position = position;
        }
        self.refresh_persistence_gauge();
    }

    fn refresh_persistence_gauge(&self) {
        let pending = self.items_pending_for_cursor(PERSISTENCE_CURSOR);
        self.metrics.num_items_for_persistence.set(pending as i64);
    }

    pub fn items_pending_for_cursor(&self, cursor_name: &str) -> usize {
        let Some(cursor) = self.cursors.get(cursor_name) else { return 0 };
        let mut pos = cursor.position;
        let mut total = 0;
        loop {
            let Some(cp) = self.checkpoints.get(&pos.checkpoint_id) else { break };
            total += cp.len().saturating_sub(pos.offset);
            if cp.is_open() {
                break;
            }
            match self.next_checkpoint_id_after(pos.checkpoint_id) {
                Some(id) => pos = CursorPosition::new(id, 0),
                None => break,
            }
        }
        total
    }

    /// Removes Closed Checkpoints referenced by no cursor, returning them
    /// for the Destroyer to free off the hot path.
    pub fn remove_unreferenced_closed_checkpoints(&mut self) -> Vec<Checkpoint> {
        let referenced: std::collections::HashSet<CheckpointId> =
            self.cursors.values().map(|c| c.position.checkpoint_id).collect();
        let removable: Vec<CheckpointId> = self
            .checkpoints
            .iter()
            .filter(|(id, cp)| !cp.is_open() && !referenced.contains(id))
            .map(|(&id, _)| id)
            .collect();

        let mut removed = Vec::with_capacity(removable.len());
        for id in removable {
            if let Some(cp) = self.checkpoints.remove(&id) {
                removed.push(cp);
            }
        }
        self.metrics.num_closed_checkpoints.set(self.checkpoints.len() as i64 - 1);
        removed
    }

    /// Expels items from Closed Checkpoints below every cursor currently
    /// positioned at or after them, up to `max_bytes` freed. Returns
    /// `(items_expelled, bytes_freed)`.
    pub fn expel_items(&mut self, max_bytes: usize) -> (usize, usize) {
        let mut total_count = 0;
        let mut total_bytes = 0;
        let ids: Vec<CheckpointId> = self.checkpoints.keys().copied().collect();
        for id in ids {
            if total_bytes >= max_bytes {
                break;
            }
            let is_open = self.checkpoints.get(&id).map(|cp| cp.is_open()).unwrap_or(true);
            if is_open {
                continue;
            }
            let min_offset = self
                .cursors
                .values()
                .filter(|c| c.position.checkpoint_id == id)
                .map(|c| c.position.offset)
                .min();
            let Some(cp) = self.checkpoints.get_mut(&id) else { continue };
            let bound = min_offset.unwrap_or_else(|| cp.len());
            if bound == 0 {
                continue;
            }
            let (count, bytes) = cp.expel_below(bound);
            total_count += count;
            total_bytes += bytes;
        }
        self.metrics.items_expelled_total.inc_by(total_count as u64);
        self.metrics.memory_expelled_bytes_total.inc_by(total_bytes as u64);
        (total_count, total_bytes)
    }

    pub fn memory_usage(&self) -> usize {
        self.checkpoints.values().map(Checkpoint::memory_usage).sum()
    }

    pub fn num_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    /// Drops the stream cursor furthest behind the tail: slow replication
    /// cursors may be dropped under memory pressure, and a dropped cursor's
    /// stream must fall back to backfill from disk. Never touches the
    /// persistence cursor. Returns the dropped cursor's name, or `None` if
    /// there are no stream cursors to drop.
    pub fn drop_slowest_stream_cursor(&mut self) -> Option<CursorName> {
        let slowest = self
            .cursors
            .values()
            .filter(|c| c.kind == CursorKind::Stream)
            .min_by_key(|c| c.position)
            .map(|c| c.name.clone())?;
        self.cursors.remove(&slowest);
        self.metrics.num_cursors_dropped.inc();
        Some(slowest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ep_types::{Cas, CommittedState, Datatype, Key, RevSeqno};

    fn mutation(key: &str, seqno: BySeqno) -> QueuedItem {
        QueuedItem {
            key: Key::from_bytes(key.as_bytes().to_vec()),
            value: b"v".to_vec(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: seqno as Cas,
            by_seqno: seqno,
            rev_seqno: seqno as RevSeqno,
            operation: OperationType::Mutation,
            committed_state: CommittedState::CommittedViaMutation,
            durability: None,
            sync_delete: false,
        }
    }

    fn manager() -> CheckpointManager {
        CheckpointManager::new(0, CheckpointManagerConfig::default(), CheckpointManagerMetrics::for_test())
    }

    #[test]
    fn dedup_within_open_checkpoint_keeps_latest_and_assigns_seqnos() {
        let mut mgr = manager();
        let r1 = mgr.queue_item(None, |seqno| mutation("a", seqno));
        let r2 = mgr.queue_item(None, |seqno| mutation("a", seqno));
        let r3 = mgr.queue_item(None, |seqno| mutation("b", seqno));

        assert_eq!((r1.seqno, r2.seqno, r3.seqno), (1, 2, 3));
        assert_eq!(mgr.open_checkpoint().len(), 2);
        assert_eq!(mgr.open_checkpoint().get(0).unwrap().by_seqno, 2);
    }

    #[test]
    fn prepare_colliding_with_committed_mutation_opens_new_checkpoint() {
        let mut mgr = manager();
        mgr.queue_item(None, |seqno| mutation("a", seqno));

        let key = Key::from_bytes(b"a".to_vec());
        let result = mgr.queue_item(Some(&key), |seqno| {
            let mut item = mutation("a", seqno);
            item.operation = OperationType::PendingSyncWrite;
            item.committed_state = CommittedState::Pending;
            item
        });
        assert!(result.opened_new_checkpoint);
        assert_eq!(mgr.num_checkpoints(), 2);
    }

    #[test]
    fn persistence_cursor_cannot_be_dropped() {
        let mut mgr = manager();
        assert!(mgr.drop_cursor(PERSISTENCE_CURSOR).is_err());
    }

    #[test]
    fn peek_batch_does_not_mutate_cursor_until_advanced() {
        let mut mgr = manager();
        mgr.queue_item(None, |seqno| mutation("a", seqno));
        mgr.queue_item(None, |seqno| mutation("b", seqno));

        let batch = mgr.peek_batch(PERSISTENCE_CURSOR, 10);
        assert_eq!(batch.items.len(), 2);
        assert_eq!(mgr.cursor_position(PERSISTENCE_CURSOR).unwrap(), CursorPosition::new(1, 0));

        mgr.advance_cursor_to(PERSISTENCE_CURSOR, batch.end_position.unwrap());
        assert_eq!(mgr.cursor_position(PERSISTENCE_CURSOR).unwrap(), CursorPosition::new(1, 2));
    }

    #[test]
    fn drop_slowest_stream_cursor_picks_the_one_furthest_behind() {
        let mut mgr = manager();
        mgr.queue_item(None, |seqno| mutation("a", seqno));
        mgr.force_new_checkpoint(CheckpointType::Memory);
        mgr.queue_item(None, |seqno| mutation("b", seqno));

        mgr.register_cursor("fast", CursorKind::Stream);
        mgr.advance_cursor_to("fast", CursorPosition::new(2, 1));
        mgr.register_cursor("slow", CursorKind::Stream);

        let dropped = mgr.drop_slowest_stream_cursor().unwrap();
        assert_eq!(dropped, "slow");
        assert!(mgr.cursor_position("slow").is_none());
        assert!(mgr.cursor_position("fast").is_some());
    }

    #[test]
    fn closed_checkpoint_with_no_cursors_is_removable() {
        let mut mgr = manager();
        mgr.queue_item(None, |seqno| mutation("a", seqno));
        mgr.force_new_checkpoint(CheckpointType::Memory);
        // persistence cursor still at checkpoint 1, offset 0 -- not removable yet.
        assert!(mgr.remove_unreferenced_closed_checkpoints().is_empty());

        // advance past everything in checkpoint 1.
        mgr.advance_cursor_to(PERSISTENCE_CURSOR, CursorPosition::new(2, 0));
        let removed = mgr.remove_unreferenced_closed_checkpoints();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id(), 1);
    }
}
