//! `Checkpoint`, the ordered in-memory segment of queued items. Uses an
//! arena-addressed design instead of a pointer-heavy shared-owned graph:
//! checkpoints live in an arena inside
//! [`crate::checkpoint_manager::CheckpointManager`] addressed by a small
//! integer id, and a [`Cursor`] is just `(checkpoint id, offset)`. Expelling
//! clears a slot to `None` rather than shrinking the vector, so every
//! position assigned before expelling stays valid.

use std::collections::HashMap;

use ep_types::{BySeqno, CheckpointId, CheckpointState, CheckpointType, Key, OperationType, QueuedItem, SnapshotRange};

/// Offset of an item within one [`Checkpoint`]'s item vector.
pub type Offset = usize;

/// Result of [`Checkpoint::push`]: where the item landed, and the item it
/// replaced if this push deduplicated an existing committed-space entry for
/// the same key.
#[derive(Debug)]
pub struct PushOutcome {
    pub position: Offset,
    pub replaced: Option<QueuedItem>,
}

/// True for operations whose committed-space entries dedup within a
/// Checkpoint: the same key within a Checkpoint deduplicates committed-space
/// mutations, but a Prepare/Commit/Abort is always appended fresh.
fn is_dedupable(op: OperationType) -> bool {
    matches!(op, OperationType::Mutation | OperationType::Deletion | OperationType::Expiration)
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    id: CheckpointId,
    checkpoint_type: CheckpointType,
    state: CheckpointState,
    snapshot: SnapshotRange,
    /// `None` marks an expelled slot; the slot itself is kept so offsets
    /// assigned before expelling remain valid addresses.
    items: Vec<Option<QueuedItem>>,
    /// Position of the live committed-space entry for a key, for dedup.
    committed_index: HashMap<Key, Offset>,
    high_completed_seqno: Option<BySeqno>,
}

impl Checkpoint {
    pub fn new(id: CheckpointId, checkpoint_type: CheckpointType, start_seqno: BySeqno) -> Self {
        Self {
            id,
            checkpoint_type,
            state: CheckpointState::Open,
            snapshot: SnapshotRange::singleton(start_seqno),
            items: Vec::new(),
            committed_index: HashMap::new(),
            high_completed_seqno: None,
        }
    }

    pub fn id(&self) -> CheckpointId {
        self.id
    }

    pub fn checkpoint_type(&self) -> CheckpointType {
        self.checkpoint_type
    }

    pub fn state(&self) -> CheckpointState {
        self.state
    }

    pub fn snapshot(&self) -> SnapshotRange {
        self.snapshot
    }

    pub fn is_open(&self) -> bool {
        self.state == CheckpointState::Open
    }

    /// Appends `item`, deduplicating a prior committed-space entry for the
    /// same key in place (same offset, so cursor positions already issued
    /// stay valid). Non-dedupable operations (Prepare/Commit/Abort/meta
    /// items) are always appended fresh.
    pub fn push(&mut self, item: QueuedItem) -> PushOutcome {
        self.snapshot.extend_to(item.by_seqno);

        if is_dedupable(item.operation) {
            if let Some(&pos) = self.committed_index.get(&item.key) {
                let replaced = self.items[pos].replace(item);
                return PushOutcome { position: pos, replaced };
            }
            let pos = self.items.len();
            self.committed_index.insert(item.key.clone(), pos);
            self.items.push(Some(item));
            return PushOutcome { position: pos, replaced: None };
        }

        let pos = self.items.len();
        self.items.push(Some(item));
        PushOutcome { position: pos, replaced: None }
    }

    /// True if this Checkpoint already holds a live committed-space mutation
    /// for `key` -- the CheckpointManager consults this before appending a
    /// Prepare to decide whether a new Checkpoint must be opened first.
    pub fn has_committed_entry_for(&self, key: &Key) -> bool {
        self.committed_index.contains_key(key)
    }

    pub fn close(&mut self, high_completed_seqno: BySeqno) {
        self.state = CheckpointState::Closed;
        self.high_completed_seqno = Some(high_completed_seqno);
    }

    pub fn high_completed_seqno(&self) -> Option<BySeqno> {
        self.high_completed_seqno
    }

    /// Total number of offsets assigned, live or expelled -- the length a
    /// cursor's offset is bounded by.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, offset: Offset) -> Option<&QueuedItem> {
        self.items.get(offset).and_then(|slot| slot.as_ref())
    }

    pub fn live_items(&self) -> impl Iterator<Item = &QueuedItem> {
        self.items.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn num_live_items(&self) -> usize {
        self.items.iter().filter(|slot| slot.is_some()).count()
    }

    /// Approximate in-memory footprint, used by the remover to rank
    /// checkpoints by reclaimable memory.
    pub fn memory_usage(&self) -> usize {
        self.items
            .iter()
            .filter_map(|slot| slot.as_ref())
            .map(|item| item.key.bytes().len() + item.value.len() + 64)
            .sum()
    }

    /// Clears every live slot at offset `< below_offset`, returning
    /// `(count_cleared, bytes_freed)`. Only offsets below all registered
    /// cursors may be cleared.
    pub fn expel_below(&mut self, below_offset: Offset) -> (usize, usize) {
        let mut count = 0;
        let mut bytes = 0;
        for slot in self.items.iter_mut().take(below_offset) {
            if let Some(item) = slot.take() {
                bytes += item.key.bytes().len() + item.value.len() + 64;
                count += 1;
            }
        }
        (count, bytes)
    }
}

/// A consumer's position into the Checkpoint arena: a
/// `(checkpoint id, offset)` pair rather than a pointer into a shared graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CursorPosition {
    pub checkpoint_id: CheckpointId,
    pub offset: Offset,
}

impl CursorPosition {
    pub fn new(checkpoint_id: CheckpointId, offset: Offset) -> Self {
        Self { checkpoint_id, offset }
    }
}

pub type CursorName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Persistence,
    Stream,
}

#[derive(Debug, Clone)]
pub struct Cursor {
    pub name: CursorName,
    pub kind: CursorKind,
    pub position: CursorPosition,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ep_types::{Cas, CommittedState, Datatype, RevSeqno};

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

    #[test]
    fn dedup_keeps_same_offset_and_reports_replaced_item() {
        let mut cp = Checkpoint::new(1, CheckpointType::Memory, 1);
        let first = cp.push(mutation("a", 1));
        assert_eq!(first.position, 0);
        assert!(first.replaced.is_none());

        let second = cp.push(mutation("a", 2));
        assert_eq!(second.position, 0);
        assert_eq!(second.replaced.unwrap().by_seqno, 1);

        assert_eq!(cp.len(), 1);
        assert_eq!(cp.get(0).unwrap().by_seqno, 2);
    }

    #[test]
    fn expel_preserves_offsets_for_later_items() {
        let mut cp = Checkpoint::new(1, CheckpointType::Memory, 1);
        cp.push(mutation("a", 1));
        cp.push(mutation("b", 2));
        cp.push(mutation("c", 3));

        let (count, bytes) = cp.expel_below(2);
        assert_eq!(count, 2);
        assert!(bytes > 0);
        assert!(cp.get(0).is_none());
        assert!(cp.get(1).is_none());
        assert_eq!(cp.get(2).unwrap().by_seqno, 3);
        assert_eq!(cp.len(), 3);
    }
}
