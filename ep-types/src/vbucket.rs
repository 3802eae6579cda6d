//! VBucket identity and persisted state record.

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointId;
use crate::durability::Topology;
use crate::item::BySeqno;

pub type VBucketId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VBucketStateName {
    Active,
    Replica,
    Pending,
    Dead,
}

/// One entry of the failover log: an epoch and the seqno at which it began,
/// used by replication to detect divergence after a node failure. Kept
/// narrow here since the failover/rollback protocol itself lives outside
/// this core; only the field this core must persist is modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    pub epoch: u64,
    pub seqno: BySeqno,
}

/// The `vbucket_state` record persisted alongside every flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VBucketStateRecord {
    pub state: VBucketStateName,
    pub topology: Option<Topology>,
    pub high_seqno: BySeqno,
    pub high_prepared_seqno: BySeqno,
    pub high_completed_seqno: BySeqno,
    pub max_cas: u64,
    pub failover_table: Vec<FailoverEntry>,
    pub purge_seqno: BySeqno,
    pub max_visible_seqno: BySeqno,
    pub checkpoint_id: CheckpointId,
    pub might_contain_xattrs: bool,
    pub hlc_epoch_seqno: BySeqno,
    /// Items actually resident in the committed keyspace on disk: bumped on
    /// a flush that inserts a brand new key, dropped on a flush that
    /// persists its tombstone. Distinct from the vBucket's in-memory
    /// `numItems`, which tracks the live committed key space and moves the
    /// instant a mutation applies rather than once it reaches disk.
    pub disk_item_count: i64,
}

impl VBucketStateRecord {
    pub fn new_empty(state: VBucketStateName) -> Self {
        Self {
            state,
            topology: None,
            high_seqno: 0,
            high_prepared_seqno: 0,
            high_completed_seqno: 0,
            max_cas: 0,
            failover_table: Vec::new(),
            purge_seqno: 0,
            max_visible_seqno: 0,
            checkpoint_id: 0,
            might_contain_xattrs: false,
            hlc_epoch_seqno: 0,
            disk_item_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Round-trip invariant: restoring a persisted record must reproduce the
    /// original state exactly. The serialization itself is exercised here;
    /// persistence through the KVStore is covered in `ep-kvstore`.
    #[test]
    fn vbucket_state_round_trips_through_bincode() {
        let mut record = VBucketStateRecord::new_empty(VBucketStateName::Active);
        record.high_seqno = 42;
        record.topology = Some(Topology::new(vec!["a".into(), "b".into()]).unwrap());
        record.disk_item_count = 7;

        let bytes = bincode::serialize(&record).unwrap();
        let restored: VBucketStateRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(record, restored);
    }
}
