//! Read-only stats snapshots. Wire-level `STAT` command rendering lives
//! outside this core, but the ambient counters a running engine always
//! tracks internally do not -- these feed `ep-metrics`' Prometheus gauges
//! and are also useful directly in tests.

use ep_types::{BySeqno, VBucketId, VBucketStateName};

#[derive(Debug, Clone, Copy)]
pub struct CheckpointManagerStats {
    pub num_checkpoints: usize,
    pub memory_usage_bytes: usize,
    pub items_for_persistence: usize,
    pub high_seqno: BySeqno,
    pub high_completed_seqno: BySeqno,
}

#[derive(Debug, Clone, Copy)]
pub struct VBucketStats {
    pub vbid: VBucketId,
    pub state: VBucketStateName,
    pub num_items: i64,
    pub disk_item_count: i64,
    pub num_prepared: usize,
    pub high_seqno: BySeqno,
    pub high_prepared_seqno: BySeqno,
    pub high_completed_seqno: BySeqno,
    pub checkpoint: CheckpointManagerStats,
}
