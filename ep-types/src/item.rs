//! `QueuedItem` and its constituent small types.

use serde::{Deserialize, Serialize};

use crate::cas::Cas;
use crate::durability::DurabilityRequirements;
use crate::key::Key;

/// `bySeqno`: strictly monotonic per-vBucket sequence number. `0` is
/// reserved; the first item assigned in a vBucket gets seqno 1.
pub type BySeqno = u64;

/// `revSeqno`: per-key revision counter, incremented on every mutation of a
/// key regardless of vBucket-wide seqno assignment.
pub type RevSeqno = u64;

/// Datatype flags describing the encoding of `QueuedItem::value`. Modeled as
/// a small flag set rather than a `bitflags!`-derived type to keep the
/// dependency surface narrow; combinations are validated where constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Datatype {
    pub json: bool,
    pub snappy: bool,
    pub xattr: bool,
}

impl Datatype {
    pub const RAW: Datatype = Datatype { json: false, snappy: false, xattr: false };

    pub fn is_raw(&self) -> bool {
        !self.json && !self.snappy && !self.xattr
    }
}

/// The operation a `QueuedItem` represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Mutation,
    Deletion,
    Expiration,
    PendingSyncWrite,
    CommitSyncWrite,
    AbortSyncWrite,
    CheckpointStart,
    CheckpointEnd,
    SetVBucketState,
}

impl OperationType {
    /// Items whose operation always forces a brand new Checkpoint rather
    /// than being appended to (and deduplicated within) the open one.
    /// Commit/Abort always open new; a Prepare does too when the open
    /// checkpoint already holds a committed mutation for the same key
    /// (handled by the caller, not here).
    pub fn always_opens_new_checkpoint(&self) -> bool {
        matches!(self, OperationType::CommitSyncWrite | OperationType::AbortSyncWrite)
    }

    pub fn is_sync_write_related(&self) -> bool {
        matches!(
            self,
            OperationType::PendingSyncWrite
                | OperationType::CommitSyncWrite
                | OperationType::AbortSyncWrite
        )
    }
}

/// The committed-state discriminator carried by a `QueuedItem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommittedState {
    CommittedViaMutation,
    CommittedViaPrepare,
    Pending,
    PrepareCommitted,
    PrepareAborted,
}

/// One record in the per-vBucket ordered log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedItem {
    pub key: Key,
    pub value: Vec<u8>,
    pub datatype: Datatype,
    pub flags: u32,
    pub expiry: u32,
    pub cas: Cas,
    pub by_seqno: BySeqno,
    pub rev_seqno: RevSeqno,
    pub operation: OperationType,
    pub committed_state: CommittedState,
    pub durability: Option<DurabilityRequirements>,
    /// True for a `PendingSyncWrite` whose payload is a delete rather than
    /// a mutation; meaningless for every other `operation`. An explicit
    /// discriminator rather than a value/flags sentinel, so a client's own
    /// flags never collide with the classification.
    pub sync_delete: bool,
}

impl QueuedItem {
    pub fn is_deleted(&self) -> bool {
        matches!(self.operation, OperationType::Deletion | OperationType::Expiration)
    }

    /// True for a Prepare whose payload is a delete.
    pub fn is_sync_delete(&self) -> bool {
        self.operation == OperationType::PendingSyncWrite && self.sync_delete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_datatype_has_no_flags_set() {
        assert!(Datatype::RAW.is_raw());
        assert!(!Datatype { json: true, ..Default::default() }.is_raw());
    }

    #[test]
    fn commit_and_abort_always_open_new_checkpoint() {
        assert!(OperationType::CommitSyncWrite.always_opens_new_checkpoint());
        assert!(OperationType::AbortSyncWrite.always_opens_new_checkpoint());
        assert!(!OperationType::Mutation.always_opens_new_checkpoint());
    }
}
