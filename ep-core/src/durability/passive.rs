//! Passive-role `DurabilityMonitor`: tracks Prepares replicated to this
//! node from the Active and waits on local persistence, not peer acks.

use std::collections::BTreeMap;
use std::time::Instant;

use ep_metrics::DurabilityMetrics;
use ep_types::{BySeqno, DurabilityRequirements, Key};

use super::active::MigratedPrepare;
use super::cookie::PendingCookie;

struct TrackedPrepare {
    key: Key,
    seqno: BySeqno,
    requirements: DurabilityRequirements,
    deadline: Instant,
    persisted: bool,
    cookie: Option<PendingCookie>,
}

pub struct PassiveDurabilityMonitor {
    tracked: BTreeMap<BySeqno, TrackedPrepare>,
    high_prepared_seqno: BySeqno,
    metrics: DurabilityMetrics,
}

impl PassiveDurabilityMonitor {
    pub fn new(metrics: DurabilityMetrics) -> Self {
        Self { tracked: BTreeMap::new(), high_prepared_seqno: 0, metrics }
    }

    pub fn high_prepared_seqno(&self) -> BySeqno {
        self.high_prepared_seqno
    }

    pub fn num_tracked(&self) -> usize {
        self.tracked.len()
    }

    /// A Prepare arrives as part of a replication snapshot.
    pub fn track(&mut self, key: Key, seqno: BySeqno, requirements: DurabilityRequirements, deadline: Instant, cookie: Option<PendingCookie>) {
        self.tracked.insert(seqno, TrackedPrepare { key, seqno, requirements, deadline, persisted: false, cookie });
        self.metrics.prepares_tracked.set(self.tracked.len() as i64);
    }

    /// Local Flusher confirms persistence of this Prepare's seqno.
    pub fn on_persisted(&mut self, seqno: BySeqno) {
        if let Some(entry) = self.tracked.get_mut(&seqno) {
            entry.persisted = true;
        }
    }

    /// Advances high-prepared-seqno (HPS) to the replicated snapshot's
    /// end on receipt of its snapshot-end marker.
    pub fn snapshot_end(&mut self, end_seqno: BySeqno) {
        if end_seqno > self.high_prepared_seqno {
            self.high_prepared_seqno = end_seqno;
        }
    }

    /// Removes the tracked Prepare on a Commit replicated from the
    /// Active; the caller applies it to the hash table and appends
    /// CommitSyncWrite.
    pub fn on_commit(&mut self, seqno: BySeqno) -> Option<(Key, Option<PendingCookie>)> {
        self.tracked.remove(&seqno).map(|entry| {
            self.metrics.prepares_committed_total.inc();
            self.metrics.prepares_tracked.set(self.tracked.len() as i64);
            (entry.key, entry.cookie)
        })
    }

    pub fn on_abort(&mut self, seqno: BySeqno) -> Option<(Key, Option<PendingCookie>)> {
        self.tracked.remove(&seqno).map(|entry| {
            self.metrics.prepares_aborted_total.inc();
            self.metrics.prepares_tracked.set(self.tracked.len() as i64);
            (entry.key, entry.cookie)
        })
    }

    /// Absorbs Prepares migrated in from an Active role on an Active→Passive
    /// switch (e.g. failover demoting this node to Replica). They stay
    /// tracked exactly as if received over DCP, and resolve when a
    /// Commit/Abort for their seqno arrives from the new Active.
    pub fn absorb_from_active(&mut self, migrated: Vec<MigratedPrepare>) {
        for m in migrated {
            self.tracked.insert(
                m.seqno,
                TrackedPrepare {
                    key: m.key,
                    seqno: m.seqno,
                    requirements: m.requirements,
                    deadline: m.deadline,
                    persisted: m.locally_persisted,
                    cookie: m.cookie,
                },
            );
        }
        self.metrics.prepares_tracked.set(self.tracked.len() as i64);
    }

    /// Drains every tracked Prepare for a Passive→Active role switch; a
    /// takeover retains all outstanding Prepares rather than aborting them.
    pub fn take_all_for_takeover(&mut self) -> Vec<MigratedPrepare> {
        let tracked = std::mem::take(&mut self.tracked);
        self.metrics.prepares_tracked.set(0);
        tracked
            .into_values()
            .map(|entry| MigratedPrepare {
                key: entry.key,
                seqno: entry.seqno,
                requirements: entry.requirements,
                deadline: entry.deadline,
                locally_persisted: entry.persisted,
                cookie: entry.cookie,
            })
            .collect()
    }
}
