//! Active-role `DurabilityMonitor`: tracks outstanding Prepares for a
//! vBucket this node leads and applies the exact commit rule below.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use ep_metrics::DurabilityMetrics;
use ep_types::{BySeqno, DurabilityLevel, DurabilityRequirements, EpError, Key, NodeId, Topology};

use super::cookie::PendingCookie;

pub struct PrepareEntry {
    pub key: Key,
    pub seqno: BySeqno,
    pub requirements: DurabilityRequirements,
    pub deadline: Instant,
    pub acked_by: HashSet<NodeId>,
    pub active_persisted: bool,
    pub persist_acks: HashSet<NodeId>,
    /// Set when this entry was migrated from a Passive monitor during
    /// takeover with a locally-persisted value; such a Prepare commits the
    /// instant a valid topology is set, bypassing the normal rule.
    pub takeover_immediate: bool,
    pub cookie: Option<PendingCookie>,
}

/// A Prepare migrated in from a Passive monitor on a Passive→Active role
/// switch, already locally persisted or not.
pub struct MigratedPrepare {
    pub key: Key,
    pub seqno: BySeqno,
    pub requirements: DurabilityRequirements,
    pub deadline: Instant,
    pub locally_persisted: bool,
    pub cookie: Option<PendingCookie>,
}

/// Outcome of a Prepare leaving the tracker: the QueuedItem the VBucket
/// should append (Commit or Abort) plus the cookie to notify.
pub enum Resolution {
    Committed { key: Key, prepare_seqno: BySeqno, cookie: Option<PendingCookie> },
    Aborted { key: Key, prepare_seqno: BySeqno, cookie: Option<PendingCookie>, reason: EpError },
}

pub struct ActiveDurabilityMonitor {
    topology: Option<Topology>,
    tracked: BTreeMap<BySeqno, PrepareEntry>,
    metrics: DurabilityMetrics,
}

impl ActiveDurabilityMonitor {
    pub fn new(topology: Option<Topology>, metrics: DurabilityMetrics) -> Self {
        Self { topology, tracked: BTreeMap::new(), metrics }
    }

    pub fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref()
    }

    pub fn num_tracked(&self) -> usize {
        self.tracked.len()
    }

    /// Starts tracking a new Prepare, seeded with the Active's own
    /// implicit acknowledgement.
    pub fn track(&mut self, key: Key, seqno: BySeqno, requirements: DurabilityRequirements, deadline: Instant, cookie: PendingCookie) {
        let mut acked_by = HashSet::new();
        if let Some(topology) = &self.topology {
            acked_by.insert(topology.active().clone());
        }
        self.tracked.insert(
            seqno,
            PrepareEntry {
                key,
                seqno,
                requirements,
                deadline,
                acked_by,
                active_persisted: false,
                persist_acks: HashSet::new(),
                takeover_immediate: false,
                cookie: Some(cookie),
            },
        );
        self.metrics.prepares_tracked.set(self.tracked.len() as i64);
    }

    /// Records a replica's acknowledgement up to `up_to` and commits
    /// whatever that newly makes eligible, in seqno order. A replica only
    /// raises its ack once the item is durable on its side, so for a level
    /// that requires replica persistence this also counts as that
    /// replica's persistence-ack.
    pub fn seqno_ack(&mut self, node: &str, up_to: BySeqno) -> Vec<Resolution> {
        for entry in self.tracked.values_mut() {
            if entry.seqno <= up_to {
                entry.acked_by.insert(node.to_string());
                if entry.requirements.level.requires_replica_persistence() {
                    entry.persist_acks.insert(node.to_string());
                }
            }
        }
        self.drain_committable()
    }

    /// Records that the local node has persisted up to `seqno`, counting
    /// as both a persistence-ack and an ordinary ack from the Active.
    pub fn persisted_up_to(&mut self, seqno: BySeqno) -> Vec<Resolution> {
        let active = self.topology.as_ref().map(|t| t.active().clone());
        for entry in self.tracked.values_mut() {
            if entry.seqno <= seqno {
                entry.active_persisted = true;
                if let Some(active) = &active {
                    entry.persist_acks.insert(active.clone());
                }
            }
        }
        self.drain_committable()
    }

    /// Aborts every Prepare whose deadline has elapsed, notifying
    /// `SyncWriteAmbiguous`.
    pub fn tick(&mut self, now: Instant) -> Vec<Resolution> {
        let expired: Vec<BySeqno> = self
            .tracked
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(&seqno, _)| seqno)
            .collect();

        let mut out = Vec::new();
        for seqno in expired {
            if let Some(mut entry) = self.tracked.remove(&seqno) {
                self.metrics.prepares_timed_out_total.inc();
                out.push(Resolution::Aborted {
                    key: entry.key.clone(),
                    prepare_seqno: entry.seqno,
                    cookie: entry.cookie.take(),
                    reason: EpError::SyncWriteAmbiguous,
                });
            }
        }
        self.metrics.prepares_tracked.set(self.tracked.len() as i64);
        out
    }

    /// Re-evaluates every tracked Prepare against the new chain.
    /// `Topology::new` already rejects chains of length >3 with
    /// `DurabilityImpossible` before this is reached.
    pub fn set_topology(&mut self, topology: Topology) -> Vec<Resolution> {
        self.topology = Some(topology);
        self.drain_committable()
    }

    /// Dead-state transition: abort everything in flight. Not used for an
    /// ordinary Active→Passive switch, which migrates Prepares instead --
    /// see [`Self::take_all_for_role_switch`].
    pub fn abort_all(&mut self) -> Vec<Resolution> {
        let mut out = Vec::new();
        for (_, mut entry) in std::mem::take(&mut self.tracked) {
            out.push(Resolution::Aborted {
                key: entry.key.clone(),
                prepare_seqno: entry.seqno,
                cookie: entry.cookie.take(),
                reason: EpError::SyncWriteAmbiguous,
            });
        }
        self.metrics.prepares_tracked.set(0);
        out
    }

    /// Drains every tracked Prepare for an Active→Passive role switch
    /// (e.g. failover demoting this node to Replica), migrating them
    /// rather than aborting: the new Active will eventually Commit or
    /// Abort each one, and the original cookie travels along to be
    /// notified then.
    pub fn take_all_for_role_switch(&mut self) -> Vec<MigratedPrepare> {
        let tracked = std::mem::take(&mut self.tracked);
        self.metrics.prepares_tracked.set(0);
        tracked
            .into_values()
            .map(|entry| MigratedPrepare {
                key: entry.key,
                seqno: entry.seqno,
                requirements: entry.requirements,
                deadline: entry.deadline,
                locally_persisted: entry.active_persisted,
                cookie: entry.cookie,
            })
            .collect()
    }

    /// Absorbs Prepares migrated in from a Passive role on takeover; they
    /// remain tracked until a valid topology is set.
    pub fn migrate_from_passive(&mut self, migrated: Vec<MigratedPrepare>) {
        for m in migrated {
            let mut acked_by = HashSet::new();
            let mut persist_acks = HashSet::new();
            if m.locally_persisted {
                if let Some(topology) = &self.topology {
                    persist_acks.insert(topology.active().clone());
                }
            }
            if let Some(topology) = &self.topology {
                acked_by.insert(topology.active().clone());
            }
            self.tracked.insert(
                m.seqno,
                PrepareEntry {
                    key: m.key,
                    seqno: m.seqno,
                    requirements: m.requirements,
                    deadline: m.deadline,
                    acked_by,
                    active_persisted: m.locally_persisted,
                    persist_acks,
                    takeover_immediate: m.locally_persisted,
                    cookie: m.cookie,
                },
            );
        }
        self.metrics.prepares_tracked.set(self.tracked.len() as i64);
    }

    fn is_committable(&self, entry: &PrepareEntry) -> bool {
        let Some(topology) = &self.topology else { return false };
        if entry.takeover_immediate {
            return true;
        }
        let m = topology.majority();
        if entry.acked_by.len() < m {
            return false;
        }
        let level = entry.requirements.level;
        if level.requires_active_persistence() && !entry.active_persisted {
            return false;
        }
        if level == DurabilityLevel::PersistToMajority && entry.persist_acks.len() < m {
            return false;
        }
        true
    }

    /// Commits every Prepare eligible under [`Self::is_committable`],
    /// stopping at the first non-eligible one since commits must happen in
    /// seqno order (iterating a `BTreeMap` ascending gives us that for free).
    fn drain_committable(&mut self) -> Vec<Resolution> {
        let mut out = Vec::new();
        loop {
            let Some((&seqno, _)) = self.tracked.iter().next() else { break };
            let committable = {
                let entry = self.tracked.get(&seqno).unwrap();
                self.is_committable(entry)
            };
            if !committable {
                break;
            }
            let mut entry = self.tracked.remove(&seqno).unwrap();
            self.metrics.prepares_committed_total.inc();
            out.push(Resolution::Committed { key: entry.key.clone(), prepare_seqno: entry.seqno, cookie: entry.cookie.take() });
        }
        self.metrics.prepares_tracked.set(self.tracked.len() as i64);
        out
    }
}
