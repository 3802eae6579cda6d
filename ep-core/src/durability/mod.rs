//! DurabilityMonitor: tracks in-flight Prepares and applies the
//! commit/abort rules for a vBucket's replication chain. Two roles share one
//! handle so a VBucket state transition can switch roles in place without
//! losing outstanding Prepares: a role switch transfers outstanding
//! Prepares across rather than discarding them.

pub mod active;
pub mod cookie;
pub mod passive;

pub use active::{ActiveDurabilityMonitor, MigratedPrepare, Resolution};
pub use cookie::{pending_cookie, CookieWaiter, PendingCookie};
pub use passive::PassiveDurabilityMonitor;

use std::sync::Arc;
use std::time::{Duration, Instant};

use ep_metrics::DurabilityMetrics;
use ep_types::Topology;
use parking_lot::Mutex;

/// The role a vBucket's DurabilityMonitor currently plays. Role switches
/// migrate tracked Prepares rather than discarding them.
pub enum DurabilityMonitor {
    Active(ActiveDurabilityMonitor),
    Passive(PassiveDurabilityMonitor),
}

impl DurabilityMonitor {
    pub fn new_active(topology: Option<Topology>, metrics: DurabilityMetrics) -> Self {
        DurabilityMonitor::Active(ActiveDurabilityMonitor::new(topology, metrics))
    }

    pub fn new_passive(metrics: DurabilityMetrics) -> Self {
        DurabilityMonitor::Passive(PassiveDurabilityMonitor::new(metrics))
    }

    pub fn as_active(&self) -> Option<&ActiveDurabilityMonitor> {
        match self {
            DurabilityMonitor::Active(a) => Some(a),
            DurabilityMonitor::Passive(_) => None,
        }
    }

    pub fn as_active_mut(&mut self) -> Option<&mut ActiveDurabilityMonitor> {
        match self {
            DurabilityMonitor::Active(a) => Some(a),
            DurabilityMonitor::Passive(_) => None,
        }
    }

    pub fn as_passive_mut(&mut self) -> Option<&mut PassiveDurabilityMonitor> {
        match self {
            DurabilityMonitor::Active(_) => None,
            DurabilityMonitor::Passive(p) => Some(p),
        }
    }

    /// Switches this monitor to Active, migrating any Passive-tracked
    /// Prepares across on takeover.
    pub fn switch_to_active(&mut self, topology: Option<Topology>, metrics: DurabilityMetrics) {
        let migrated = match self {
            DurabilityMonitor::Passive(p) => p.take_all_for_takeover(),
            DurabilityMonitor::Active(_) => Vec::new(),
        };
        let mut active = ActiveDurabilityMonitor::new(topology, metrics);
        active.migrate_from_passive(migrated);
        *self = DurabilityMonitor::Active(active);
    }

    /// Switches this monitor to Passive, migrating any Active-tracked
    /// Prepares across rather than aborting them -- a node demoted from
    /// Active to Replica (e.g. on failover) keeps tracking its outstanding
    /// Prepares, now waiting on Commit/Abort from the new Active instead of
    /// on chain acks. Aborting in-flight Prepares outright is reserved for
    /// the Dead-state transition, handled separately by the caller.
    pub fn switch_to_passive(&mut self, metrics: DurabilityMetrics) {
        let migrated = match self {
            DurabilityMonitor::Active(a) => a.take_all_for_role_switch(),
            DurabilityMonitor::Passive(_) => Vec::new(),
        };
        let mut passive = PassiveDurabilityMonitor::new(metrics);
        passive.absorb_from_active(migrated);
        *self = DurabilityMonitor::Passive(passive);
    }
}

/// Periodically calls
/// `tick(now)` on every vBucket's DurabilityMonitor so a Prepare past its
/// deadline gets aborted even if no further seqno-ack or persisted-seqno
/// event would otherwise drive it.
pub struct DurabilityTimeoutTask;

impl DurabilityTimeoutTask {
    pub async fn run(vbuckets: Arc<Vec<Mutex<crate::vbucket::VBucket>>>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            for vb in vbuckets.iter() {
                vb.lock().tick_durability(now);
            }
        }
    }
}
