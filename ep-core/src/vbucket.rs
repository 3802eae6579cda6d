//! `VBucket`: integrates the hash table, CheckpointManager and
//! DurabilityMonitor behind the set/add/replace/delete/commit/abort surface.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ep_types::{
    BySeqno, Cas, CollectionId, CommittedState, Datatype, EpError, EpResult, FailoverEntry, HlcClock, Key,
    DurabilityRequirements, NodeId, OperationType, QueuedItem, RevSeqno, Topology, VBucketId, VBucketStateName,
    VBucketStateRecord,
};

use tracing::{debug, warn};

use crate::checkpoint::CursorKind;
use crate::checkpoint_manager::{CheckpointManager, CheckpointManagerConfig, PERSISTENCE_CURSOR};
use crate::context::RuntimeContext;
use crate::durability::{pending_cookie, CookieWaiter, DurabilityMonitor, PendingCookie, Resolution};

/// Whether this vBucket is backed by persistent or ephemeral storage: an
/// Ephemeral bucket cannot accept PersistToMajority or
/// MajorityAndPersistOnMaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketType {
    Persistent,
    Ephemeral,
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    datatype: Datatype,
    flags: u32,
    expiry: u32,
    cas: Cas,
    seqno: BySeqno,
    rev_seqno: RevSeqno,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Set,
    Add,
    Replace,
}

pub struct MutationRequest {
    pub key: Key,
    pub value: Vec<u8>,
    pub datatype: Datatype,
    pub flags: u32,
    pub expiry: u32,
    pub cas: Option<Cas>,
}

/// What a call that did *not* request durability returns immediately.
#[derive(Debug, Clone, Copy)]
pub struct Applied {
    pub seqno: BySeqno,
    pub cas: Cas,
}

pub enum WriteOutcome {
    Applied(Applied),
    /// A Prepare was created; the caller must await `waiter` for the
    /// definitive result: returns `WouldBlock`, and a later Commit/Abort
    /// notifies the cookie.
    Pending { prepare_seqno: BySeqno, waiter: CookieWaiter },
}

/// What an outstanding Prepare will do to the hash table once it resolves --
/// stashed alongside the DurabilityMonitor's own bookkeeping since the
/// monitor only knows about keys and seqnos, not payloads. Holds the
/// pending value until Commit or Abort.
struct PendingWrite {
    collection: CollectionId,
    is_insert: bool,
    sync_delete: bool,
    value: Vec<u8>,
    datatype: Datatype,
    flags: u32,
    expiry: u32,
    cas: Cas,
    rev_seqno: RevSeqno,
}

pub struct VBucket {
    vbid: VBucketId,
    bucket_type: BucketType,
    state: VBucketStateName,
    topology: Option<Topology>,
    clock: HlcClock,
    committed: HashMap<Key, StoredValue>,
    prepared: HashMap<Key, PendingWrite>,
    collection_counts: HashMap<CollectionId, i64>,
    checkpoint_manager: CheckpointManager,
    durability: DurabilityMonitor,
    max_cas: Cas,
    purge_seqno: BySeqno,
    max_visible_seqno: BySeqno,
    failover_table: Vec<FailoverEntry>,
    hlc_epoch_seqno: BySeqno,
    might_contain_xattrs: bool,
    disk_item_count: i64,
    ctx: RuntimeContext,
}

impl VBucket {
    pub fn new(vbid: VBucketId, bucket_type: BucketType, state: VBucketStateName, topology: Option<Topology>, ctx: RuntimeContext) -> Self {
        let durability = match state {
            VBucketStateName::Active => DurabilityMonitor::new_active(topology.clone(), ctx.durability_metrics.clone()),
            _ => DurabilityMonitor::new_passive(ctx.durability_metrics.clone()),
        };
        let cm_config = CheckpointManagerConfig { item_count_threshold: ctx.config.checkpoint_item_count_threshold };
        Self {
            vbid,
            bucket_type,
            state,
            topology,
            clock: HlcClock::new(),
            committed: HashMap::new(),
            prepared: HashMap::new(),
            collection_counts: HashMap::new(),
            checkpoint_manager: CheckpointManager::new(vbid, cm_config, ctx.checkpoint_manager_metrics.clone()),
            durability,
            max_cas: 0,
            purge_seqno: 0,
            max_visible_seqno: 0,
            failover_table: Vec::new(),
            hlc_epoch_seqno: 0,
            might_contain_xattrs: false,
            disk_item_count: 0,
            ctx,
        }
    }

    /// Resumes a vBucket from a persisted `vbucket_state` record on warmup.
    /// The hash table itself is rebuilt separately by replaying a KVStore
    /// scan; this only restores the scalar bookkeeping the record carries.
    pub fn resume(vbid: VBucketId, bucket_type: BucketType, record: VBucketStateRecord, ctx: RuntimeContext) -> Self {
        let durability = match record.state {
            VBucketStateName::Active => DurabilityMonitor::new_active(record.topology.clone(), ctx.durability_metrics.clone()),
            _ => DurabilityMonitor::new_passive(ctx.durability_metrics.clone()),
        };
        let cm_config = CheckpointManagerConfig { item_count_threshold: ctx.config.checkpoint_item_count_threshold };
        Self {
            vbid,
            bucket_type,
            state: record.state,
            topology: record.topology,
            clock: HlcClock::with_floor(record.max_cas),
            committed: HashMap::new(),
            prepared: HashMap::new(),
            collection_counts: HashMap::new(),
            checkpoint_manager: CheckpointManager::resume(
                vbid,
                cm_config,
                ctx.checkpoint_manager_metrics.clone(),
                record.high_seqno,
                record.high_completed_seqno,
            ),
            durability,
            max_cas: record.max_cas,
            purge_seqno: record.purge_seqno,
            max_visible_seqno: record.max_visible_seqno,
            failover_table: record.failover_table,
            hlc_epoch_seqno: record.hlc_epoch_seqno,
            might_contain_xattrs: record.might_contain_xattrs,
            disk_item_count: record.disk_item_count,
            ctx,
        }
    }

    /// Seeds the committed hash table and per-collection counts from a
    /// KVStore scan taken on warmup. Called once per vBucket before serving
    /// traffic; `ep-server`'s startup path owns the scan itself.
    pub fn seed_committed(&mut self, key: Key, value: Vec<u8>, datatype: Datatype, flags: u32, expiry: u32, cas: Cas, seqno: BySeqno, rev_seqno: RevSeqno) {
        let collection = key.collection();
        if self.committed.insert(key, StoredValue { value, datatype, flags, expiry, cas, seqno, rev_seqno }).is_none() {
            self.bump_collection_count(collection, 1);
        }
        self.max_cas = self.max_cas.max(cas);
    }

    pub fn vbid(&self) -> VBucketId {
        self.vbid
    }

    pub fn state(&self) -> VBucketStateName {
        self.state
    }

    pub fn get(&self, key: &Key) -> EpResult<(Vec<u8>, Cas, Datatype, u32)> {
        self.committed
            .get(key)
            .map(|sv| (sv.value.clone(), sv.cas, sv.datatype, sv.flags))
            .ok_or(EpError::KeyNotFound)
    }

    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoint_manager
    }

    pub fn checkpoint_manager_mut(&mut self) -> &mut CheckpointManager {
        &mut self.checkpoint_manager
    }

    pub fn durability(&self) -> &DurabilityMonitor {
        &self.durability
    }

    pub fn num_items(&self) -> i64 {
        self.collection_counts.values().sum()
    }

    /// Items actually resident in the committed keyspace on disk, as of the
    /// last successful flush. Only the Flusher moves this, via
    /// [`Self::adjust_disk_item_count`].
    pub fn disk_item_count(&self) -> i64 {
        self.disk_item_count
    }

    /// Applied by the Flusher after a batch commits: `+1` per key newly
    /// inserted into the on-disk committed keyspace, `-1` per key whose
    /// tombstone was just persisted there. Overwrites of an already-resident
    /// key, and Prepares, never move this counter.
    pub fn adjust_disk_item_count(&mut self, delta: i64) {
        self.disk_item_count += delta;
    }

    pub fn to_vbucket_state_record(&self) -> VBucketStateRecord {
        VBucketStateRecord {
            state: self.state,
            topology: self.topology.clone(),
            high_seqno: self.checkpoint_manager.high_seqno(),
            high_prepared_seqno: self.high_prepared_seqno(),
            high_completed_seqno: self.checkpoint_manager.high_completed_seqno(),
            max_cas: self.max_cas,
            failover_table: self.failover_table.clone(),
            purge_seqno: self.purge_seqno,
            max_visible_seqno: self.max_visible_seqno,
            checkpoint_id: 0,
            might_contain_xattrs: self.might_contain_xattrs,
            hlc_epoch_seqno: self.hlc_epoch_seqno,
            disk_item_count: self.disk_item_count,
        }
    }

    fn high_prepared_seqno(&self) -> BySeqno {
        match &self.durability {
            DurabilityMonitor::Active(_) => self.checkpoint_manager.high_seqno(),
            DurabilityMonitor::Passive(p) => p.high_prepared_seqno(),
        }
    }

    fn check_state_for_mutation(&self) -> EpResult<()> {
        match self.state {
            VBucketStateName::Active => Ok(()),
            _ => Err(EpError::NotMyVBucket),
        }
    }

    /// An Ephemeral bucket cannot satisfy any level that requires
    /// persistence, and any level needs a topology to evaluate against.
    fn validate_durability(&self, requirements: &DurabilityRequirements) -> EpResult<()> {
        let Some(topology) = &self.topology else {
            return Err(EpError::DurabilityImpossible);
        };
        if topology.size() > 3 {
            return Err(EpError::DurabilityImpossible);
        }
        if self.bucket_type == BucketType::Ephemeral && requirements.level.requires_active_persistence() {
            return Err(EpError::DurabilityInvalidLevel);
        }
        Ok(())
    }

    fn bump_collection_count(&mut self, collection: CollectionId, delta: i64) {
        *self.collection_counts.entry(collection).or_insert(0) += delta;
    }

    /// `set`/`add`/`replace`.
    pub fn mutate(
        &mut self,
        kind: MutationKind,
        req: MutationRequest,
        durability: Option<DurabilityRequirements>,
    ) -> EpResult<WriteOutcome> {
        self.check_state_for_mutation()?;

        if self.prepared.contains_key(&req.key) {
            return Err(EpError::SyncWriteInProgress);
        }

        let existing = self.committed.get(&req.key);
        match kind {
            MutationKind::Add if existing.is_some() => return Err(EpError::KeyExists),
            MutationKind::Replace if existing.is_none() => return Err(EpError::KeyNotFound),
            _ => {}
        }
        if let Some(expected) = req.cas {
            match existing {
                Some(current) if expected != current.cas => return Err(EpError::CasMismatch),
                None => return Err(EpError::KeyNotFound),
                _ => {}
            }
        }

        let is_insert = existing.is_none();
        let next_rev_seqno = existing.map(|e| e.rev_seqno + 1).unwrap_or(1);
        let new_cas = self.clock.next();
        self.max_cas = self.max_cas.max(new_cas);

        if let Some(requirements) = durability {
            self.validate_durability(&requirements)?;
            debug!(vbid = self.vbid, key = ?req.key, "starting sync write prepare");
            return self.start_prepare(req, new_cas, next_rev_seqno, is_insert, false, requirements);
        }

        let collection = req.key.collection();
        let key = req.key.clone();
        let value = req.value.clone();
        let datatype = req.datatype;
        let flags = req.flags;
        let expiry = req.expiry;

        let result = self.checkpoint_manager.queue_item(None, |seqno| QueuedItem {
            key: key.clone(),
            value: value.clone(),
            datatype,
            flags,
            expiry,
            cas: new_cas,
            by_seqno: seqno,
            rev_seqno: next_rev_seqno,
            operation: OperationType::Mutation,
            committed_state: CommittedState::CommittedViaMutation,
            durability: None,
            sync_delete: false,
        });

        self.committed.insert(
            req.key,
            StoredValue { value: req.value, datatype: req.datatype, flags: req.flags, expiry: req.expiry, cas: new_cas, seqno: result.seqno, rev_seqno: next_rev_seqno },
        );
        if is_insert {
            self.bump_collection_count(collection, 1);
        }
        self.max_visible_seqno = result.seqno;

        Ok(WriteOutcome::Applied(Applied { seqno: result.seqno, cas: new_cas }))
    }

    /// `delete(key, cas)`.
    pub fn delete(&mut self, key: &Key, cas: Option<Cas>, durability: Option<DurabilityRequirements>) -> EpResult<WriteOutcome> {
        self.check_state_for_mutation()?;
        if self.prepared.contains_key(key) {
            return Err(EpError::SyncWriteInProgress);
        }
        let Some(existing) = self.committed.get(key) else {
            return Err(EpError::KeyNotFound);
        };
        if let Some(expected) = cas {
            if expected != existing.cas {
                return Err(EpError::CasMismatch);
            }
        }

        let new_cas = self.clock.next();
        self.max_cas = self.max_cas.max(new_cas);
        let next_rev_seqno = existing.rev_seqno + 1;

        if let Some(requirements) = durability {
            self.validate_durability(&requirements)?;
            let req = MutationRequest { key: key.clone(), value: Vec::new(), datatype: Datatype::RAW, flags: 0, expiry: now_epoch_secs(), cas };
            return self.start_prepare(req, new_cas, next_rev_seqno, false, true, requirements);
        }

        let collection = key.collection();
        let result = self.checkpoint_manager.queue_item(None, |seqno| QueuedItem {
            key: key.clone(),
            value: Vec::new(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: new_cas,
            by_seqno: seqno,
            rev_seqno: next_rev_seqno,
            operation: OperationType::Deletion,
            committed_state: CommittedState::CommittedViaMutation,
            durability: None,
            sync_delete: false,
        });
        self.committed.remove(key);
        self.bump_collection_count(collection, -1);
        self.max_visible_seqno = result.seqno;

        Ok(WriteOutcome::Applied(Applied { seqno: result.seqno, cas: new_cas }))
    }

    fn start_prepare(
        &mut self,
        req: MutationRequest,
        cas: Cas,
        rev_seqno: RevSeqno,
        is_insert: bool,
        sync_delete: bool,
        requirements: DurabilityRequirements,
    ) -> EpResult<WriteOutcome> {
        let (cookie, waiter) = pending_cookie();
        let key = req.key.clone();
        let value = req.value.clone();
        let datatype = req.datatype;
        let flags = req.flags;
        let expiry = req.expiry;

        let result = self.checkpoint_manager.queue_item(Some(&req.key), |seqno| QueuedItem {
            key: key.clone(),
            value: value.clone(),
            datatype,
            flags,
            expiry,
            cas,
            by_seqno: seqno,
            rev_seqno,
            operation: OperationType::PendingSyncWrite,
            committed_state: CommittedState::Pending,
            durability: Some(requirements),
            sync_delete,
        });

        self.prepared.insert(
            req.key.clone(),
            PendingWrite {
                collection: req.key.collection(),
                is_insert,
                sync_delete,
                value: req.value,
                datatype: req.datatype,
                flags: req.flags,
                expiry: req.expiry,
                cas,
                rev_seqno,
            },
        );

        let default_timeout = self.ctx.config.durability_default_timeout;
        let deadline = requirements
            .timeout
            .resolve(default_timeout)
            .map(|d| Instant::now() + d)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(365 * 24 * 3600));

        if let Some(active) = self.durability.as_active_mut() {
            active.track(req.key, result.seqno, requirements, deadline, cookie);
        } else {
            cookie.notify(Err(EpError::NotMyVBucket));
        }

        Ok(WriteOutcome::Pending { prepare_seqno: result.seqno, waiter })
    }

    /// Applies every resolution a DurabilityMonitor event produced: updates
    /// the hash table from the stashed pending write, appends the
    /// Commit/Abort QueuedItem, and notifies the parked cookie.
    fn apply_resolutions(&mut self, resolutions: Vec<Resolution>) {
        for resolution in resolutions {
            match resolution {
                Resolution::Committed { key, prepare_seqno: _, cookie } => {
                    if let Some(pending) = self.prepared.remove(&key) {
                        if pending.sync_delete {
                            if self.committed.remove(&key).is_some() {
                                self.bump_collection_count(pending.collection, -1);
                            }
                        } else {
                            let inserted = self.committed
                                .insert(key.clone(), StoredValue {
                                    value: pending.value,
                                    datatype: pending.datatype,
                                    flags: pending.flags,
                                    expiry: pending.expiry,
                                    cas: pending.cas,
                                    seqno: 0,
                                    rev_seqno: pending.rev_seqno,
                                })
                                .is_none();
                            if pending.is_insert && inserted {
                                self.bump_collection_count(pending.collection, 1);
                            }
                        }
                    }
                    let result = self.checkpoint_manager.queue_item(None, |seqno| QueuedItem {
                        key: key.clone(),
                        value: Vec::new(),
                        datatype: Datatype::RAW,
                        flags: 0,
                        expiry: 0,
                        cas: self.max_cas,
                        by_seqno: seqno,
                        rev_seqno: 1,
                        operation: OperationType::CommitSyncWrite,
                        committed_state: CommittedState::PrepareCommitted,
                        durability: None,
                        sync_delete: false,
                    });
                    if let Some(sv) = self.committed.get_mut(&key) {
                        sv.seqno = result.seqno;
                    }
                    self.max_visible_seqno = result.seqno;
                    debug!(vbid = self.vbid, seqno = result.seqno, "sync write committed");
                    if let Some(cookie) = cookie {
                        cookie.notify(Ok(()));
                    }
                }
                Resolution::Aborted { key, prepare_seqno: _, cookie, reason } => {
                    warn!(vbid = self.vbid, ?reason, "sync write aborted");
                    self.prepared.remove(&key);
                    self.checkpoint_manager.queue_item(None, |seqno| QueuedItem {
                        key: key.clone(),
                        value: Vec::new(),
                        datatype: Datatype::RAW,
                        flags: 0,
                        expiry: 0,
                        cas: self.max_cas,
                        by_seqno: seqno,
                        rev_seqno: 1,
                        operation: OperationType::AbortSyncWrite,
                        committed_state: CommittedState::PrepareAborted,
                        durability: None,
                        sync_delete: false,
                    });
                    if let Some(cookie) = cookie {
                        cookie.notify(Err(reason));
                    }
                }
            }
        }
    }

    /// `seqnoAcknowledged(replica, preparedSeqno)`.
    pub fn seqno_acknowledged(&mut self, replica: &NodeId, prepared_seqno: BySeqno) {
        if let Some(active) = self.durability.as_active_mut() {
            let resolutions = active.seqno_ack(replica, prepared_seqno);
            self.apply_resolutions(resolutions);
        }
    }

    /// `notifyPersistedSeqno(seqno)`, called by the Flusher.
    pub fn notify_persisted_seqno(&mut self, seqno: BySeqno) {
        if let Some(active) = self.durability.as_active_mut() {
            let resolutions = active.persisted_up_to(seqno);
            self.apply_resolutions(resolutions);
        } else if let Some(passive) = self.durability.as_passive_mut() {
            passive.on_persisted(seqno);
        }
    }

    /// DurabilityTimeoutTask drives this periodically.
    pub fn tick_durability(&mut self, now: Instant) {
        if let Some(active) = self.durability.as_active_mut() {
            let resolutions = active.tick(now);
            self.apply_resolutions(resolutions);
        }
    }

    /// The Passive role's Commit message from the Active over DCP: appends
    /// at the dictated seqno rather than this vBucket's own counter.
    pub fn passive_commit(&mut self, key: &Key, commit_seqno: BySeqno) -> EpResult<()> {
        let passive = self.durability.as_passive_mut().ok_or(EpError::NotMyVBucket)?;
        let Some((resolved_key, cookie)) = passive.on_commit(commit_seqno) else {
            return Err(EpError::EInval);
        };
        debug_assert_eq!(&resolved_key, key);
        if let Some(pending) = self.prepared.remove(key) {
            if pending.sync_delete {
                if self.committed.remove(key).is_some() {
                    self.bump_collection_count(pending.collection, -1);
                }
            } else {
                let inserted = self.committed
                    .insert(key.clone(), StoredValue {
                        value: pending.value,
                        datatype: pending.datatype,
                        flags: pending.flags,
                        expiry: pending.expiry,
                        cas: pending.cas,
                        seqno: commit_seqno,
                        rev_seqno: pending.rev_seqno,
                    })
                    .is_none();
                if pending.is_insert && inserted {
                    self.bump_collection_count(pending.collection, 1);
                }
            }
        }
        self.checkpoint_manager.queue_item_at_seqno(commit_seqno, None, |seqno| QueuedItem {
            key: key.clone(),
            value: Vec::new(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: self.max_cas,
            by_seqno: seqno,
            rev_seqno: 1,
            operation: OperationType::CommitSyncWrite,
            committed_state: CommittedState::PrepareCommitted,
            durability: None,
            sync_delete: false,
        });
        self.max_visible_seqno = commit_seqno;
        if let Some(cookie) = cookie {
            cookie.notify(Ok(()));
        }
        Ok(())
    }

    /// The Passive role's Abort message, mirroring [`Self::passive_commit`].
    pub fn passive_abort(&mut self, key: &Key, abort_seqno: BySeqno) -> EpResult<()> {
        let passive = self.durability.as_passive_mut().ok_or(EpError::NotMyVBucket)?;
        let Some((_, cookie)) = passive.on_abort(abort_seqno) else {
            return Err(EpError::EInval);
        };
        self.prepared.remove(key);
        self.checkpoint_manager.queue_item_at_seqno(abort_seqno, None, |seqno| QueuedItem {
            key: key.clone(),
            value: Vec::new(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: self.max_cas,
            by_seqno: seqno,
            rev_seqno: 1,
            operation: OperationType::AbortSyncWrite,
            committed_state: CommittedState::PrepareAborted,
            durability: None,
            sync_delete: false,
        });
        if let Some(cookie) = cookie {
            cookie.notify(Err(EpError::SyncWriteAmbiguous));
        }
        Ok(())
    }

    /// A Prepare arriving as part of a replication snapshot while Passive.
    pub fn passive_track_prepare(&mut self, key: Key, seqno: BySeqno, requirements: DurabilityRequirements, value: Vec<u8>, datatype: Datatype, flags: u32, expiry: u32, cas: Cas, rev_seqno: RevSeqno, is_insert: bool, sync_delete: bool) -> EpResult<()> {
        let default_timeout = self.ctx.config.durability_default_timeout;
        let deadline = requirements
            .timeout
            .resolve(default_timeout)
            .map(|d| Instant::now() + d)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(365 * 24 * 3600));

        self.prepared.insert(
            key.clone(),
            PendingWrite { collection: key.collection(), is_insert, sync_delete, value: value.clone(), datatype, flags, expiry, cas, rev_seqno },
        );
        let item_key = key.clone();
        self.checkpoint_manager.queue_item_at_seqno(seqno, Some(&key), |seqno| QueuedItem {
            key: item_key,
            value,
            datatype,
            flags,
            expiry,
            cas,
            by_seqno: seqno,
            rev_seqno,
            operation: OperationType::PendingSyncWrite,
            committed_state: CommittedState::Pending,
            durability: Some(requirements),
            sync_delete,
        });
        let passive = self.durability.as_passive_mut().ok_or(EpError::NotMyVBucket)?;
        passive.track(key, seqno, requirements, deadline, None);
        Ok(())
    }

    /// `setState(new, topology?)`: transitions the vBucket,
    /// switching the DurabilityMonitor role when Active-ness changes.
    pub fn set_state(&mut self, new_state: VBucketStateName, topology: Option<Topology>) -> EpResult<()> {
        let was_active = matches!(self.durability, DurabilityMonitor::Active(_));
        let becomes_active = new_state == VBucketStateName::Active;

        if new_state == VBucketStateName::Dead {
            if let Some(active) = self.durability.as_active_mut() {
                let resolutions = active.abort_all();
                self.apply_resolutions(resolutions);
            }
        } else if becomes_active && !was_active {
            self.durability.switch_to_active(topology.clone(), self.ctx.durability_metrics.clone());
        } else if !becomes_active && was_active {
            self.durability.switch_to_passive(self.ctx.durability_metrics.clone());
        } else if let Some(active) = self.durability.as_active_mut() {
            if let Some(topology) = topology.clone() {
                let resolutions = active.set_topology(topology);
                self.apply_resolutions(resolutions);
            }
        }

        self.state = new_state;
        self.topology = topology;
        Ok(())
    }

    /// Registers a new replication stream cursor starting from the
    /// beginning of the live checkpoint arena.
    pub fn register_stream_cursor(&mut self, name: impl Into<String>) {
        self.checkpoint_manager.register_cursor(name, CursorKind::Stream);
    }

    pub fn persistence_cursor_name(&self) -> &'static str {
        PERSISTENCE_CURSOR
    }

    /// Truncates in-memory state to match a KVStore
    /// rollback on stream divergence. Collection counts and the committed
    /// map are rebuilt from scratch since per-entry seqnos are all that
    /// distinguishes survivors; the caller reseeds from a post-rollback scan.
    pub fn rollback_in_memory_to(&mut self, target_seqno: BySeqno) {
        self.committed.retain(|_, sv| sv.seqno <= target_seqno);
        self.prepared.clear();
        self.collection_counts.clear();
        for key in self.committed.keys().cloned().collect::<Vec<_>>() {
            self.bump_collection_count(key.collection(), 1);
        }
    }

    /// Keys in the committed key space whose expiry has elapsed, for
    /// `ExpiryPager` to walk. Never includes a key with an
    /// outstanding Prepare -- that entry's fate is decided by the Prepare's
    /// resolution, not the pager.
    pub fn expired_keys(&self, now: u32) -> Vec<Key> {
        self.committed
            .iter()
            .filter(|(k, sv)| sv.expiry != 0 && sv.expiry <= now && !self.prepared.contains_key(*k))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Expires `key` if it is still committed and still past its expiry at
    /// `now`, appending an `Expiration` QueuedItem -- distinct from an
    /// explicit `Deletion` since this is
    /// the proactive pager, not the read path. Returns whether anything was
    /// expired.
    pub fn expire_item(&mut self, key: &Key, now: u32) -> bool {
        if self.prepared.contains_key(key) {
            return false;
        }
        let Some(existing) = self.committed.get(key) else { return false };
        if existing.expiry == 0 || existing.expiry > now {
            return false;
        }
        let next_rev_seqno = existing.rev_seqno + 1;
        let collection = key.collection();
        let new_cas = self.clock.next();
        self.max_cas = self.max_cas.max(new_cas);

        let result = self.checkpoint_manager.queue_item(None, |seqno| QueuedItem {
            key: key.clone(),
            value: Vec::new(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: new_cas,
            by_seqno: seqno,
            rev_seqno: next_rev_seqno,
            operation: OperationType::Expiration,
            committed_state: CommittedState::CommittedViaMutation,
            durability: None,
            sync_delete: false,
        });
        self.committed.remove(key);
        self.bump_collection_count(collection, -1);
        self.max_visible_seqno = result.seqno;
        true
    }

    pub fn stats(&self) -> crate::stats::VBucketStats {
        crate::stats::VBucketStats {
            vbid: self.vbid,
            state: self.state,
            num_items: self.num_items(),
            disk_item_count: self.disk_item_count,
            num_prepared: self.prepared.len(),
            high_seqno: self.checkpoint_manager.high_seqno(),
            high_prepared_seqno: self.high_prepared_seqno(),
            high_completed_seqno: self.checkpoint_manager.high_completed_seqno(),
            checkpoint: crate::stats::CheckpointManagerStats {
                num_checkpoints: self.checkpoint_manager.num_checkpoints(),
                memory_usage_bytes: self.checkpoint_manager.memory_usage(),
                items_for_persistence: self.checkpoint_manager.items_pending_for_cursor(PERSISTENCE_CURSOR),
                high_seqno: self.checkpoint_manager.high_seqno(),
                high_completed_seqno: self.checkpoint_manager.high_completed_seqno(),
            },
        }
    }
}

fn now_epoch_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_vbucket() -> VBucket {
        let topology = Topology::new(vec!["active".into(), "replica".into()]).unwrap();
        VBucket::new(0, BucketType::Persistent, VBucketStateName::Active, Some(topology), RuntimeContext::for_test())
    }

    fn mutation_req(key: &str, value: &str) -> MutationRequest {
        MutationRequest {
            key: Key::from_bytes(key.as_bytes().to_vec()),
            value: value.as_bytes().to_vec(),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: None,
        }
    }

    #[test]
    fn prepare_ack_commit_flow_applies_value_to_hash_table() {
        let mut vb = active_vbucket();
        let applied = vb.mutate(MutationKind::Set, mutation_req("k", "v1"), None).unwrap();
        assert!(matches!(applied, WriteOutcome::Applied(Applied { seqno: 1, .. })));

        let outcome = vb
            .mutate(MutationKind::Set, mutation_req("k", "v2"), Some(DurabilityRequirements::majority()))
            .unwrap();
        let WriteOutcome::Pending { prepare_seqno, .. } = outcome else { panic!("expected pending") };
        assert_eq!(prepare_seqno, 2);
        assert!(vb.prepared.contains_key(&Key::from_bytes(b"k".to_vec())));

        vb.seqno_acknowledged(&"replica".to_string(), 2);
        assert!(!vb.prepared.contains_key(&Key::from_bytes(b"k".to_vec())));
        assert_eq!(vb.checkpoint_manager.high_seqno(), 3);
        let (value, ..) = vb.get(&Key::from_bytes(b"k".to_vec())).unwrap();
        assert_eq!(value, b"v2");
    }

    #[test]
    fn add_rejects_existing_key() {
        let mut vb = active_vbucket();
        vb.mutate(MutationKind::Set, mutation_req("k", "v1"), None).unwrap();
        let err = vb.mutate(MutationKind::Add, mutation_req("k", "v2"), None).unwrap_err();
        assert_eq!(err, EpError::KeyExists);
    }

    #[test]
    fn replace_missing_key_returns_key_not_found() {
        let mut vb = active_vbucket();
        let err = vb.mutate(MutationKind::Replace, mutation_req("missing", "v"), None).unwrap_err();
        assert_eq!(err, EpError::KeyNotFound);
    }

    #[test]
    fn second_prepare_while_one_outstanding_is_rejected() {
        let mut vb = active_vbucket();
        vb.mutate(MutationKind::Set, mutation_req("k", "v1"), Some(DurabilityRequirements::majority())).unwrap();
        let err = vb.mutate(MutationKind::Set, mutation_req("k", "v2"), None).unwrap_err();
        assert_eq!(err, EpError::SyncWriteInProgress);
    }

    #[test]
    fn topology_too_large_is_rejected_with_durability_impossible() {
        let chain = vec!["active".into(), "r1".into(), "r2".into(), "r3".into()];
        assert_eq!(Topology::new(chain), Err(EpError::DurabilityImpossible));
    }

    #[test]
    fn ephemeral_bucket_rejects_persist_to_majority() {
        let topology = Topology::new(vec!["active".into(), "replica".into()]).unwrap();
        let mut vb = VBucket::new(0, BucketType::Ephemeral, VBucketStateName::Active, Some(topology), RuntimeContext::for_test());
        let reqs = DurabilityRequirements { level: ep_types::DurabilityLevel::PersistToMajority, ..DurabilityRequirements::majority() };
        let err = vb.mutate(MutationKind::Set, mutation_req("k", "v1"), Some(reqs)).unwrap_err();
        assert_eq!(err, EpError::DurabilityInvalidLevel);
    }

    #[test]
    fn num_items_tracks_inserts_and_deletes_on_disjoint_keys() {
        let mut vb = active_vbucket();
        vb.mutate(MutationKind::Set, mutation_req("a", "1"), None).unwrap();
        vb.mutate(MutationKind::Set, mutation_req("b", "1"), None).unwrap();
        vb.delete(&Key::from_bytes(b"a".to_vec()), None, None).unwrap();
        assert_eq!(vb.num_items(), 1);
    }

    /// A Passive-role Prepare migrates across a takeover
    /// and commits immediately once a topology is set.
    #[test]
    fn takeover_migrates_outstanding_prepare_and_commits_it() {
        let mut vb = VBucket::new(0, BucketType::Persistent, VBucketStateName::Replica, None, RuntimeContext::for_test());
        let reqs = DurabilityRequirements { level: ep_types::DurabilityLevel::PersistToMajority, ..DurabilityRequirements::majority() };
        vb.passive_track_prepare(Key::from_bytes(b"k".to_vec()), 1, reqs, b"v".to_vec(), Datatype::RAW, 0, 0, 7, 1, true, false).unwrap();
        vb.notify_persisted_seqno(1);

        let topology = Topology::new(vec!["active".into()]).unwrap();
        vb.set_state(VBucketStateName::Active, Some(topology)).unwrap();

        assert!(!vb.prepared.contains_key(&Key::from_bytes(b"k".to_vec())));
        let (value, cas, ..) = vb.get(&Key::from_bytes(b"k".to_vec())).unwrap();
        assert_eq!(value, b"v");
        assert_eq!(cas, 7);
    }

    #[test]
    fn expired_keys_skips_items_with_an_outstanding_prepare() {
        let mut vb = active_vbucket();
        let mut req = mutation_req("k", "v1");
        req.expiry = 1;
        vb.mutate(MutationKind::Set, req, None).unwrap();

        let req2 = mutation_req("k", "v2");
        vb.mutate(MutationKind::Set, req2, Some(DurabilityRequirements::majority())).unwrap();

        assert!(vb.expired_keys(u32::MAX).is_empty());
    }

    #[test]
    fn expire_item_removes_committed_entry_and_decrements_count() {
        let mut vb = active_vbucket();
        let mut req = mutation_req("k", "v1");
        req.expiry = 1;
        vb.mutate(MutationKind::Set, req, None).unwrap();

        assert!(vb.expire_item(&Key::from_bytes(b"k".to_vec()), u32::MAX));
        assert_eq!(vb.num_items(), 0);
        assert!(vb.get(&Key::from_bytes(b"k".to_vec())).is_err());
    }

    // Universal invariants: seqno monotonicity and numItems arithmetic
    // under arbitrary interleavings of set/delete on a small key space.
    mod props {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone, Copy, proptest_derive::Arbitrary)]
        enum Op {
            Set(#[proptest(strategy = "0u8..4")] u8),
            Delete(#[proptest(strategy = "0u8..4")] u8),
        }

        proptest! {
            #[test]
            fn high_seqno_is_non_decreasing_and_num_items_matches_live_keys(ops in prop::collection::vec(any::<Op>(), 0..64)) {
                let mut vb = active_vbucket();
                let mut live = std::collections::HashSet::new();
                let mut prev_seqno = 0u64;

                for op in ops {
                    let key = |n: u8| Key::from_bytes(format!("k{n}").into_bytes());
                    match op {
                        Op::Set(n) => {
                            let req = mutation_req(&format!("k{n}"), "v");
                            let _ = vb.mutate(MutationKind::Set, req, None);
                            live.insert(n);
                        }
                        Op::Delete(n) => {
                            let _ = vb.delete(&key(n), None, None);
                            live.remove(&n);
                        }
                    }
                    let seqno = vb.checkpoint_manager.high_seqno();
                    prop_assert!(seqno >= prev_seqno);
                    prev_seqno = seqno;
                }

                prop_assert_eq!(vb.num_items() as usize, live.len());
            }
        }
    }
}
