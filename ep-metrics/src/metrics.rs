//! Per-component metric bundles. Each subsystem in `ep-core` owns one of
//! these, registered once against a shared `prometheus::Registry` when the
//! `RuntimeContext` is constructed.

use prometheus::{IntCounter, IntGauge, Registry};

macro_rules! register_int_gauge {
    ($registry:expr, $name:expr, $help:expr) => {{
        let gauge = IntGauge::new($name, $help).unwrap();
        $registry.register(Box::new(gauge.clone())).ok();
        gauge
    }};
}

macro_rules! register_int_counter {
    ($registry:expr, $name:expr, $help:expr) => {{
        let counter = IntCounter::new($name, $help).unwrap();
        $registry.register(Box::new(counter.clone())).ok();
        counter
    }};
}

#[derive(Clone)]
pub struct CheckpointManagerMetrics {
    pub num_open_checkpoints: IntGauge,
    pub num_closed_checkpoints: IntGauge,
    pub num_items_for_persistence: IntGauge,
    pub num_cursors_dropped: IntCounter,
    pub items_expelled_total: IntCounter,
    pub memory_expelled_bytes_total: IntCounter,
}

impl CheckpointManagerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            num_open_checkpoints: register_int_gauge!(registry, "ep_checkpoint_open_total", "open checkpoints across all vbuckets"),
            num_closed_checkpoints: register_int_gauge!(registry, "ep_checkpoint_closed_total", "closed checkpoints across all vbuckets"),
            num_items_for_persistence: register_int_gauge!(registry, "ep_checkpoint_items_for_persistence", "items not yet persisted"),
            num_cursors_dropped: register_int_counter!(registry, "ep_checkpoint_cursors_dropped_total", "stream cursors dropped under memory pressure"),
            items_expelled_total: register_int_counter!(registry, "ep_checkpoint_items_expelled_total", "items expelled from closed checkpoints"),
            memory_expelled_bytes_total: register_int_counter!(registry, "ep_checkpoint_memory_expelled_bytes_total", "bytes freed by expelling"),
        }
    }

    pub fn for_test() -> Self {
        Self::new(&Registry::new())
    }
}

#[derive(Clone)]
pub struct DurabilityMetrics {
    pub prepares_tracked: IntGauge,
    pub prepares_committed_total: IntCounter,
    pub prepares_aborted_total: IntCounter,
    pub prepares_timed_out_total: IntCounter,
}

impl DurabilityMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            prepares_tracked: register_int_gauge!(registry, "ep_durability_prepares_tracked", "in-flight prepares"),
            prepares_committed_total: register_int_counter!(registry, "ep_durability_prepares_committed_total", "prepares committed"),
            prepares_aborted_total: register_int_counter!(registry, "ep_durability_prepares_aborted_total", "prepares aborted"),
            prepares_timed_out_total: register_int_counter!(registry, "ep_durability_prepares_timed_out_total", "prepares timed out"),
        }
    }

    pub fn for_test() -> Self {
        Self::new(&Registry::new())
    }
}

#[derive(Clone)]
pub struct FlusherMetrics {
    pub batches_flushed_total: IntCounter,
    pub items_flushed_total: IntCounter,
    pub flush_failures_total: IntCounter,
    pub pending_queue_depth: IntGauge,
}

impl FlusherMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            batches_flushed_total: register_int_counter!(registry, "ep_flusher_batches_total", "batches successfully flushed"),
            items_flushed_total: register_int_counter!(registry, "ep_flusher_items_total", "items successfully flushed"),
            flush_failures_total: register_int_counter!(registry, "ep_flusher_failures_total", "flush batch failures"),
            pending_queue_depth: register_int_gauge!(registry, "ep_flusher_pending_queue_depth", "items queued for persistence"),
        }
    }

    pub fn for_test() -> Self {
        Self::new(&Registry::new())
    }
}

#[derive(Clone)]
pub struct ReclamationMetrics {
    pub checkpoints_removed_total: IntCounter,
    pub bytes_recovered_total: IntCounter,
    pub pending_destruction_bytes: IntGauge,
}

impl ReclamationMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            checkpoints_removed_total: register_int_counter!(registry, "ep_reclaim_checkpoints_removed_total", "closed checkpoints removed"),
            bytes_recovered_total: register_int_counter!(registry, "ep_reclaim_bytes_recovered_total", "bytes recovered by the remover"),
            pending_destruction_bytes: register_int_gauge!(registry, "ep_reclaim_pending_destruction_bytes", "memory awaiting the destroyer"),
        }
    }

    pub fn for_test() -> Self {
        Self::new(&Registry::new())
    }
}
