//! `RuntimeContext`: an explicit bundle of config, metrics registry, and
//! per-subsystem metrics threaded through constructors, rather than global
//! mutable state. Each test builds its own with [`RuntimeContext::for_test`].

use ep_metrics::{CheckpointManagerMetrics, DurabilityMetrics, FlusherMetrics, ReclamationMetrics};
use prometheus::Registry;

use crate::config::BucketConfig;

#[derive(Clone)]
pub struct RuntimeContext {
    pub config: BucketConfig,
    pub registry: Registry,
    pub checkpoint_manager_metrics: CheckpointManagerMetrics,
    pub durability_metrics: DurabilityMetrics,
    pub flusher_metrics: FlusherMetrics,
    pub reclamation_metrics: ReclamationMetrics,
}

impl RuntimeContext {
    pub fn new(config: BucketConfig) -> Self {
        let registry = Registry::new();
        ep_metrics::spawn::init(&registry);
        Self {
            checkpoint_manager_metrics: CheckpointManagerMetrics::new(&registry),
            durability_metrics: DurabilityMetrics::new(&registry),
            flusher_metrics: FlusherMetrics::new(&registry),
            reclamation_metrics: ReclamationMetrics::new(&registry),
            registry,
            config,
        }
    }

    pub fn for_test() -> Self {
        Self::new(BucketConfig::default())
    }
}
