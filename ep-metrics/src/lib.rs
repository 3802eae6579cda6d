//! Observability primitives shared by every `ep-core` component: a metered
//! mpsc channel, a scope timer, monitored task spawning, and the
//! per-component Prometheus metric bundles.

pub mod metered_channel;
pub mod metrics;
pub mod scope;
pub mod spawn;

pub use metrics::{CheckpointManagerMetrics, DurabilityMetrics, FlusherMetrics, ReclamationMetrics};
pub use scope::ScopeTimers;
pub use spawn::spawn_monitored_task;
