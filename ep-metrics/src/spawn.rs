//! Background task spawning that tracks how many of a component's tasks are
//! alive, so a Flusher or CheckpointRemover that silently died shows up as a
//! metric instead of a support ticket.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus::IntGaugeVec;
use std::future::Future;

static RUNNING_TASKS: Lazy<Mutex<Option<IntGaugeVec>>> = Lazy::new(|| Mutex::new(None));

/// Registers the gauge backing [`spawn_monitored_task`]. Call once at
/// startup; safe to call multiple times (later calls are ignored).
pub fn init(registry: &prometheus::Registry) {
    let mut slot = RUNNING_TASKS.lock();
    if slot.is_none() {
        let gauge = IntGaugeVec::new(
            prometheus::Opts::new("ep_running_tasks", "number of running background tasks"),
            &["task"],
        )
        .unwrap();
        let _ = registry.register(Box::new(gauge.clone()));
        *slot = Some(gauge);
    }
}

/// Spawns `fut` on the current tokio runtime, incrementing a per-name gauge
/// for the task's lifetime. Falls back to a no-op gauge if [`init`] was
/// never called (e.g. in unit tests that don't stand up a registry).
pub fn spawn_monitored_task<F>(name: &'static str, fut: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let gauge = RUNNING_TASKS.lock().as_ref().map(|g| g.with_label_values(&[name]));
    if let Some(g) = &gauge {
        g.inc();
    }
    tokio::spawn(async move {
        let result = fut.await;
        if let Some(g) = gauge {
            g.dec();
        }
        result
    })
}
