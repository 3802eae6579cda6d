//! A cheap RAII timer for hot-path sections, reported as a histogram on
//! drop. Mirrors the reference codebase's `monitored_scope` helper used
//! throughout its background tasks (e.g. `Core::add_blocks`).

use prometheus::HistogramVec;
use std::time::Instant;

pub struct MonitoredScope {
    name: &'static str,
    start: Instant,
    histogram: HistogramVec,
}

impl Drop for MonitoredScope {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        self.histogram.with_label_values(&[self.name]).observe(elapsed);
    }
}

/// Registers (or reuses) a single `HistogramVec` keyed by scope name so
/// callers don't need to thread a registry handle through every function;
/// construct one `ScopeTimers` per component and pass it down instead.
#[derive(Clone)]
pub struct ScopeTimers {
    histogram: HistogramVec,
}

impl ScopeTimers {
    pub fn new(name: &str, help: &str, registry: &prometheus::Registry) -> prometheus::Result<Self> {
        let histogram = HistogramVec::new(
            prometheus::HistogramOpts::new(name, help),
            &["scope"],
        )?;
        registry.register(Box::new(histogram.clone()))?;
        Ok(Self { histogram })
    }

    pub fn enter(&self, name: &'static str) -> MonitoredScope {
        MonitoredScope { name, start: Instant::now(), histogram: self.histogram.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_records_an_observation_on_drop() {
        let registry = prometheus::Registry::new();
        let timers = ScopeTimers::new("ep_test_scope_seconds", "test", &registry).unwrap();
        {
            let _scope = timers.enter("widget");
        }
        let families = registry.gather();
        let family = families.iter().find(|f| f.get_name() == "ep_test_scope_seconds").unwrap();
        assert_eq!(family.get_metric()[0].get_histogram().get_sample_count(), 1);
    }
}
