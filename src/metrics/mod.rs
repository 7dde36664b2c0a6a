mod types;

pub use types::{CycleMetrics, MetricsSnapshot, SystemMetrics};

use std::sync::{Arc, Mutex, MutexGuard};
use sysinfo::{Pid, ProcessesToUpdate, System};

const MAX_RECENT_CYCLES: usize = 20;

/// Process-wide counters for the inference pipeline. Updated from the
/// inference thread and read by the control API, so it sits behind a plain
/// mutex rather than an async one.
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    recent_cycles: Vec<CycleMetrics>,
    cycle_count: u64,
    frame_timeouts: u64,
    model_failures: u64,
    violations_fired: u64,
    events_delivered: u64,
    events_failed: u64,
    system: System,
    pid: Pid,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // Initial refresh to establish baseline for CPU calculation
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                recent_cycles: Vec::with_capacity(MAX_RECENT_CYCLES),
                cycle_count: 0,
                frame_timeouts: 0,
                model_failures: 0,
                violations_fired: 0,
                events_delivered: 0,
                events_failed: 0,
                system,
                pid,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_cycle(&self, metrics: CycleMetrics) {
        let mut state = self.state();
        state.cycle_count += 1;
        state.violations_fired += metrics.fired.len() as u64;
        state.recent_cycles.push(metrics);

        if state.recent_cycles.len() > MAX_RECENT_CYCLES {
            state.recent_cycles.remove(0);
        }
    }

    pub fn record_frame_timeout(&self) {
        self.state().frame_timeouts += 1;
    }

    pub fn record_model_failure(&self) {
        self.state().model_failures += 1;
    }

    pub fn record_event_delivery(&self, delivered: bool) {
        let mut state = self.state();
        if delivered {
            state.events_delivered += 1;
        } else {
            state.events_failed += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut state = self.state();
        let pid = state.pid;

        // Refresh to get current CPU/RAM
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        let system = state
            .system
            .process(pid)
            .map(|process| SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            })
            .unwrap_or_default();

        MetricsSnapshot {
            system,
            recent_cycles: state.recent_cycles.clone(),
            cycle_count: state.cycle_count,
            frame_timeouts: state.frame_timeouts,
            model_failures: state.model_failures,
            violations_fired: state.violations_fired,
            events_delivered: state.events_delivered,
            events_failed: state.events_failed,
        }
    }

    pub fn reset(&self) {
        let mut state = self.state();
        let pid = state.pid;
        state.recent_cycles.clear();
        state.cycle_count = 0;
        state.frame_timeouts = 0;
        state.model_failures = 0;
        state.violations_fired = 0;
        state.events_delivered = 0;
        state.events_failed = 0;
        // Re-establish baseline for CPU after reset
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MetricsCollector {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
