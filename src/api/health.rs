//! Shared health state for the /health endpoint.
//! Written by the pipeline driver once per cycle, read by the API.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::driver::CycleSummary;

#[derive(Default)]
pub struct HealthState {
    /// Completed driver cycles since start.
    pub cycles: AtomicU64,
    /// Millisecond timestamp of the last completed cycle (0 = none).
    pub last_cycle_at_ms: AtomicU64,
    /// Last schedule fetch succeeded.
    pub schedule_ok: AtomicBool,
    /// Events whose last fetch reported at least one error, summed over all cycles.
    pub failed_fetches: AtomicU64,
    last_cycle: Mutex<Option<CycleSummary>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self, summary: &CycleSummary) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_at_ms
            .store(summary.started_at.timestamp_millis().max(0) as u64, Ordering::Relaxed);
        self.schedule_ok.store(summary.schedule_ok, Ordering::Relaxed);
        self.failed_fetches
            .fetch_add(summary.failed as u64, Ordering::Relaxed);
        if let Ok(mut last) = self.last_cycle.lock() {
            *last = Some(summary.clone());
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn last_cycle_at_ms(&self) -> u64 {
        self.last_cycle_at_ms.load(Ordering::Relaxed)
    }

    pub fn schedule_ok(&self) -> bool {
        self.schedule_ok.load(Ordering::Relaxed)
    }

    pub fn failed_fetches(&self) -> u64 {
        self.failed_fetches.load(Ordering::Relaxed)
    }

    pub fn last_cycle(&self) -> Option<CycleSummary> {
        self.last_cycle.lock().ok().and_then(|last| last.clone())
    }
}
