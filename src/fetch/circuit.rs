//! Process-wide circuit breaker guarding every outbound call.
//!
//! One instance is shared by all fetch workers. Consecutive transient
//! failures past `trip_threshold` pause the whole pool; each further trip
//! without an intervening success doubles the pause up to `pause_ceiling`.
//! When a pause elapses exactly one probe call is admitted: success closes
//! the circuit, failure re-trips immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    paused_until: Option<Instant>,
    /// Trips since the last success. Drives pause escalation and is the
    /// "consecutive pauses" health signal.
    consecutive_trips: u32,
    probe_in_flight: bool,
}

/// Snapshot for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub consecutive_pauses: u32,
    pub total_pauses: u64,
    pub paused_for_ms: Option<u64>,
}

pub struct CircuitBreaker {
    cfg: BreakerConfig,
    state: Mutex<CircuitState>,
    total_trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(CircuitState::default()),
            total_trips: AtomicU64::new(0),
        }
    }

    /// Admit or refuse one outbound call. `Err` carries the time left on the
    /// pause (zero while another worker holds the probe slot).
    pub fn check(&self) -> Result<(), Duration> {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.lock();
        let Some(until) = state.paused_until else {
            return Ok(());
        };
        if now < until {
            return Err(until - now);
        }
        if state.probe_in_flight {
            return Err(Duration::ZERO);
        }
        state.probe_in_flight = true;
        info!("[BREAKER] pause elapsed, admitting probe call");
        Ok(())
    }

    /// True while new dispatch should be suppressed.
    pub fn is_paused(&self) -> bool {
        let state = self.lock();
        match state.paused_until {
            Some(until) => Instant::now() < until || state.probe_in_flight,
            None => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.paused_until.is_some() {
            info!(
                after_pauses = state.consecutive_trips,
                "[BREAKER] probe succeeded, circuit closed"
            );
        }
        *state = CircuitState::default();
    }

    /// Upstream answered with something other than success or a transient
    /// error (rate limit, auth, 4xx). An answered probe closes the circuit
    /// and restarts the failure count, but keeps the trip count so a
    /// relapse still escalates the pause. Outside a probe it changes nothing.
    pub fn record_answered(&self) {
        let mut state = self.lock();
        if state.probe_in_flight {
            state.probe_in_flight = false;
            state.paused_until = None;
            state.consecutive_failures = 0;
        }
    }

    /// Count one transient failure. Returns the pause length if this
    /// failure tripped the circuit.
    pub fn record_failure(&self) -> Option<Duration> {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) -> Option<Duration> {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        let probe_failed = std::mem::take(&mut state.probe_in_flight);
        if !probe_failed && state.consecutive_failures < self.cfg.trip_threshold {
            return None;
        }
        // Concurrent failures reported while already paused do not extend it.
        if !probe_failed && state.paused_until.is_some_and(|until| now < until) {
            return None;
        }

        let pause = self.pause_for(state.consecutive_trips);
        state.consecutive_trips = state.consecutive_trips.saturating_add(1);
        state.paused_until = Some(now + pause);
        let total = self.total_trips.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            consecutive_failures = state.consecutive_failures,
            consecutive_pauses = state.consecutive_trips,
            total_pauses = total,
            pause_secs = pause.as_secs_f64(),
            "[BREAKER] circuit tripped, pausing all outbound calls",
        );
        Some(pause)
    }

    pub fn consecutive_pauses(&self) -> u32 {
        self.lock().consecutive_trips
    }

    pub fn total_pauses(&self) -> u64 {
        self.total_trips.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let state = self.lock();
        let (label, paused_for_ms) = match state.paused_until {
            None => ("closed", None),
            Some(until) if now < until => ("open", Some((until - now).as_millis() as u64)),
            Some(_) => ("half_open", Some(0)),
        };
        BreakerSnapshot {
            state: label,
            consecutive_failures: state.consecutive_failures,
            consecutive_pauses: state.consecutive_trips,
            total_pauses: self.total_trips.load(Ordering::Relaxed),
            paused_for_ms,
        }
    }

    fn pause_for(&self, prior_trips: u32) -> Duration {
        let factor = 2u32.saturating_pow(prior_trips.min(16));
        self.cfg
            .pause_base
            .saturating_mul(factor)
            .min(self.cfg.pause_ceiling)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
