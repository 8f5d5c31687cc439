use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::api::health::HealthState;
use crate::config::{CadenceConfig, DriverConfig};
use crate::coordinator::BatchCoordinator;
use crate::db::{Store, UpsertOutcome};
use crate::error::Result;
use crate::fetch::ResilientClient;
use crate::schedule::{apply_schedule, plan, CadenceTier, SchedulerState};
use crate::types::{EventState, ScheduleEntry, TrackedEvent};

/// Tracked events scheduled within this window are restored on startup.
const RESTORE_WINDOW_HOURS: i64 = 36;

/// Events missing from a fresh schedule are dropped once they started this
/// long ago. No game runs that long, so a stale LIVE entry is left over
/// from a previous sports day.
const UNLISTED_RETIRE_AFTER_HOURS: i64 = 12;

/// What one cycle did. Logged, exposed on /health, and used by `run` for
/// the sleep that follows.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub schedule_ok: bool,
    pub tracked: usize,
    pub planned: usize,
    pub dispatched: usize,
    pub skipped_in_flight: usize,
    /// Not dispatched because the circuit breaker paused the pool.
    pub suppressed: usize,
    /// Not dispatched before the cycle deadline.
    pub deferred: usize,
    /// Worker reports collected this cycle, including late ones.
    pub completed: usize,
    pub failed: usize,
    pub stored: usize,
    pub unchanged: usize,
    /// Workers still running when the deadline passed.
    pub stragglers: usize,
    pub tier: CadenceTier,
    pub next_sleep_ms: u64,
}

impl CycleSummary {
    pub fn next_sleep(&self) -> Duration {
        Duration::from_millis(self.next_sleep_ms)
    }
}

#[derive(Debug)]
struct WorkerReport {
    event_id: String,
    fetched_at: DateTime<Utc>,
    fetched_any: bool,
    fetch_errors: usize,
    stored: usize,
    unchanged: usize,
    store_errors: usize,
}

impl WorkerReport {
    fn failed(&self) -> bool {
        self.fetch_errors > 0 || self.store_errors > 0
    }
}

#[derive(Debug, Default)]
struct DispatchStats {
    dispatched: usize,
    skipped_in_flight: usize,
    suppressed: usize,
    stragglers: usize,
}

/// Removes an event from the in-flight set when its worker ends, even if
/// the worker panics.
struct InFlight {
    set: Arc<DashSet<String>>,
    event_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.event_id);
    }
}

// ---------------------------------------------------------------------------
// PipelineDriver
// ---------------------------------------------------------------------------

/// Outer loop: schedule → classify → plan → bounded parallel fetch and
/// store → sleep. Owns the tracked-event set and the scheduler state.
pub struct PipelineDriver {
    cfg: DriverConfig,
    cadence: CadenceConfig,
    client: Arc<ResilientClient>,
    coordinator: Arc<BatchCoordinator>,
    store: Store,
    health: Arc<HealthState>,
    tracked: BTreeMap<String, TrackedEvent>,
    scheduler: SchedulerState,
    in_flight: Arc<DashSet<String>>,
    workers: Arc<Semaphore>,
    reports_tx: mpsc::UnboundedSender<WorkerReport>,
    reports_rx: mpsc::UnboundedReceiver<WorkerReport>,
    cycles: u64,
}

impl PipelineDriver {
    pub fn new(
        cfg: DriverConfig,
        cadence: CadenceConfig,
        client: Arc<ResilientClient>,
        store: Store,
        health: Arc<HealthState>,
    ) -> Self {
        let coordinator = Arc::new(BatchCoordinator::new(
            Arc::clone(&client),
            cfg.payload_kinds.clone(),
        ));
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            workers: Arc::new(Semaphore::new(cfg.workers)),
            cfg,
            cadence,
            client,
            coordinator,
            store,
            health,
            tracked: BTreeMap::new(),
            scheduler: SchedulerState::default(),
            in_flight: Arc::new(DashSet::new()),
            reports_tx,
            reports_rx,
            cycles: 0,
        }
    }

    /// Reload recent tracked events so a restart keeps their classification
    /// and FINAL progress.
    pub async fn restore(&mut self) -> Result<usize> {
        let since = Utc::now() - chrono::Duration::hours(RESTORE_WINDOW_HOURS);
        let events = self.store.load_tracked_since(since).await?;
        let marks = self.store.load_final_marks_since(since).await?;
        let restored = events.len();
        for event in events {
            self.tracked.insert(event.event_id.clone(), event);
        }
        self.scheduler = SchedulerState::from_marks(marks);
        Ok(restored)
    }

    pub fn tracked_event(&self, event_id: &str) -> Option<&TrackedEvent> {
        self.tracked.get(event_id)
    }

    pub async fn run(mut self) {
        match self.restore().await {
            Ok(0) => {}
            Ok(n) => info!("[CYCLE] restored {n} tracked events"),
            Err(e) => warn!("[CYCLE] could not restore tracked events: {e}"),
        }

        loop {
            let summary = self.run_cycle().await;
            tokio::time::sleep(summary.next_sleep()).await;
        }
    }

    /// One full cycle. Never fails: per-event and per-call failures are
    /// logged and counted, and the returned summary always carries the
    /// next sleep.
    pub async fn run_cycle(&mut self) -> CycleSummary {
        self.cycles += 1;
        let now = Utc::now();

        // Reports from workers that outlived the previous deadline.
        let mut reports = self.drain_reports();

        let schedule = self.fetch_schedule(now).await;
        for t in apply_schedule(&mut self.tracked, schedule.as_deref(), now) {
            info!(
                event_id = %t.event_id,
                from = t.from.map_or("new", EventState::as_str),
                to = %t.to,
                "[STATE] transition",
            );
        }
        if let Some(entries) = &schedule {
            self.retire(entries, now);
        }

        let events: Vec<TrackedEvent> = self.tracked.values().cloned().collect();
        let (plan, scheduler) = plan(&events, now, &self.cadence, std::mem::take(&mut self.scheduler));
        self.scheduler = scheduler;

        let stats = self.dispatch(&plan.order).await;
        reports.extend(self.drain_reports());

        let mut summary = CycleSummary {
            cycle: self.cycles,
            started_at: now,
            schedule_ok: schedule.is_some(),
            tracked: self.tracked.len(),
            planned: plan.order.len(),
            dispatched: stats.dispatched,
            skipped_in_flight: stats.skipped_in_flight,
            suppressed: stats.suppressed,
            deferred: plan.order.len()
                - stats.dispatched
                - stats.skipped_in_flight
                - stats.suppressed,
            completed: 0,
            failed: 0,
            stored: 0,
            unchanged: 0,
            stragglers: stats.stragglers,
            tier: plan.tier,
            next_sleep_ms: plan.next_sleep.as_millis() as u64,
        };
        for report in &reports {
            summary.completed += 1;
            summary.failed += usize::from(report.failed());
            summary.stored += report.stored;
            summary.unchanged += report.unchanged;
            if report.fetched_any {
                if let Some(event) = self.tracked.get_mut(&report.event_id) {
                    event.last_fetched_at = Some(report.fetched_at);
                }
            }
        }

        let snapshot: Vec<TrackedEvent> = self.tracked.values().cloned().collect();
        if let Err(e) = self.store.save_tracked(&snapshot, &self.scheduler.marks()).await {
            warn!("[CYCLE] could not persist tracked events: {e}");
        }

        self.health.record_cycle(&summary);
        info!(
            event = "CYCLE",
            cycle = summary.cycle,
            tier = %summary.tier,
            tracked = summary.tracked,
            dispatched = summary.dispatched,
            completed = summary.completed,
            failed = summary.failed,
            stored = summary.stored,
            suppressed = summary.suppressed,
            stragglers = summary.stragglers,
            "[CYCLE] done | tier: {} | dispatched: {} | stored: {} | failed: {} | sleep: {}ms",
            summary.tier, summary.dispatched, summary.stored, summary.failed, summary.next_sleep_ms,
        );
        summary
    }

    async fn fetch_schedule(&self, now: DateTime<Utc>) -> Option<Vec<ScheduleEntry>> {
        let rollover = chrono::Duration::try_hours(self.cfg.day_rollover_hours).unwrap_or_default();
        let date = now.checked_sub_signed(rollover).unwrap_or(now).date_naive();
        match self.client.fetch_schedule(date).await {
            Ok(entries) => {
                debug!(%date, games = entries.len(), "schedule fetched");
                Some(entries)
            }
            Err(e) => {
                warn!(
                    %date,
                    class = e.class(),
                    "[CYCLE] schedule fetch failed, keeping previous classification: {e}",
                );
                None
            }
        }
    }

    /// Drop events a fresh schedule no longer lists once they are done:
    /// FINAL with the recheck spent, or started long ago.
    fn retire(&mut self, schedule: &[ScheduleEntry], now: DateTime<Utc>) {
        let listed: HashSet<&str> = schedule.iter().map(|e| e.event_id.as_str()).collect();
        let stale_before = now - chrono::Duration::hours(UNLISTED_RETIRE_AFTER_HOURS);
        let scheduler = &mut self.scheduler;

        self.tracked.retain(|id, event| {
            if listed.contains(id.as_str()) {
                return true;
            }
            let done = scheduler.is_retired(id) || event.scheduled_start < stale_before;
            if done {
                debug!(event_id = %id, state = %event.state, "retiring unlisted event");
                scheduler.forget(id);
            }
            !done
        });
    }

    /// Dispatch in plan order onto the bounded worker pool, then wait for
    /// the workers until the cycle deadline. Stragglers keep running
    /// detached and report in a later cycle.
    async fn dispatch(&self, order: &[TrackedEvent]) -> DispatchStats {
        let mut stats = DispatchStats::default();
        let mut set = JoinSet::new();
        let deadline = tokio::time::Instant::now() + self.cfg.cycle_deadline;

        let work = async {
            for (i, event) in order.iter().enumerate() {
                if self.in_flight.contains(&event.event_id) {
                    stats.skipped_in_flight += 1;
                    debug!(event_id = %event.event_id, "still in flight from an earlier cycle, skipping");
                    continue;
                }
                let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                    break;
                };
                if self.client.breaker().is_paused() {
                    stats.suppressed = order.len() - i;
                    warn!(
                        suppressed = stats.suppressed,
                        consecutive_pauses = self.client.breaker().consecutive_pauses(),
                        "[BREAKER] pool paused, suppressing new dispatch",
                    );
                    break;
                }

                self.in_flight.insert(event.event_id.clone());
                let guard = InFlight {
                    set: Arc::clone(&self.in_flight),
                    event_id: event.event_id.clone(),
                };
                set.spawn(run_worker(
                    event.event_id.clone(),
                    Arc::clone(&self.coordinator),
                    self.store.clone(),
                    self.cfg.keep_history,
                    permit,
                    guard,
                    self.reports_tx.clone(),
                ));
                stats.dispatched += 1;
            }

            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    warn!("[CYCLE] worker ended abnormally: {e}");
                }
            }
        };

        if tokio::time::timeout_at(deadline, work).await.is_err() {
            stats.stragglers = set.len();
            warn!(
                stragglers = stats.stragglers,
                deadline_ms = self.cfg.cycle_deadline.as_millis() as u64,
                "[CYCLE] deadline reached, continuing without stragglers",
            );
        }
        set.detach_all();
        stats
    }

    fn drain_reports(&mut self) -> Vec<WorkerReport> {
        let mut reports = Vec::new();
        while let Ok(report) = self.reports_rx.try_recv() {
            reports.push(report);
        }
        reports
    }
}

/// Fetch every kind for one event and persist whatever arrived. Partial
/// results are stored: each kind is processed independently downstream.
async fn run_worker(
    event_id: String,
    coordinator: Arc<BatchCoordinator>,
    store: Store,
    keep_history: bool,
    _permit: OwnedSemaphorePermit,
    _in_flight: InFlight,
    reports: mpsc::UnboundedSender<WorkerReport>,
) {
    let fetch = coordinator.fetch_event(&event_id).await;
    let mut report = WorkerReport {
        fetched_at: Utc::now(),
        fetched_any: !fetch.payloads.is_empty(),
        fetch_errors: fetch.errors.len(),
        stored: 0,
        unchanged: 0,
        store_errors: 0,
        event_id,
    };

    for payload in &fetch.payloads {
        match store.upsert(payload, keep_history).await {
            Ok(UpsertOutcome::Unchanged) => report.unchanged += 1,
            Ok(_) => report.stored += 1,
            Err(e) => {
                warn!(event_id = %payload.event_id, kind = %payload.kind, "[STORE] upsert failed: {e}");
                report.store_errors += 1;
            }
        }
    }

    // The receiver only goes away when the driver itself is dropped.
    let _ = reports.send(report);
}
