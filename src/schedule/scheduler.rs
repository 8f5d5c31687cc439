use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::CadenceConfig;
use crate::types::{EventState, FinalMark, TrackedEvent};

/// Sleep tier chosen for the next cycle, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CadenceTier {
    Live,
    Intermission,
    NearTerm,
    Idle,
}

impl CadenceTier {
    pub fn interval(self, cfg: &CadenceConfig) -> Duration {
        match self {
            CadenceTier::Live => cfg.live,
            CadenceTier::Intermission => cfg.intermission,
            CadenceTier::NearTerm => cfg.near_term,
            CadenceTier::Idle => cfg.idle,
        }
    }
}

impl std::fmt::Display for CadenceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CadenceTier::Live => "live",
            CadenceTier::Intermission => "intermission",
            CadenceTier::NearTerm => "near_term",
            CadenceTier::Idle => "idle",
        };
        write!(f, "{s}")
    }
}

/// Scheduler memory carried from one `plan` call to the next. Owned by the
/// caller; `plan` takes it by value and hands back the updated copy.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    /// event_id → first cycle that saw it FINAL.
    final_seen: HashMap<String, DateTime<Utc>>,
    /// FINAL events whose single correction fetch has been planned.
    rechecked: HashSet<String>,
}

impl SchedulerState {
    /// FINAL and done: no further fetches will ever be planned.
    pub fn is_retired(&self, event_id: &str) -> bool {
        self.rechecked.contains(event_id)
    }

    pub fn forget(&mut self, event_id: &str) {
        self.final_seen.remove(event_id);
        self.rechecked.remove(event_id);
    }

    /// Seed from persisted marks after a restart.
    pub fn from_marks(marks: impl IntoIterator<Item = FinalMark>) -> Self {
        let mut state = Self::default();
        for mark in marks {
            if mark.rechecked {
                state.rechecked.insert(mark.event_id.clone());
            }
            state.final_seen.insert(mark.event_id, mark.seen_at);
        }
        state
    }

    /// Current marks, for persisting alongside the tracked events.
    pub fn marks(&self) -> Vec<FinalMark> {
        let mut marks: Vec<FinalMark> = self
            .final_seen
            .iter()
            .map(|(id, &seen_at)| FinalMark {
                event_id: id.clone(),
                seen_at,
                rechecked: self.rechecked.contains(id),
            })
            .collect();
        marks.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        marks
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    /// Events to fetch this cycle, in dispatch priority order.
    pub order: Vec<TrackedEvent>,
    pub next_sleep: Duration,
    pub tier: CadenceTier,
}

/// Priority group, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Group {
    Live,
    LivePaused,
    NearTerm,
    FinalRecheck,
    Other,
}

/// Compute this cycle's dispatch order and the sleep before the next one.
///
/// Order: live (paused last), near-term scheduled, FINAL events due their
/// immediate or one-time correction fetch, then far-future scheduled events
/// not refreshed within the idle interval. Ties go to the earliest start.
pub fn plan(
    events: &[TrackedEvent],
    now: DateTime<Utc>,
    cfg: &CadenceConfig,
    mut state: SchedulerState,
) -> (Plan, SchedulerState) {
    let horizon = now
        .checked_add_signed(cfg.near_term_horizon)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let idle_refresh = chrono::Duration::from_std(cfg.idle).unwrap_or(chrono::Duration::MAX);
    let mut tier = CadenceTier::Idle;
    let mut ranked: Vec<(Group, &TrackedEvent)> = Vec::with_capacity(events.len());

    for event in events {
        let group = match event.state {
            EventState::Live { paused: false } => {
                tier = tier.min(CadenceTier::Live);
                Some(Group::Live)
            }
            EventState::Live { paused: true } => {
                tier = tier.min(CadenceTier::Intermission);
                Some(Group::LivePaused)
            }
            EventState::Scheduled if event.scheduled_start <= horizon => {
                tier = tier.min(CadenceTier::NearTerm);
                Some(Group::NearTerm)
            }
            EventState::Scheduled => {
                let stale = event
                    .last_fetched_at
                    .map_or(true, |at| now - at >= idle_refresh);
                stale.then_some(Group::Other)
            }
            EventState::Final => final_group(&mut state, event, now, cfg),
        };
        if let Some(group) = group {
            ranked.push((group, event));
        }
    }

    ranked.sort_by(|(ga, a), (gb, b)| {
        ga.cmp(gb)
            .then(a.scheduled_start.cmp(&b.scheduled_start))
            .then_with(|| a.event_id.cmp(&b.event_id))
    });

    let plan = Plan {
        order: ranked.into_iter().map(|(_, e)| e.clone()).collect(),
        next_sleep: tier.interval(cfg),
        tier,
    };
    (plan, state)
}

fn final_group(
    state: &mut SchedulerState,
    event: &TrackedEvent,
    now: DateTime<Utc>,
    cfg: &CadenceConfig,
) -> Option<Group> {
    let Some(&seen) = state.final_seen.get(&event.event_id) else {
        // First cycle as FINAL: capture the final payloads now.
        state.final_seen.insert(event.event_id.clone(), now);
        return Some(Group::FinalRecheck);
    };
    if state.rechecked.contains(&event.event_id) || now - seen < cfg.final_recheck_after {
        return None;
    }
    state.rechecked.insert(event.event_id.clone());
    Some(Group::FinalRecheck)
}
