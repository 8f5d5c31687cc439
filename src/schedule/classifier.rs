use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::types::{EventState, ScheduleEntry, TrackedEvent, UpstreamStatus};

/// Classify one event.
///
/// `upstream` is None when the schedule source could not be reached (or the
/// event is missing from it). An upstream status wins over the clock; the
/// clock only decides when upstream is silent or unrecognised. The result
/// never ranks below `previous`, and `Final` is terminal.
pub fn classify(
    previous: Option<EventState>,
    scheduled_start: DateTime<Utc>,
    upstream: Option<UpstreamStatus>,
    now: DateTime<Utc>,
) -> EventState {
    if previous == Some(EventState::Final) {
        return EventState::Final;
    }

    let observed = match upstream {
        Some(UpstreamStatus::Concluded) => EventState::Final,
        Some(UpstreamStatus::InProgress { intermission }) => EventState::Live { paused: intermission },
        Some(UpstreamStatus::Scheduled) => EventState::Scheduled,
        Some(UpstreamStatus::Unknown) | None => {
            if now >= scheduled_start {
                EventState::Live { paused: false }
            } else {
                EventState::Scheduled
            }
        }
    };

    let upstream_silent = matches!(upstream, None | Some(UpstreamStatus::Unknown));
    match previous {
        Some(prev) if prev.rank() > observed.rank() => prev,
        // Without a fresh upstream reading keep the last known live sub-state.
        Some(prev @ EventState::Live { .. }) if upstream_silent => prev,
        _ => observed,
    }
}

/// One state change produced by `apply_schedule`, for logging.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub event_id: String,
    pub from: Option<EventState>,
    pub to: EventState,
}

/// Fold a schedule fetch into the tracked set and reclassify every event.
///
/// `schedule = None` means the fetch failed: every tracked event is
/// reclassified from its previous state alone. Events absent from a
/// successful schedule are reclassified the same way; retiring them is the
/// caller's decision.
pub fn apply_schedule(
    tracked: &mut BTreeMap<String, TrackedEvent>,
    schedule: Option<&[ScheduleEntry]>,
    now: DateTime<Utc>,
) -> Vec<Transition> {
    let mut transitions = Vec::new();
    let mut upstream: BTreeMap<&str, &ScheduleEntry> = BTreeMap::new();

    if let Some(entries) = schedule {
        for entry in entries {
            upstream.insert(entry.event_id.as_str(), entry);
            if !tracked.contains_key(&entry.event_id) {
                let state = classify(None, entry.scheduled_start, Some(entry.status), now);
                tracked.insert(
                    entry.event_id.clone(),
                    TrackedEvent::new(entry.event_id.clone(), entry.scheduled_start, state),
                );
                transitions.push(Transition {
                    event_id: entry.event_id.clone(),
                    from: None,
                    to: state,
                });
            }
        }
    }

    for event in tracked.values_mut() {
        let entry = upstream.get(event.event_id.as_str()).copied();
        if let Some(entry) = entry {
            // Start times move (weather delays, schedule changes).
            event.scheduled_start = entry.scheduled_start;
        }
        let next = classify(
            Some(event.state),
            event.scheduled_start,
            entry.map(|e| e.status),
            now,
        );
        if next != event.state {
            transitions.push(Transition {
                event_id: event.event_id.clone(),
                from: Some(event.state),
                to: next,
            });
            event.state = next;
        }
    }

    transitions
}
