use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a tracked event. Intermission-like breaks are a paused
/// sub-state of `Live` so they keep bounded-latency polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Scheduled,
    Live { paused: bool },
    Final,
}

impl EventState {
    /// Progression rank. Classification never moves an event to a lower rank.
    pub fn rank(self) -> u8 {
        match self {
            EventState::Scheduled => 0,
            EventState::Live { .. } => 1,
            EventState::Final => 2,
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, EventState::Live { .. })
    }

    /// Stable column value for the `tracked_events` table.
    pub fn as_str(self) -> &'static str {
        match self {
            EventState::Scheduled => "scheduled",
            EventState::Live { paused: false } => "live",
            EventState::Live { paused: true } => "live_paused",
            EventState::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(EventState::Scheduled),
            "live" => Some(EventState::Live { paused: false }),
            "live_paused" => Some(EventState::Live { paused: true }),
            "final" => Some(EventState::Final),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Upstream game status after mapping at the parse boundary. Raw status
/// strings never travel past `UpstreamStatus::from_raw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamStatus {
    Scheduled,
    InProgress { intermission: bool },
    Concluded,
    /// Status string we do not recognise (or absent). The classifier falls
    /// back to the clock for these.
    Unknown,
}

impl UpstreamStatus {
    pub fn from_raw(state: &str, intermission: bool) -> Self {
        match state.trim().to_ascii_uppercase().as_str() {
            "FUT" | "PRE" | "SCHEDULED" | "PREVIEW" => UpstreamStatus::Scheduled,
            "LIVE" | "CRIT" | "IN_PROGRESS" => UpstreamStatus::InProgress { intermission },
            // Postponed and cancelled games will not produce data today.
            "FINAL" | "OFF" | "OVER" | "PPD" | "CNCL" => UpstreamStatus::Concluded,
            _ => UpstreamStatus::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule + tracked events
// ---------------------------------------------------------------------------

/// One entry of a day's schedule as returned by the schedule source.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub event_id: String,
    pub scheduled_start: DateTime<Utc>,
    pub status: UpstreamStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedEvent {
    pub event_id: String,
    pub scheduled_start: DateTime<Utc>,
    pub state: EventState,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

impl TrackedEvent {
    pub fn new(event_id: impl Into<String>, scheduled_start: DateTime<Utc>, state: EventState) -> Self {
        Self {
            event_id: event_id.into(),
            scheduled_start,
            state,
            last_fetched_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    PlayByPlay,
    BoxScore,
}

impl PayloadKind {
    pub const ALL: [PayloadKind; 2] = [PayloadKind::PlayByPlay, PayloadKind::BoxScore];

    pub fn as_str(self) -> &'static str {
        match self {
            PayloadKind::PlayByPlay => "play_by_play",
            PayloadKind::BoxScore => "box_score",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "play_by_play" | "pbp" => Some(PayloadKind::PlayByPlay),
            "box_score" | "boxscore" => Some(PayloadKind::BoxScore),
            _ => None,
        }
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifies one specific stored body: the row plus the revision that was
/// read. Marking processed against a stale revision is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadRef {
    pub id: i64,
    pub revision: i64,
}

/// A payload fetched but not yet written to the raw store.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub event_id: String,
    pub kind: PayloadKind,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

/// A stored raw payload, as read back by the processor.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub payload_ref: PayloadRef,
    pub event_id: String,
    pub kind: PayloadKind,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub processed: bool,
}

/// FINAL bookkeeping for one event: when FINAL was first observed and
/// whether its single correction fetch has been planned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalMark {
    pub event_id: String,
    pub seen_at: DateTime<Utc>,
    pub rechecked: bool,
}

/// Scorer output for one raw payload. `fields` is opaque to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedRecord {
    pub source: PayloadRef,
    pub event_id: String,
    pub kind: PayloadKind,
    pub model_version: String,
    pub computed_at: DateTime<Utc>,
    pub fields: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Egress identities
// ---------------------------------------------------------------------------

/// One egress identity. `proxy_url = None` means a direct connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyIdentity {
    pub identity_id: String,
    pub proxy_url: Option<String>,
}

impl ProxyIdentity {
    pub fn direct() -> Self {
        Self {
            identity_id: "direct".to_string(),
            proxy_url: None,
        }
    }

    /// `identity_id` is the proxy URL without userinfo, safe to log.
    /// Credentials live only in `proxy_url`.
    pub fn from_url(url: &str) -> Self {
        Self {
            identity_id: redact_userinfo(url),
            proxy_url: Some(url.to_string()),
        }
    }
}

fn redact_userinfo(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(host) = parsed.host_str() {
            let port = parsed.port().map(|p| format!(":{p}")).unwrap_or_default();
            return format!("{}://{host}{port}", parsed.scheme());
        }
    }
    // Unparseable: drop anything before the last '@' of the authority.
    let (scheme, rest) = url.split_once("://").unwrap_or(("", url));
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let host = match rest[..authority_end].rsplit_once('@') {
        Some((_, host)) => host,
        None => &rest[..authority_end],
    };
    if scheme.is_empty() {
        host.to_string()
    } else {
        format!("{scheme}://{host}")
    }
}
