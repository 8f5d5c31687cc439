/// Database row types matching the tables in `migrations/`.
/// Timestamps are epoch milliseconds.
use chrono::{DateTime, Utc};

use crate::types::{EventState, PayloadKind, PayloadRef, RawPayload, TrackedEvent};

#[derive(Debug, sqlx::FromRow)]
pub struct TrackedEventRow {
    pub event_id: String,
    pub scheduled_start: i64,
    pub state: String,
    pub last_fetched_at: Option<i64>,
}

impl TrackedEventRow {
    /// None when the stored state string is not one we write.
    pub fn into_event(self) -> Option<TrackedEvent> {
        Some(TrackedEvent {
            state: EventState::parse(&self.state)?,
            scheduled_start: from_ms(self.scheduled_start),
            last_fetched_at: self.last_fetched_at.map(from_ms),
            event_id: self.event_id,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct RawPayloadRow {
    pub id: i64,
    pub event_id: String,
    pub payload_kind: String,
    pub body: Vec<u8>,
    pub fetched_at: i64,
    pub revision: i64,
    pub processed: bool,
}

impl RawPayloadRow {
    pub fn into_payload(self) -> Option<RawPayload> {
        Some(RawPayload {
            payload_ref: PayloadRef { id: self.id, revision: self.revision },
            kind: PayloadKind::parse(&self.payload_kind)?,
            event_id: self.event_id,
            body: self.body,
            fetched_at: from_ms(self.fetched_at),
            processed: self.processed,
        })
    }
}

pub fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
