use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::SourceError;
use crate::types::{PayloadKind, ProxyIdentity, ScheduleEntry};

/// Day schedule provider. Status strings are already mapped to
/// `UpstreamStatus` by the implementation.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn get_schedule(
        &self,
        identity: &ProxyIdentity,
        date: NaiveDate,
    ) -> Result<Vec<ScheduleEntry>, SourceError>;
}

/// Per-event feed provider returning the unmodified response body.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    async fn get_payload(
        &self,
        identity: &ProxyIdentity,
        event_id: &str,
        kind: PayloadKind,
    ) -> Result<Vec<u8>, SourceError>;

    /// Called after the pool swapped in a new identity set, so per-identity
    /// resources held for retired identities can be released.
    fn identities_replaced(&self, _current: &[ProxyIdentity]) {}
}
