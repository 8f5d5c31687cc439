use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::fetch::ResilientClient;
use crate::types::{FetchedPayload, PayloadKind};

/// Result of fetching every configured kind for one event. Partial results
/// are normal: `payloads` holds the kinds that succeeded, `errors` the rest.
#[derive(Debug, Default)]
pub struct EventFetch {
    pub payloads: Vec<FetchedPayload>,
    pub errors: Vec<(PayloadKind, FetchError)>,
}

impl EventFetch {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

/// Issues the sub-fetches for one event through the resilient client, all
/// sharing one identity drawn from the pool up front.
pub struct BatchCoordinator {
    client: Arc<ResilientClient>,
    kinds: Vec<PayloadKind>,
}

impl BatchCoordinator {
    pub fn new(client: Arc<ResilientClient>, kinds: Vec<PayloadKind>) -> Self {
        Self { client, kinds }
    }

    pub fn kinds(&self) -> &[PayloadKind] {
        &self.kinds
    }

    pub async fn fetch_event(&self, event_id: &str) -> EventFetch {
        // One identity for the whole group. If the pool has none right now the
        // client picks per attempt and may refresh.
        let identity = self.client.pool().next();

        let calls = self.kinds.iter().map(|&kind| {
            let identity = identity.as_ref();
            async move {
                let result = self.client.fetch_payload(event_id, kind, identity).await;
                (kind, result)
            }
        });

        let mut out = EventFetch::default();
        for (kind, result) in join_all(calls).await {
            match result {
                Ok(body) => {
                    debug!(event_id, %kind, bytes = body.len(), "sub-fetch ok");
                    out.payloads.push(FetchedPayload {
                        event_id: event_id.to_string(),
                        kind,
                        body,
                        fetched_at: Utc::now(),
                    });
                }
                Err(e) => {
                    warn!(event_id, %kind, class = e.class(), "sub-fetch failed: {e}");
                    out.errors.push((kind, e));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::latency::LatencyStats;
    use crate::config::{BreakerConfig, FetchConfig, ProxyConfig};
    use crate::error::SourceError;
    use crate::fetch::CircuitBreaker;
    use crate::proxy::ProxyPool;
    use crate::testing::{CountingIdentities, ScriptedSource};
    use crate::types::ProxyIdentity;
    use std::time::Duration;

    fn coordinator(source: ScriptedSource, pool_size: usize) -> (BatchCoordinator, Arc<ScriptedSource>) {
        let ids: Vec<_> = (0..pool_size)
            .map(|i| ProxyIdentity::from_url(&format!("http://p{i}:3128")))
            .collect();
        let pool = ProxyPool::with_identities(
            ProxyConfig::default(),
            Arc::new(CountingIdentities::new(ids.clone())),
            ids,
        );
        let fetch = FetchConfig {
            timeout: Duration::from_millis(200),
            backoff_base: Duration::from_millis(1),
            backoff_ceiling: Duration::from_millis(2),
            max_transient_retries: 0,
            ..FetchConfig::default()
        };
        let source = Arc::new(source);
        let client = ResilientClient::new(
            fetch,
            pool,
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            source.clone(),
            source.clone(),
            Arc::new(LatencyStats::new()),
        );
        (
            BatchCoordinator::new(Arc::new(client), PayloadKind::ALL.to_vec()),
            source,
        )
    }

    #[tokio::test]
    async fn all_kinds_share_one_identity() {
        let (coord, source) = coordinator(ScriptedSource::always_ok(b"{}"), 4);
        let fetch = coord.fetch_event("g1").await;
        assert!(fetch.is_complete());
        assert_eq!(fetch.payloads.len(), 2);

        let seen = source.identities_seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
    }

    #[tokio::test]
    async fn one_kind_failing_keeps_the_other() {
        let source = ScriptedSource::always_ok(br#"{"ok":true}"#).failing_kind(
            PayloadKind::PlayByPlay,
            SourceError::Permanent { status: 404, message: "not found".into() },
        );
        let (coord, _) = coordinator(source, 2);
        let fetch = coord.fetch_event("g1").await;

        assert!(!fetch.is_complete());
        assert_eq!(fetch.payloads.len(), 1);
        assert_eq!(fetch.payloads[0].kind, PayloadKind::BoxScore);
        assert_eq!(fetch.payloads[0].body, br#"{"ok":true}"#);
        assert_eq!(fetch.errors.len(), 1);
        assert_eq!(fetch.errors[0].0, PayloadKind::PlayByPlay);
        assert!(matches!(fetch.errors[0].1, FetchError::Permanent { status: 404, .. }));
    }

    #[tokio::test]
    async fn total_failure_returns_errors_only() {
        let (coord, _) = coordinator(
            ScriptedSource::always(Err(SourceError::Permanent { status: 400, message: String::new() })),
            2,
        );
        let fetch = coord.fetch_event("g1").await;
        assert!(fetch.is_empty());
        assert_eq!(fetch.errors.len(), 2);
    }
}
