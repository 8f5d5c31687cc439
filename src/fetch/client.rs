use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::api::latency::LatencyStats;
use crate::config::FetchConfig;
use crate::error::{FetchError, SourceError};
use crate::fetch::circuit::CircuitBreaker;
use crate::fetch::source::{PayloadSource, ScheduleSource};
use crate::proxy::{PenaltyReason, ProxyPool, RefreshOutcome};
use crate::types::{PayloadKind, ProxyIdentity, ScheduleEntry};

/// Exponential backoff for retry `attempt` (0-based): `base * 2^attempt`
/// capped at `ceiling`, plus up to 25% random jitter.
pub fn backoff_delay(cfg: &FetchConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    let delay = cfg.backoff_base.saturating_mul(factor).min(cfg.backoff_ceiling);
    let jitter_range = delay.as_millis() as u64 / 4;
    let jitter = if jitter_range == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_range)
    };
    delay + Duration::from_millis(jitter)
}

/// The single "fetch with retry" primitive. Every outbound call goes through
/// `execute`, which consults the circuit breaker, draws an identity from the
/// pool and maps upstream outcomes onto bounded retries.
pub struct ResilientClient {
    cfg: FetchConfig,
    pool: Arc<ProxyPool>,
    breaker: Arc<CircuitBreaker>,
    payloads: Arc<dyn PayloadSource>,
    schedule: Arc<dyn ScheduleSource>,
    latency: Arc<LatencyStats>,
}

impl ResilientClient {
    pub fn new(
        cfg: FetchConfig,
        pool: Arc<ProxyPool>,
        breaker: Arc<CircuitBreaker>,
        payloads: Arc<dyn PayloadSource>,
        schedule: Arc<dyn ScheduleSource>,
        latency: Arc<LatencyStats>,
    ) -> Self {
        Self { cfg, pool, breaker, payloads, schedule, latency }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn fetch_payload(
        &self,
        event_id: &str,
        kind: PayloadKind,
        preferred: Option<&ProxyIdentity>,
    ) -> Result<Vec<u8>, FetchError> {
        let source = Arc::clone(&self.payloads);
        let label = format!("{kind} {event_id}");
        self.execute(&label, preferred, |identity| {
            let source = Arc::clone(&source);
            async move { source.get_payload(&identity, event_id, kind).await }
        })
        .await
    }

    pub async fn fetch_schedule(&self, date: NaiveDate) -> Result<Vec<ScheduleEntry>, FetchError> {
        let source = Arc::clone(&self.schedule);
        let label = format!("schedule {date}");
        self.execute(&label, None, |identity| {
            let source = Arc::clone(&source);
            async move { source.get_schedule(&identity, date).await }
        })
        .await
    }

    /// Bounded-retry combinator. `call` is invoked once per attempt with the
    /// identity chosen for that attempt. `preferred` is used for the first
    /// attempt if it is still usable.
    pub async fn execute<T, F, Fut>(
        &self,
        label: &str,
        preferred: Option<&ProxyIdentity>,
        mut call: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut(ProxyIdentity) -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut pinned = preferred.cloned();
        let mut rate_limited = 0u32;
        let mut auth_failures = 0u32;
        let mut transient = 0u32;

        loop {
            let identity = match pinned.take().filter(|id| self.pool.is_usable(id)) {
                Some(id) => id,
                None => self.next_identity().await.ok_or(FetchError::NoIdentity)?,
            };

            if let Err(remaining) = self.breaker.check() {
                debug!(call = label, ?remaining, "circuit open, failing fast");
                return Err(FetchError::CircuitOpen { remaining });
            }

            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.cfg.timeout, call(identity.clone())).await {
                Ok(result) => result,
                Err(_) => {
                    self.pool.penalize(&identity, PenaltyReason::Timeout);
                    Err(SourceError::Transient(format!("timed out after {:?}", self.cfg.timeout)))
                }
            };
            self.latency.record(started.elapsed());

            let err = match outcome {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(e) => e,
            };

            match err {
                SourceError::RateLimited { retry_after } => {
                    self.breaker.record_answered();
                    if rate_limited >= self.cfg.max_rate_limit_retries {
                        warn!(call = label, class = "rate_limit", attempts = rate_limited + 1, "giving up");
                        return Err(FetchError::RateLimited { attempts: rate_limited + 1 });
                    }
                    let delay = retry_after
                        .map(|d| d.min(self.cfg.backoff_ceiling))
                        .unwrap_or_else(|| backoff_delay(&self.cfg, rate_limited));
                    rate_limited += 1;
                    warn!(
                        call = label,
                        class = "rate_limit",
                        identity = %identity.identity_id,
                        attempt = rate_limited,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off",
                    );
                    tokio::time::sleep(delay).await;
                }
                SourceError::Auth { status } => {
                    self.breaker.record_answered();
                    self.pool.penalize(&identity, PenaltyReason::AuthRejected);
                    auth_failures += 1;
                    warn!(
                        call = label,
                        class = "auth",
                        status,
                        identity = %identity.identity_id,
                        attempt = auth_failures,
                        "identity rejected",
                    );
                    if auth_failures % self.cfg.auth_refresh_after == 0 {
                        self.refresh_pool(label).await;
                    }
                    if auth_failures >= self.cfg.max_auth_retries {
                        return Err(FetchError::Auth { attempts: auth_failures });
                    }
                }
                SourceError::Transient(message) => {
                    transient += 1;
                    if let Some(pause) = self.breaker.record_failure() {
                        return Err(FetchError::CircuitOpen { remaining: pause });
                    }
                    if transient > self.cfg.max_transient_retries {
                        warn!(call = label, class = "transient", attempts = transient, %message, "giving up");
                        return Err(FetchError::Transient { attempts: transient, message });
                    }
                    let delay = backoff_delay(&self.cfg, transient - 1);
                    debug!(
                        call = label,
                        class = "transient",
                        attempt = transient,
                        delay_ms = delay.as_millis() as u64,
                        %message,
                        "retrying after backoff",
                    );
                    tokio::time::sleep(delay).await;
                }
                SourceError::Permanent { status, message } => {
                    self.breaker.record_answered();
                    return Err(FetchError::Permanent { status, message });
                }
            }
        }
    }

    async fn next_identity(&self) -> Option<ProxyIdentity> {
        if let Some(identity) = self.pool.next() {
            return Some(identity);
        }
        self.refresh_pool("pool exhausted").await;
        self.pool.next()
    }

    async fn refresh_pool(&self, trigger: &str) {
        match self.pool.refresh().await {
            Ok(RefreshOutcome::Refreshed { identities }) => {
                info!(trigger, identities, "[POOL] refresh completed");
                self.payloads.identities_replaced(&self.pool.identities());
            }
            Ok(RefreshOutcome::Skipped) => {
                debug!(trigger, "[POOL] refresh skipped, too soon since last");
            }
            Err(e) => warn!(trigger, "[POOL] refresh failed: {e}"),
        }
    }
}
