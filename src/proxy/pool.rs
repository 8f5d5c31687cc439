use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::error::{AppError, Result};
use crate::proxy::source::IdentitySource;
use crate::types::ProxyIdentity;

/// Why an identity is being penalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyReason {
    /// Hung past the per-fetch timeout.
    Timeout,
    /// Credentials rejected. Removes the identity until the next refresh.
    AuthRejected,
}

impl PenaltyReason {
    fn is_hard(self) -> bool {
        matches!(self, PenaltyReason::AuthRejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed { identities: usize },
    /// Another refresh ran within the minimum interval or is in progress.
    Skipped,
}

#[derive(Debug)]
struct Slot {
    identity: ProxyIdentity,
    cooldown_until: Option<Instant>,
    revoked: bool,
}

impl Slot {
    fn new(identity: ProxyIdentity) -> Self {
        Self { identity, cooldown_until: None, revoked: false }
    }

    fn usable_at(&self, now: Instant) -> bool {
        !self.revoked && self.cooldown_until.map_or(true, |until| now >= until)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    slots: Vec<Slot>,
    /// Index of the slot to consider first on the next `next()`.
    cursor: usize,
    last_refresh: Option<Instant>,
    refreshing: bool,
}

// ---------------------------------------------------------------------------
// ProxyPool
// ---------------------------------------------------------------------------

/// Rotating set of egress identities shared by every fetch worker.
///
/// Selection is round-robin over usable slots, so consecutive calls land on
/// different identities whenever more than one is usable. The lock is never
/// held across an await: `refresh()` loads the new set outside the lock and
/// swaps it in afterwards.
pub struct ProxyPool {
    cfg: ProxyConfig,
    source: Arc<dyn IdentitySource>,
    state: Mutex<PoolState>,
    refreshes: AtomicU64,
}

impl ProxyPool {
    /// Load the initial identity set from `source`.
    pub async fn init(cfg: ProxyConfig, source: Arc<dyn IdentitySource>) -> Result<Arc<Self>> {
        let identities = source.load().await?;
        if identities.is_empty() {
            return Err(AppError::Identity("identity source returned no identities".to_string()));
        }
        info!("[POOL] initialized with {} identities", identities.len());
        Ok(Self::with_identities(cfg, source, identities))
    }

    pub fn with_identities(
        cfg: ProxyConfig,
        source: Arc<dyn IdentitySource>,
        identities: Vec<ProxyIdentity>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            source,
            state: Mutex::new(PoolState {
                slots: identities.into_iter().map(Slot::new).collect(),
                ..PoolState::default()
            }),
            refreshes: AtomicU64::new(0),
        })
    }

    /// Next usable identity in rotation, or None when every identity is
    /// revoked or cooling down.
    pub fn next(&self) -> Option<ProxyIdentity> {
        self.next_at(Instant::now())
    }

    pub fn next_at(&self, now: Instant) -> Option<ProxyIdentity> {
        let mut state = self.lock();
        let len = state.slots.len();
        for offset in 0..len {
            let idx = (state.cursor + offset) % len;
            let slot = &mut state.slots[idx];
            if slot.usable_at(now) {
                slot.cooldown_until = None;
                let identity = slot.identity.clone();
                state.cursor = (idx + 1) % len;
                return Some(identity);
            }
        }
        None
    }

    /// True if `identity` is still in the set and not revoked or cooling down.
    pub fn is_usable(&self, identity: &ProxyIdentity) -> bool {
        let now = Instant::now();
        self.lock()
            .slots
            .iter()
            .any(|s| s.identity == *identity && s.usable_at(now))
    }

    pub fn penalize(&self, identity: &ProxyIdentity, reason: PenaltyReason) {
        self.penalize_at(identity, reason, Instant::now());
    }

    pub fn penalize_at(&self, identity: &ProxyIdentity, reason: PenaltyReason, now: Instant) {
        let mut state = self.lock();
        let others_usable = state
            .slots
            .iter()
            .any(|s| s.identity != *identity && s.usable_at(now));
        let Some(slot) = state.slots.iter_mut().find(|s| s.identity == *identity) else {
            // Already replaced by a refresh.
            return;
        };
        if reason.is_hard() {
            slot.revoked = true;
            warn!(identity = %identity.identity_id, "[POOL] identity revoked until refresh");
        } else if !others_usable {
            // Cooling the last usable identity would stall every worker.
            info!(identity = %identity.identity_id, reason = ?reason, "[POOL] cooldown skipped, no other identity usable");
        } else {
            slot.cooldown_until = Some(now + self.cfg.cooldown);
            info!(
                identity = %identity.identity_id,
                reason = ?reason,
                cooldown_secs = self.cfg.cooldown.as_secs(),
                "[POOL] identity cooling down",
            );
        }
    }

    /// Replace the whole identity set from the source and clear every
    /// cooldown. Rate-limited to one refresh per `refresh_min_interval`.
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        {
            let mut state = self.lock();
            let now = Instant::now();
            let too_soon = state
                .last_refresh
                .is_some_and(|t| now.duration_since(t) < self.cfg.refresh_min_interval);
            if state.refreshing || too_soon {
                return Ok(RefreshOutcome::Skipped);
            }
            state.refreshing = true;
            state.last_refresh = Some(now);
        }

        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let loaded = self.source.load().await;

        let mut state = self.lock();
        state.refreshing = false;
        let identities = loaded?;
        if identities.is_empty() {
            return Err(AppError::Identity("refresh returned no identities".to_string()));
        }
        let count = identities.len();
        state.slots = identities.into_iter().map(Slot::new).collect();
        state.cursor = 0;
        info!(identities = count, "[POOL] identity set refreshed");
        Ok(RefreshOutcome::Refreshed { identities: count })
    }

    pub fn size(&self) -> usize {
        self.lock().slots.len()
    }

    /// Current identity set, including revoked and cooling identities.
    pub fn identities(&self) -> Vec<ProxyIdentity> {
        self.lock().slots.iter().map(|s| s.identity.clone()).collect()
    }

    pub fn available(&self) -> usize {
        let now = Instant::now();
        self.lock().slots.iter().filter(|s| s.usable_at(now)).count()
    }

    /// Refresh attempts that actually reached the identity source.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
