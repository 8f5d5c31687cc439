use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::health::HealthState;
use crate::api::latency::{LatencyStats, LatencySummary};
use crate::config::EVENTS_ENDPOINT_LIMIT;
use crate::db::Store;
use crate::driver::CycleSummary;
use crate::error::AppError;
use crate::fetch::{BreakerSnapshot, CircuitBreaker};
use crate::proxy::ProxyPool;
use crate::types::{EventState, TrackedEvent};

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    pub breaker: Arc<CircuitBreaker>,
    pub pool: Arc<ProxyPool>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .route("/events", get(get_events))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct EventsQuery {
    /// scheduled | live | live_paused | final
    pub state: Option<String>,
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct IdentitiesResponse {
    pub total: usize,
    pub available: usize,
    pub refreshes: u64,
}

#[derive(Serialize)]
pub struct HealthResponse {
    /// "ok", "paused" (breaker open) or "degraded" (schedule unreachable).
    pub status: &'static str,
    pub breaker: BreakerSnapshot,
    pub identities: IdentitiesResponse,
    pub cycles: u64,
    pub last_cycle_at_ms: u64,
    pub failed_fetches: u64,
    pub unprocessed_payloads: i64,
    pub last_cycle: Option<CycleSummary>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Result<Json<HealthResponse>, AppError> {
    let breaker = state.breaker.snapshot();
    let unprocessed_payloads = state.store.unprocessed_count().await?;

    let status = if breaker.state != "closed" {
        "paused"
    } else if state.health.cycles() > 0 && !state.health.schedule_ok() {
        "degraded"
    } else {
        "ok"
    };

    Ok(Json(HealthResponse {
        status,
        breaker,
        identities: IdentitiesResponse {
            total: state.pool.size(),
            available: state.pool.available(),
            refreshes: state.pool.refresh_count(),
        },
        cycles: state.health.cycles(),
        last_cycle_at_ms: state.health.last_cycle_at_ms(),
        failed_fetches: state.health.failed_fetches(),
        unprocessed_payloads,
        last_cycle: state.health.last_cycle(),
    }))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencySummary> {
    Json(state.latency.summary())
}

async fn get_events(
    State(state): State<ApiState>,
    Query(params): Query<EventsQuery>,
) -> Result<Json<Vec<TrackedEvent>>, AppError> {
    let filter = match params.state.as_deref() {
        Some(raw) => Some(
            EventState::parse(raw).ok_or_else(|| AppError::BadRequest(format!("unknown state `{raw}`")))?,
        ),
        None => None,
    };
    let limit = params.limit.unwrap_or(100).min(EVENTS_ENDPOINT_LIMIT);

    let events = state
        .store
        .load_tracked(EVENTS_ENDPOINT_LIMIT as i64)
        .await?
        .into_iter()
        .filter(|e| filter.map_or(true, |s| e.state == s))
        .take(limit)
        .collect();

    Ok(Json(events))
}
