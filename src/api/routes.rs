use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::api::health::HealthState;
use crate::api::latency::{LatencySnapshot, LatencyStats};
use crate::bridge::serve_socket;
use crate::broker::AllowList;
use crate::error::AppError;
use crate::intercept::ObservationTap;
use crate::state::OperationWindow;
use crate::types::{BrokerCommand, Observation, Operation, TabId, TabRef};

#[derive(Clone)]
pub struct ApiState {
    pub broker_tx: mpsc::Sender<BrokerCommand>,
    pub tap: ObservationTap,
    pub window: Arc<OperationWindow>,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    /// Consumer hosts admitted to `/bridge`. The broker holds the same list.
    pub allow_list: AllowList,
    /// Source of per-connection tab ids.
    pub next_tab: Arc<AtomicU64>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/bridge", get(bridge_upgrade))
        .route("/ingest", post(ingest))
        .route("/sync", post(force_sync))
        .route("/health", get(get_health))
        .route("/operations/recent", get(get_recent_operations))
        .route("/stats/latency", get(get_stats_latency))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct BridgeQuery {
    /// Address of the consumer tab. Must share the Origin's host when the
    /// client sends one.
    pub url: Option<String>,
}

#[derive(Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize, Debug, PartialEq)]
pub struct HealthResponse {
    pub cdp_connected: bool,
    pub registered_tabs: u64,
    pub has_credential: bool,
    pub last_operation_at_ms: Option<u64>,
    pub forwarded: u64,
    pub suppressed: u64,
    pub rejected: u64,
    pub dropped_observations: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn bridge_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Query(params): Query<BridgeQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let url = resolve_tab_url(origin, params.url)?;
    if !state.allow_list.allows(&url) {
        return Err(AppError::Forbidden(format!("consumer host not allowed: {url}")));
    }
    let tab = TabRef {
        id: TabId(state.next_tab.fetch_add(1, Ordering::Relaxed)),
        url,
    };
    let broker_tx = state.broker_tx.clone();
    Ok(ws.on_upgrade(move |socket| serve_socket(socket, tab, broker_tx)))
}

/// A browser-set Origin is authoritative. `?url=` may only name a page on the
/// Origin's host; without an Origin it is taken as given.
fn resolve_tab_url(origin: Option<&str>, claimed: Option<String>) -> Result<String, AppError> {
    let Some(origin) = origin else {
        return claimed.ok_or_else(|| AppError::Forbidden("no Origin header or url parameter".to_string()));
    };
    let origin_host =
        host_of(origin).ok_or_else(|| AppError::Forbidden(format!("unusable Origin: {origin}")))?;
    match claimed {
        None => Ok(origin.to_string()),
        Some(url) if host_of(&url).as_deref() == Some(origin_host.as_str()) => Ok(url),
        Some(url) => Err(AppError::Forbidden(format!("url {url} does not match Origin {origin}"))),
    }
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_ascii_lowercase)
}

async fn ingest(State(state): State<ApiState>, Json(obs): Json<Observation>) -> StatusCode {
    state.tap.emit(obs);
    StatusCode::ACCEPTED
}

async fn force_sync(State(state): State<ApiState>) -> Result<StatusCode, AppError> {
    match state.broker_tx.try_send(BrokerCommand::ForceSync) {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(TrySendError::Full(_)) => Ok(StatusCode::TOO_MANY_REQUESTS),
        Err(TrySendError::Closed(_)) => Err(AppError::ChannelClosed("broker stopped".to_string())),
    }
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let h = &state.health;
    let last = h.last_operation_at_ms();
    Json(HealthResponse {
        cdp_connected: h.cdp_connected(),
        registered_tabs: h.registered_tabs(),
        has_credential: h.has_credential(),
        last_operation_at_ms: (last > 0).then_some(last),
        forwarded: h.forwarded(),
        suppressed: h.suppressed(),
        rejected: h.rejected(),
        dropped_observations: state.tap.dropped(),
    })
}

async fn get_recent_operations(
    State(state): State<ApiState>,
    Query(params): Query<RecentQuery>,
) -> Json<Vec<Operation>> {
    let limit = params.limit.unwrap_or(50);
    let mut ops = state.window.recent(Instant::now());
    ops.truncate(limit);
    Json(ops)
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencySnapshot> {
    Json(state.latency.snapshot())
}
