// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Read side of the service plus the update trigger:
//
//   GET  /api/health          liveness, uptime, rate-limiter snapshot
//   GET  /api/tickers         tickers with a record file
//   GET  /api/data/:ticker    bars in [start, end), each tagged with its date
//   POST /api/update          start a background update cycle
//   GET  /api/update/status   status of the current / last cycle
//
// CORS is permissive; the chart front end is served from another origin.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::error::{ApiError, UpdateError};
use crate::provider::{BarSource, RateLimitSnapshot};
use crate::store::RecordStore;
use crate::types::DatedBar;

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST API router with CORS middleware and shared state.
pub fn router<S: BarSource + 'static>(state: Arc<AppState<S>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health::<S>))
        .route("/api/tickers", get(tickers::<S>))
        .route("/api/data/:ticker", get(data::<S>))
        .route("/api/update", post(trigger_update::<S>))
        .route("/api/update/status", get(update_status::<S>))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
    uptime_secs: i64,
    update_running: bool,
    rate_limit: RateLimitSnapshot,
}

async fn health<S: BarSource + 'static>(State(state): State<Arc<AppState<S>>>) -> impl IntoResponse {
    let now = Utc::now();
    Json(HealthResponse {
        status: "ok",
        server_time: now.timestamp_millis(),
        uptime_secs: (now - state.started_at).num_seconds(),
        update_running: state.status.is_running(),
        rate_limit: state.updater.limiter().snapshot(),
    })
}

// =============================================================================
// Read side
// =============================================================================

async fn tickers<S: BarSource + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.store().list_tickers()?))
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: Option<String>,
    end: Option<String>,
}

#[derive(Serialize)]
struct DataResponse {
    ticker: String,
    bars: Vec<DatedBar>,
}

fn parse_date(name: &str, raw: Option<&str>) -> Result<Option<NaiveDate>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("invalid {name} date {s:?}, expected YYYY-MM-DD"))),
    }
}

async fn data<S: BarSource + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(ticker): Path<String>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<DataResponse>, ApiError> {
    let ticker = RecordStore::normalize_ticker(&ticker)?;
    let start = parse_date("start", range.start.as_deref())?;
    let end = parse_date("end", range.end.as_deref())?;

    let store = state.store().clone();
    let lookup = ticker.clone();
    let bars = tokio::task::spawn_blocking(move || store.read_range(&lookup, start, end))
        .await
        .map_err(|e| ApiError::Internal(format!("read task failed: {e}")))??;

    debug!(%ticker, ?start, ?end, bars = bars.len(), "data served");
    Ok(Json(DataResponse { ticker, bars }))
}

// =============================================================================
// Update trigger & status
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct UpdateRequest {
    #[serde(default)]
    tickers: Vec<String>,
}

async fn trigger_update<S: BarSource + 'static>(
    State(state): State<Arc<AppState<S>>>,
    body: Option<Json<UpdateRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    match state.start_update(&request.tickers, false) {
        Ok(cycle_id) => {
            info!(%cycle_id, tickers = ?request.tickers, "update triggered via API");
            Json(serde_json::json!({ "status": "started", "cycle_id": cycle_id }))
        }
        Err(UpdateError::ConcurrentUpdateRejected) => {
            Json(serde_json::json!({ "status": "already_running" }))
        }
        Err(e) => Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    }
}

async fn update_status<S: BarSource + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> impl IntoResponse {
    Json(state.status.snapshot())
}
