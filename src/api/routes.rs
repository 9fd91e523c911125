use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::health::HealthSnapshot;
use crate::db::models::{ScanDetailRow, ScanRunRow};
use crate::db::Store;
use crate::error::AppError;
use crate::scan::ScanService;
use crate::types::ScanKind;

/// Page size for detail polling when the caller does not pass one.
const DEFAULT_DETAIL_LIMIT: i64 = 200;
const MAX_DETAIL_LIMIT: i64 = 1000;
const DEFAULT_RUN_LIMIT: i64 = 20;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub service: ScanService,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/scans", get(list_scans))
        .route("/scans/:kind", post(trigger_scan))
        .route("/scans/runs/:id", get(get_scan))
        .route("/scans/runs/:id/details", get(get_scan_details))
        .route("/health", get(health))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ListQuery {
    pub kind: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct DetailsQuery {
    /// Return rows with `seq` strictly greater than this. Omit for the first poll.
    pub after: Option<i64>,
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct TriggerResponse {
    pub run_id: i64,
    pub kind: ScanKind,
}

#[derive(Serialize)]
pub struct DetailsResponse {
    pub run_id: i64,
    pub details: Vec<ScanDetailRow>,
    /// Pass back as `after` on the next poll.
    pub next_after: i64,
    pub finished: bool,
}

#[derive(Serialize)]
pub struct ActiveRun {
    pub kind: ScanKind,
    pub run_id: i64,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_runs: Vec<ActiveRun>,
    #[serde(flatten)]
    pub runs: HealthSnapshot,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn parse_kind(raw: &str) -> Result<ScanKind, AppError> {
    raw.parse::<ScanKind>().map_err(AppError::NotFound)
}

async fn trigger_scan(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
) -> Result<(StatusCode, Json<TriggerResponse>), AppError> {
    let kind = parse_kind(&kind)?;
    let run_id = state.service.start(kind).await?;
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { run_id, kind })))
}

async fn list_scans(
    State(state): State<ApiState>,
    Query(params): Query<ListQuery>,
) -> Result<Json<Vec<ScanRunRow>>, AppError> {
    let kind = params.kind.as_deref().map(parse_kind).transpose()?;
    let limit = params.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, 500);
    Ok(Json(state.store.list_runs(kind, limit).await?))
}

async fn get_scan(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<ScanRunRow>, AppError> {
    state
        .store
        .get_run(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("scan run {id}")))
}

async fn get_scan_details(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Query(params): Query<DetailsQuery>,
) -> Result<Json<DetailsResponse>, AppError> {
    let run = state
        .store
        .get_run(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("scan run {id}")))?;
    let after = params.after.unwrap_or(-1);
    let limit = params.limit.unwrap_or(DEFAULT_DETAIL_LIMIT).clamp(1, MAX_DETAIL_LIMIT);
    let details = state.store.details_after(id, after, limit).await?;
    let next_after = details.last().map(|d| d.seq).unwrap_or(after);
    Ok(Json(DetailsResponse {
        run_id: id,
        details,
        next_after,
        finished: run.status != "running",
    }))
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let active_runs = state
        .service
        .active()
        .into_iter()
        .map(|(kind, run_id)| ActiveRun { kind, run_id })
        .collect();
    Json(HealthResponse {
        status: "ok",
        active_runs,
        runs: state.service.health().snapshot(),
    })
}
