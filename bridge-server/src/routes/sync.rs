use crate::error::AppError;
use crate::models::action::ActionPlanItem;
use crate::models::backup::SourceSnapshot;
use crate::models::cycle_log::CycleLog;
use crate::services::cycle::Trigger;
use crate::services::sync_scheduler::Requested;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_CYCLE_LIMIT: usize = 20;
const MAX_CYCLE_LIMIT: usize = 200;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sync", axum::routing::post(request_sync))
        .route("/api/sync/cancel", axum::routing::post(cancel_sync))
        .route("/api/plan", axum::routing::get(preview_plan))
        .route("/api/cycles", axum::routing::get(list_cycles))
        .route("/api/snapshots", axum::routing::post(create_snapshot))
}

async fn request_sync(State(state): State<Arc<AppState>>) -> Result<(StatusCode, Json<Value>), AppError> {
    match state.control.request(Trigger::Manual) {
        Requested::Stopped => Err(AppError::ServiceUnavailable("Scheduler is shutting down".into())),
        outcome => {
            tracing::info!(outcome = ?outcome, "Manual sync requested");
            Ok((StatusCode::ACCEPTED, Json(json!({ "requested": outcome }))))
        }
    }
}

async fn cancel_sync(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cancelled = state.control.cancel_current();
    if cancelled {
        tracing::info!("Cancelling running cycle");
    }
    Json(json!({ "cancelled": cancelled }))
}

async fn preview_plan(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ActionPlanItem>>, AppError> {
    Ok(Json(state.engine.preview_plan().await?))
}

#[derive(Deserialize)]
pub struct CyclesQuery {
    pub limit: Option<usize>,
}

async fn list_cycles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CyclesQuery>,
) -> Result<Json<Vec<CycleLog>>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_CYCLE_LIMIT).clamp(1, MAX_CYCLE_LIMIT);
    Ok(Json(state.store.recent_cycles(limit).await?))
}

#[derive(Deserialize, Default)]
pub struct CreateSnapshotBody {
    pub name: Option<String>,
}

async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateSnapshotBody>>,
) -> Result<(StatusCode, Json<SourceSnapshot>), AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let template = match body.name.filter(|n| !n.trim().is_empty()) {
        Some(name) => name,
        None => state.store.load_settings().await?.snapshot_name_template,
    };
    let created = state.engine.create_snapshot(&template).await?;
    state.control.request(Trigger::Manual);
    Ok((StatusCode::CREATED, Json(created)))
}
