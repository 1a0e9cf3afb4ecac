use crate::error::AppError;
use crate::models::backup::Side;
use crate::models::cycle_log::CycleLog;
use crate::services::sync_scheduler::SchedulerStatus;
use crate::state::AppState;
use axum::extract::State;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", axum::routing::get(get_status))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Serialize)]
pub struct Counts {
    pub backups: usize,
    pub local: usize,
    pub remote: usize,
    pub with_errors: usize,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub scheduler: SchedulerStatus,
    pub counts: Counts,
    pub last_failure: Option<CycleLog>,
    pub credentials_configured: Option<bool>,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, AppError> {
    let records = state.store.load_catalog().await?;
    let on = |side: Side| records.iter().filter(|r| r.presence.contains(side)).count();
    let counts = Counts {
        backups: records.len(),
        local: on(Side::Local),
        remote: on(Side::Remote),
        with_errors: records.iter().filter(|r| r.last_error.is_some()).count(),
    };

    Ok(Json(StatusResponse {
        scheduler: state.control.status(),
        counts,
        last_failure: state.store.last_failure().await?,
        credentials_configured: state.tokens.as_ref().map(|t| t.is_configured()),
    }))
}
