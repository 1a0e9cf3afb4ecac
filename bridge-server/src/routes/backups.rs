use crate::error::AppError;
use crate::models::backup::{BackupRecord, Side};
use crate::services::cycle::Trigger;
use crate::state::AppState;
use crate::ws::events::QueuedEvent;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups))
        .route("/{id}", get(get_backup))
        .route("/{id}/protected", put(set_protected))
        .route("/{id}/restore", post(request_restore))
        .route("/{id}/events", get(backup_events))
}

async fn list_backups(State(state): State<Arc<AppState>>) -> Result<Json<Vec<BackupRecord>>, AppError> {
    Ok(Json(state.store.load_catalog().await?))
}

async fn find(state: &AppState, id: &str) -> Result<BackupRecord, AppError> {
    state
        .store
        .find_record(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Backup not found".into()))
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupRecord>, AppError> {
    Ok(Json(find(&state, &id).await?))
}

#[derive(Deserialize)]
pub struct ProtectedBody {
    pub protected: bool,
}

async fn set_protected(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ProtectedBody>,
) -> Result<Json<BackupRecord>, AppError> {
    if !state.store.set_protected(&id, body.protected).await? {
        return Err(AppError::NotFound("Backup not found".into()));
    }
    tracing::info!(backup_id = %id, protected = body.protected, "Protection changed");
    let record = find(&state, &id).await?;
    // The next cycle rewrites the tag on the remote copy.
    if record.presence.contains(Side::Remote) {
        state.control.request(Trigger::Manual);
    }
    Ok(Json(record))
}

async fn request_restore(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<BackupRecord>), AppError> {
    let record = find(&state, &id).await?;
    if record.presence.contains(Side::Local) {
        return Err(AppError::Conflict("Backup is already present locally".into()));
    }
    state.store.set_restore_requested(&id, true).await?;
    tracing::info!(backup_id = %id, "Restore requested");
    state.control.request(Trigger::Manual);
    Ok((StatusCode::ACCEPTED, Json(find(&state, &id).await?)))
}

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub since: i64,
}

async fn backup_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<QueuedEvent>> {
    Json(state.events.history(&id, query.since))
}
