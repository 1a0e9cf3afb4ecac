use crate::config::EngineSettings;
use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(get_settings).put(update_settings))
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Result<Json<EngineSettings>, AppError> {
    Ok(Json(state.store.load_settings().await?))
}

/// Takes effect from the next cycle; a running cycle keeps the settings it started with.
async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EngineSettings>,
) -> Result<Json<EngineSettings>, AppError> {
    body.validate()?;
    state.store.save_settings(body.clone()).await?;
    tracing::info!(
        sync_interval_secs = body.sync_interval_secs,
        concurrency = body.concurrency,
        "Settings updated"
    );
    Ok(Json(body))
}
