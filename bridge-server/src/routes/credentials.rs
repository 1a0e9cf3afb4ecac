use crate::adapters::credentials::TokenProvider;
use crate::error::AppError;
use crate::models::credentials::CredentialState;
use crate::services::cycle::Trigger;
use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", post(store_credentials).delete(forget_credentials))
}

fn tokens(state: &AppState) -> Result<&Arc<TokenProvider>, AppError> {
    state
        .tokens
        .as_ref()
        .ok_or_else(|| AppError::NotFound("This instance does not manage drive credentials".into()))
}

/// Called by the credential-exchange service once the user has authorised the drive.
async fn store_credentials(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CredentialState>,
) -> Result<StatusCode, AppError> {
    if body.access_token.is_empty() || body.refresh_token.is_empty() {
        return Err(AppError::BadRequest("access_token and refresh_token are required".into()));
    }
    tokens(&state)?.set(body)?;
    tracing::info!("Drive credentials stored");
    state.control.request(Trigger::Manual);
    Ok(StatusCode::NO_CONTENT)
}

async fn forget_credentials(State(state): State<Arc<AppState>>) -> Result<StatusCode, AppError> {
    tokens(&state)?.forget()?;
    tracing::info!("Drive credentials removed");
    Ok(StatusCode::NO_CONTENT)
}
