pub mod backups;
pub mod credentials;
pub mod settings;
pub mod status;
pub mod sync;

use crate::state::AppState;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(status::health))
        .nest("/api/status", status::router())
        .nest("/api/backups", backups::router())
        .nest("/api/settings", settings::router())
        .nest("/api/credentials", credentials::router())
        .merge(sync::router())
        .route("/ws", get(crate::ws::events::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryAdapter;
    use crate::config::AppConfig;
    use crate::db::StateStore;
    use crate::services::cycle::Engine;
    use crate::services::executor::Adapters;
    use crate::services::sync_scheduler::CycleControl;
    use crate::ws::events::EventBus;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use serde_json::Value;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn config(dir: &std::path::Path) -> AppConfig {
        AppConfig {
            port: 0,
            data_dir: dir.to_path_buf(),
            db_path: dir.join("bridge.db"),
            credentials_path: dir.join("credentials.json"),
            log_level: "info".into(),
            supervisor_url: "http://127.0.0.1:1".into(),
            supervisor_token: String::new(),
            drive_url: "http://127.0.0.1:1".into(),
            drive_refresh_url: "http://127.0.0.1:1".into(),
            drive_client_id: String::new(),
            drive_folder_id: None,
            request_timeout: Duration::from_secs(1),
        }
    }

    struct App {
        _dir: tempfile::TempDir,
        state: Arc<AppState>,
        remote: Arc<MemoryAdapter>,
    }

    fn app() -> App {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let store = StateStore::open(&PathBuf::from(&cfg.db_path)).unwrap();
        let remote = Arc::new(MemoryAdapter::remote());
        let engine = Engine::new(
            Adapters::new(Arc::new(MemoryAdapter::local()), remote.clone()),
            store,
            EventBus::new(),
        );
        let control = CycleControl::new(CancellationToken::new());
        let state = Arc::new(AppState::new(cfg, engine, control, None));
        App {
            _dir: dir,
            state,
            remote,
        }
    }

    async fn call(state: &Arc<AppState>, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(b) => {
                req = req.header("content-type", "application/json");
                Body::from(b.to_string())
            }
            None => Body::empty(),
        };
        let resp = create_router(state.clone()).oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = call(&app.state, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected() {
        let app = app();
        let (status, body) = call(&app.state, "PUT", "/api/settings", Some(r#"{"concurrency":0}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("concurrency"));

        let (status, body) = call(&app.state, "PUT", "/api/settings", Some(r#"{"concurrency":3}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["concurrency"], 3);
        let (_, body) = call(&app.state, "GET", "/api/settings", None).await;
        assert_eq!(body["concurrency"], 3);
    }

    #[tokio::test]
    async fn test_restore_marks_remote_only_backup_and_queues_sync() {
        let app = app();
        app.remote.seed("b1", "Full 1", Utc::now());
        let report = app.state.engine.run_cycle(
            crate::services::cycle::Trigger::Manual,
            &CancellationToken::new(),
        )
        .await;
        assert!(report.plan.is_empty());

        let (status, body) = call(&app.state, "POST", "/api/backups/b1/restore", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["restore_requested"], true);
        assert!(app.state.control.status().pending.is_some());

        let (_, plan) = call(&app.state, "GET", "/api/plan", None).await;
        assert_eq!(plan[0]["kind"], "download");

        let (status, _) = call(&app.state, "POST", "/api/backups/missing/restore", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_protect_toggle() {
        let app = app();
        app.remote.seed("b1", "Full 1", Utc::now());
        app.state
            .engine
            .run_cycle(crate::services::cycle::Trigger::Manual, &CancellationToken::new())
            .await;

        let (status, body) = call(&app.state, "PUT", "/api/backups/b1/protected", Some(r#"{"protected":true}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["protected"], true);
        assert!(app.state.control.status().pending.is_some());

        // The queued cycle carries the flag onto the remote copy.
        app.state
            .engine
            .run_cycle(crate::services::cycle::Trigger::Manual, &CancellationToken::new())
            .await;
        assert_eq!(app.remote.protected_tag("b1"), Some(true));
    }

    #[tokio::test]
    async fn test_credentials_unmanaged_and_sync_request() {
        let app = app();
        let (status, _) = call(&app.state, "DELETE", "/api/credentials", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app.state, "POST", "/api/sync", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["requested"], "queued");
        let (_, body) = call(&app.state, "POST", "/api/sync", None).await;
        assert_eq!(body["requested"], "coalesced");

        let (status, body) = call(&app.state, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scheduler"]["phase"], "idle");
        assert_eq!(body["counts"]["backups"], 0);
    }
}
