//! Local store: the host's snapshot supervisor.
//!
//! The supervisor assigns each snapshot a slug. That slug is the canonical
//! backup id for everything created locally.

use super::{SnapshotAdapter, SnapshotStream};
use crate::error::{AdapterError, PermanentReason};
use crate::models::backup::{Side, SnapshotMeta, SourceSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Every supervisor answer is wrapped as `{result, data}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    result: String,
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BackupList {
    #[serde(default)]
    backups: Vec<SupervisorBackup>,
}

#[derive(Debug, Deserialize)]
struct SupervisorBackup {
    slug: String,
    name: String,
    date: DateTime<Utc>,
    /// Megabytes.
    #[serde(default)]
    size: f64,
}

impl SupervisorBackup {
    fn into_snapshot(self) -> SourceSnapshot {
        SourceSnapshot {
            side: Side::Local,
            handle: self.slug.clone(),
            backup_id: Some(self.slug),
            name: self.name,
            created_at: self.date,
            size_bytes: (self.size * BYTES_PER_MB).round() as u64,
            protected: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SlugOnly {
    slug: String,
}

pub fn classify(status: StatusCode, body: &str) -> AdapterError {
    let code = status.as_u16();
    let message = format!("supervisor returned HTTP {code}: {body}");
    match code {
        401 | 403 => AdapterError::unauthorized(message),
        404 => AdapterError::not_found(message),
        400 => AdapterError::permanent(PermanentReason::InvalidId, message),
        408 | 429 | 500..=599 => AdapterError::transient(message),
        400..=499 => AdapterError::permanent(PermanentReason::Rejected, message),
        _ => AdapterError::transient(message),
    }
}

pub struct SupervisorAdapter {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl SupervisorAdapter {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, AdapterError> {
        let resp = req.bearer_auth(&self.token).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }

    async fn data<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, AdapterError> {
        let envelope: Envelope<T> = self.send(req).await?.json().await?;
        if envelope.result != "ok" {
            return Err(AdapterError::transient(format!(
                "supervisor answered {}: {}",
                envelope.result,
                envelope.message.unwrap_or_default()
            )));
        }
        envelope
            .data
            .ok_or_else(|| AdapterError::transient("supervisor answer carried no data"))
    }

    async fn info(&self, slug: &str) -> Result<SourceSnapshot, AdapterError> {
        let backup: SupervisorBackup = self
            .data(self.http.get(self.url(&format!("/backups/{slug}/info"))))
            .await?;
        Ok(backup.into_snapshot())
    }
}

#[async_trait]
impl SnapshotAdapter for SupervisorAdapter {
    fn side(&self) -> Side {
        Side::Local
    }

    fn check_configured(&self) -> Result<(), String> {
        if self.token.is_empty() {
            Err("supervisor token is not configured".into())
        } else {
            Ok(())
        }
    }

    async fn list(&self) -> Result<Vec<SourceSnapshot>, AdapterError> {
        let list: BackupList = self.data(self.http.get(self.url("/backups"))).await?;
        tracing::debug!(count = list.backups.len(), "Listed local snapshots");
        Ok(list.backups.into_iter().map(SupervisorBackup::into_snapshot).collect())
    }

    async fn create(&self, name: &str) -> Result<SourceSnapshot, AdapterError> {
        tracing::info!(name, "Requesting a new local snapshot");
        let created: SlugOnly = self
            .data(
                self.http
                    .post(self.url("/backups/new/full"))
                    .json(&json!({ "name": name })),
            )
            .await?;
        self.info(&created.slug).await
    }

    async fn read(&self, handle: &str) -> Result<SnapshotStream, AdapterError> {
        let resp = self
            .send(self.http.get(self.url(&format!("/backups/{handle}/download"))))
            .await?;
        Ok(resp.bytes_stream().map(|piece| piece.map_err(AdapterError::from)).boxed())
    }

    async fn write(&self, meta: &SnapshotMeta, data: SnapshotStream) -> Result<SourceSnapshot, AdapterError> {
        // Sent chunked: listed sizes are rounded megabytes, not exact lengths.
        let part = reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(data))
            .file_name(format!("{}.tar", meta.backup_id))
            .mime_str("application/tar")
            .map_err(|e| AdapterError::transient(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let created: SlugOnly = self
            .data(self.http.post(self.url("/backups/new/upload")).multipart(form))
            .await?;
        if created.slug != meta.backup_id {
            tracing::warn!(
                backup_id = %meta.backup_id,
                slug = %created.slug,
                "Supervisor stored the snapshot under a different slug"
            );
        }

        let mut stored = self.info(&created.slug).await?;
        stored.backup_id = Some(meta.backup_id.clone());
        Ok(stored)
    }

    async fn delete(&self, handle: &str) -> Result<(), AdapterError> {
        self.send(self.http.delete(self.url(&format!("/backups/{handle}"))))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::Path;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use serde_json::Value;

    async fn serve(app: Router) -> SupervisorAdapter {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        SupervisorAdapter::new(format!("http://{addr}"), "token", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_list_converts_megabytes_and_slugs() {
        let app = Router::new().route(
            "/backups",
            get(|| async {
                Json(serde_json::json!({
                    "result": "ok",
                    "data": { "backups": [
                        { "slug": "a1b2", "name": "Full 1", "date": "2024-05-01T03:00:00Z", "size": 1.5 }
                    ]}
                }))
            }),
        );
        let local = serve(app).await;
        let snaps = local.list().await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].backup_id.as_deref(), Some("a1b2"));
        assert_eq!(snaps[0].handle, "a1b2");
        assert_eq!(snaps[0].size_bytes, 1_572_864);
    }

    #[tokio::test]
    async fn test_create_fetches_info_of_new_slug() {
        let app = Router::new()
            .route(
                "/backups/new/full",
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["name"], "Nightly");
                    Json(serde_json::json!({ "result": "ok", "data": { "slug": "n1" } }))
                }),
            )
            .route(
                "/backups/{slug}/info",
                get(|Path(slug): Path<String>| async move {
                    Json(serde_json::json!({ "result": "ok", "data": {
                        "slug": slug, "name": "Nightly", "date": "2024-05-01T03:00:00Z", "size": 0.0
                    }}))
                }),
            );
        let local = serve(app).await;
        let snap = local.create("Nightly").await.unwrap();
        assert_eq!(snap.handle, "n1");
        assert_eq!(snap.name, "Nightly");
    }

    #[tokio::test]
    async fn test_error_statuses_are_classified() {
        let app = Router::new()
            .route("/backups", get(|| async { AxumStatus::UNAUTHORIZED }))
            .route("/backups/{slug}", delete(|| async { AxumStatus::NOT_FOUND }))
            .route(
                "/backups/{slug}/download",
                get(|| async { AxumStatus::BAD_GATEWAY }),
            );
        let local = serve(app).await;

        assert!(local.list().await.unwrap_err().is_unauthorized());
        assert_eq!(
            local.delete("gone").await.unwrap_err().reason(),
            Some(PermanentReason::NotFound)
        );
        assert!(matches!(local.read("x").await, Err(e) if e.is_transient()));
    }

    #[tokio::test]
    async fn test_upload_streams_body_and_reports_stored_size() {
        let app = Router::new()
            .route(
                "/backups/new/upload",
                post(|body: Bytes| async move {
                    let text = String::from_utf8_lossy(&body);
                    assert!(text.contains("part-one|part-two"), "multipart body: {text}");
                    Json(serde_json::json!({ "result": "ok", "data": { "slug": "u1" } }))
                }),
            )
            .route(
                "/backups/{slug}/info",
                get(|Path(slug): Path<String>| async move {
                    Json(serde_json::json!({ "result": "ok", "data": {
                        "slug": slug, "name": "Uploaded", "date": "2024-05-01T03:00:00Z", "size": 2.0
                    }}))
                }),
            );
        let local = serve(app).await;
        let meta = SnapshotMeta {
            backup_id: "u1".into(),
            name: "Uploaded".into(),
            created_at: Utc::now(),
            size_bytes: 0,
            protected: false,
        };
        let parts: Vec<Result<bytes::Bytes, AdapterError>> = vec![
            Ok(bytes::Bytes::from_static(b"part-one|")),
            Ok(bytes::Bytes::from_static(b"part-two")),
        ];

        let stored = local
            .write(&meta, futures_util::stream::iter(parts).boxed())
            .await
            .unwrap();
        assert_eq!(stored.handle, "u1");
        assert_eq!(stored.backup_id.as_deref(), Some("u1"));
        assert_eq!(stored.size_bytes, 2 * 1024 * 1024);
    }
}
