//! Remote store: a folder in a cloud drive.
//!
//! Copies carry `appProperties` (`backup_id`, `created_at`, `protected`) so the
//! link to the local snapshot survives restarts. Uploads use resumable sessions
//! sent in chunks pulled from the source stream, so only the chunk in flight
//! is held in memory. The total size is declared with the last chunk. A failed
//! session is remembered per backup and resumed on the next attempt instead of
//! starting over.

use super::credentials::TokenProvider;
use super::{SnapshotAdapter, SnapshotStream};
use crate::error::{AdapterError, PermanentReason};
use crate::models::backup::{Side, SnapshotMeta, SourceSnapshot};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Chunks must be multiples of this.
pub const BASE_CHUNK_SIZE: usize = 256 * 1024;
pub const MAX_CHUNK_SIZE: usize = BASE_CHUNK_SIZE * 40;
const CHUNK_TARGET_SECS: f64 = 10.0;
/// How many times one failed session location is reused before starting fresh.
pub const SESSION_REUSE_LIMIT: u32 = 10;

const LIST_FIELDS: &str = "nextPageToken,files(id,name,size,createdTime,appProperties)";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    app_properties: HashMap<String, String>,
}

impl DriveFile {
    fn into_snapshot(self) -> SourceSnapshot {
        let created_at = self
            .app_properties
            .get("created_at")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|d| d.with_timezone(&Utc))
            .or(self.created_time)
            .unwrap_or_default();
        SourceSnapshot {
            side: Side::Remote,
            backup_id: self.app_properties.get("backup_id").cloned(),
            handle: self.id,
            name: self.name,
            created_at,
            size_bytes: self.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            protected: self.app_properties.get("protected").is_some_and(|v| v == "true"),
        }
    }
}

/// Pulls fixed-size chunks off a snapshot stream, holding at most one chunk
/// plus one stream piece.
struct ChunkReader {
    stream: SnapshotStream,
    pending: BytesMut,
    ended: bool,
}

impl ChunkReader {
    fn new(stream: SnapshotStream) -> Self {
        Self {
            stream,
            pending: BytesMut::new(),
            ended: false,
        }
    }

    async fn pull(&mut self) -> Result<(), AdapterError> {
        match self.stream.next().await {
            Some(piece) => self.pending.extend_from_slice(&piece?),
            None => self.ended = true,
        }
        Ok(())
    }

    /// Discards bytes the drive already holds from an earlier attempt.
    async fn skip(&mut self, mut count: usize) -> Result<(), AdapterError> {
        while count > 0 {
            if self.pending.is_empty() {
                if self.ended {
                    return Err(AdapterError::transient(
                        "snapshot is shorter than the bytes already uploaded",
                    ));
                }
                self.pull().await?;
                continue;
            }
            let n = count.min(self.pending.len());
            self.pending.advance(n);
            count -= n;
        }
        Ok(())
    }

    /// The next chunk of at most `size` bytes, and whether it is the last one.
    async fn next_chunk(&mut self, size: usize) -> Result<(Bytes, bool), AdapterError> {
        while !self.ended && self.pending.len() <= size {
            self.pull().await?;
        }
        let chunk = self.pending.split_to(size.min(self.pending.len())).freeze();
        Ok((chunk, self.ended && self.pending.is_empty()))
    }

    /// Puts back bytes the drive did not acknowledge.
    fn unread(&mut self, tail: Bytes) {
        let mut joined = BytesMut::with_capacity(tail.len() + self.pending.len());
        joined.extend_from_slice(&tail);
        joined.extend_from_slice(&self.pending);
        self.pending = joined;
    }
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

#[derive(Debug, Clone)]
struct UploadSession {
    location: String,
    reuses: u32,
}

/// Maps a failed drive response to the error taxonomy.
pub fn classify(status: StatusCode, body: &str) -> AdapterError {
    let code = status.as_u16();
    let message = format!("drive returned HTTP {code}");
    match code {
        401 => AdapterError::transient("drive rejected the access token"),
        403 => match error_reason(body).as_deref() {
            Some("storageQuotaExceeded") => {
                AdapterError::permanent(PermanentReason::QuotaExceeded, "drive storage quota exceeded")
            }
            Some("forbidden") => AdapterError::unauthorized("drive permission denied"),
            _ => AdapterError::transient(message),
        },
        404 => AdapterError::not_found(message),
        429 | 500..=599 => AdapterError::transient(message),
        400..=499 => AdapterError::permanent(PermanentReason::Rejected, format!("{message}: {body}")),
        _ => AdapterError::transient(message),
    }
}

fn error_reason(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value["error"]["errors"]
        .as_array()?
        .iter()
        .filter_map(|e| e["reason"].as_str())
        .find(|r| *r == "storageQuotaExceeded" || *r == "forbidden")
        .map(str::to_string)
}

/// Size the next chunk so it takes about ten seconds at the observed rate.
pub fn next_chunk_size(last_size: usize, last_secs: f64) -> usize {
    if last_secs <= 0.0 {
        return MAX_CHUNK_SIZE;
    }
    let next = CHUNK_TARGET_SECS * last_size as f64 / last_secs;
    if next >= MAX_CHUNK_SIZE as f64 {
        return MAX_CHUNK_SIZE;
    }
    let rounded = (next as usize / BASE_CHUNK_SIZE) * BASE_CHUNK_SIZE;
    rounded.max(BASE_CHUNK_SIZE)
}

/// Parses `bytes=0-N` into the next byte to send.
fn resume_position(resp: &Response) -> Result<usize, AdapterError> {
    let Some(range) = resp.headers().get(RANGE) else {
        return Ok(0);
    };
    range
        .to_str()
        .ok()
        .and_then(|r| r.strip_prefix("bytes=0-"))
        .and_then(|end| end.parse::<usize>().ok())
        .map(|end| end + 1)
        .ok_or_else(|| AdapterError::transient("drive sent a malformed Range header"))
}

pub struct DriveAdapter {
    http: reqwest::Client,
    base_url: String,
    folder_id: Option<String>,
    tokens: Arc<TokenProvider>,
    sessions: DashMap<String, UploadSession>,
}

impl DriveAdapter {
    pub fn new(
        base_url: impl Into<String>,
        folder_id: Option<String>,
        tokens: Arc<TokenProvider>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        // Resumable uploads answer 308 without a Location; never follow it.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            folder_id,
            tokens,
            sessions: DashMap::new(),
        })
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.base_url)
    }

    /// Sends with a bearer token. Success and 308 come back; everything else is classified.
    async fn send(&self, req: RequestBuilder) -> Result<Response, AdapterError> {
        let token = self.tokens.access_token().await?;
        let resp = req.bearer_auth(token).send().await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::PERMANENT_REDIRECT {
            return Ok(resp);
        }
        if status == StatusCode::UNAUTHORIZED {
            self.tokens.mark_stale();
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }

    fn list_query(&self) -> String {
        match &self.folder_id {
            Some(folder) => format!("'{folder}' in parents and trashed = false"),
            None => "trashed = false and appProperties has { key='backup_id' and value!='' }".to_string(),
        }
    }

    /// Asks a remembered session where it stopped. `None` means start over.
    async fn resume_session(&self, backup_id: &str) -> Result<Option<(String, ResumePoint)>, AdapterError> {
        let Some(mut session) = self.sessions.get(backup_id).map(|s| s.clone()) else {
            return Ok(None);
        };
        if session.reuses >= SESSION_REUSE_LIMIT {
            self.sessions.remove(backup_id);
            return Ok(None);
        }
        session.reuses += 1;
        self.sessions.insert(backup_id.to_string(), session.clone());

        tracing::debug!(backup_id, "Resuming previous upload session");
        let status_query = self
            .http
            .put(&session.location)
            .header(CONTENT_LENGTH, 0)
            .header(CONTENT_RANGE, "bytes */*");
        match self.send(status_query).await {
            Ok(resp) if resp.status() == StatusCode::PERMANENT_REDIRECT => {
                let pos = resume_position(&resp)?;
                tracing::debug!(backup_id, position = pos, "Upload session resumes mid-file");
                Ok(Some((session.location, ResumePoint::At(pos))))
            }
            Ok(resp) => {
                let created: CreatedFile = resp.json().await?;
                Ok(Some((session.location, ResumePoint::Done(created.id))))
            }
            Err(e) if e.is_transient() => Err(e),
            Err(_) => {
                self.sessions.remove(backup_id);
                Ok(None)
            }
        }
    }

    async fn start_session(&self, meta: &SnapshotMeta) -> Result<String, AdapterError> {
        let mut metadata = json!({
            "name": meta.name,
            "appProperties": app_properties(meta),
        });
        if let Some(folder) = &self.folder_id {
            metadata["parents"] = json!([folder]);
        }

        let req = self
            .http
            .post(format!("{}/upload/drive/v3/files", self.base_url))
            .query(&[("uploadType", "resumable"), ("supportsAllDrives", "true")])
            .header("X-Upload-Content-Type", "application/tar")
            .json(&metadata);
        let resp = self.send(req).await?;
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AdapterError::transient("drive did not return an upload location"))?;

        self.sessions.insert(
            meta.backup_id.clone(),
            UploadSession {
                location: location.clone(),
                reuses: 0,
            },
        );
        Ok(location)
    }

    /// Sends chunks from `position` on. Returns the new file id and the total size.
    async fn send_chunks(
        &self,
        backup_id: &str,
        location: &str,
        reader: &mut ChunkReader,
        mut position: usize,
    ) -> Result<(String, usize), AdapterError> {
        let mut chunk_size = BASE_CHUNK_SIZE;
        loop {
            let (chunk, last) = reader.next_chunk(chunk_size).await?;
            let len = chunk.len();
            let range = match (len, last) {
                (0, true) => format!("bytes */{position}"),
                (_, true) => format!("bytes {}-{}/{}", position, position + len - 1, position + len),
                (_, false) => format!("bytes {}-{}/*", position, position + len - 1),
            };
            let started = Instant::now();
            let req = self
                .http
                .put(location)
                .header(CONTENT_LENGTH, len)
                .header(CONTENT_RANGE, range)
                .body(chunk.clone());

            let resp = match self.send(req).await {
                Ok(resp) => resp,
                Err(e) => {
                    // A 4xx usually means the session itself is gone.
                    if !e.is_transient() {
                        self.sessions.remove(backup_id);
                    }
                    return Err(e);
                }
            };
            chunk_size = next_chunk_size(chunk_size, started.elapsed().as_secs_f64());

            if resp.status() == StatusCode::PERMANENT_REDIRECT {
                let acked = resume_position(&resp)?;
                if acked < position || acked > position + len {
                    return Err(AdapterError::transient(format!(
                        "drive acknowledged byte {acked} while sending from {position}"
                    )));
                }
                if acked < position + len {
                    reader.unread(chunk.slice(acked - position..));
                } else if last {
                    return Err(AdapterError::transient("drive did not finish the upload after the last chunk"));
                }
                position = acked;
                tracing::debug!(backup_id, position, "Chunk accepted");
                continue;
            }
            let created: CreatedFile = resp.json().await?;
            return Ok((created.id, position + len));
        }
    }
}

fn app_properties(meta: &SnapshotMeta) -> serde_json::Value {
    json!({
        "backup_id": meta.backup_id,
        "created_at": meta.created_at.to_rfc3339(),
        "protected": meta.protected.to_string(),
    })
}

enum ResumePoint {
    At(usize),
    Done(String),
}

#[async_trait]
impl SnapshotAdapter for DriveAdapter {
    fn side(&self) -> Side {
        Side::Remote
    }

    fn check_configured(&self) -> Result<(), String> {
        if self.tokens.is_configured() {
            Ok(())
        } else {
            Err("drive credentials are not configured".into())
        }
    }

    async fn list(&self) -> Result<Vec<SourceSnapshot>, AdapterError> {
        let query = self.list_query();
        let mut snapshots = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("q", query.as_str()),
                ("fields", LIST_FIELDS),
                ("pageSize", PAGE_SIZE),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }
            let resp = self.send(self.http.get(self.files_url()).query(&params)).await?;
            let page: FileList = resp.json().await?;
            snapshots.extend(page.files.into_iter().map(DriveFile::into_snapshot));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        tracing::debug!(count = snapshots.len(), "Listed drive snapshots");
        Ok(snapshots)
    }

    async fn create(&self, _name: &str) -> Result<SourceSnapshot, AdapterError> {
        Err(AdapterError::permanent(
            PermanentReason::Rejected,
            "the drive cannot create snapshots",
        ))
    }

    async fn read(&self, handle: &str) -> Result<SnapshotStream, AdapterError> {
        let req = self
            .http
            .get(format!("{}/{}", self.files_url(), handle))
            .query(&[("alt", "media"), ("supportsAllDrives", "true")]);
        let resp = self.send(req).await?;
        Ok(resp.bytes_stream().map(|piece| piece.map_err(AdapterError::from)).boxed())
    }

    async fn write(&self, meta: &SnapshotMeta, data: SnapshotStream) -> Result<SourceSnapshot, AdapterError> {
        let mut reader = ChunkReader::new(data);
        let (file_id, total) = match self.resume_session(&meta.backup_id).await? {
            Some((_, ResumePoint::Done(id))) => (id, meta.size_bytes as usize),
            Some((location, ResumePoint::At(pos))) => {
                reader.skip(pos).await?;
                self.send_chunks(&meta.backup_id, &location, &mut reader, pos).await?
            }
            None => {
                let location = self.start_session(meta).await?;
                self.send_chunks(&meta.backup_id, &location, &mut reader, 0).await?
            }
        };
        self.sessions.remove(&meta.backup_id);
        tracing::info!(backup_id = %meta.backup_id, file_id = %file_id, size = total, "Uploaded snapshot to drive");

        Ok(SourceSnapshot {
            side: Side::Remote,
            handle: file_id,
            backup_id: Some(meta.backup_id.clone()),
            name: meta.name.clone(),
            created_at: meta.created_at,
            size_bytes: total as u64,
            protected: meta.protected,
        })
    }

    async fn update_meta(&self, handle: &str, meta: &SnapshotMeta) -> Result<(), AdapterError> {
        let req = self
            .http
            .patch(format!("{}/{}", self.files_url(), handle))
            .query(&[("supportsAllDrives", "true")])
            .json(&json!({ "appProperties": app_properties(meta) }));
        self.send(req).await?;
        tracing::debug!(file_id = handle, protected = meta.protected, "Updated drive file properties");
        Ok(())
    }

    async fn delete(&self, handle: &str) -> Result<(), AdapterError> {
        let req = self
            .http
            .delete(format!("{}/{}", self.files_url(), handle))
            .query(&[("supportsAllDrives", "true")]);
        self.send(req).await?;
        Ok(())
    }
}
