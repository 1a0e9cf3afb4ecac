//! Access-token lifecycle for the cloud drive.
//!
//! Tokens come from the credential-exchange service; this module keeps them
//! fresh, persists them, and forgets them once the exchange reports them revoked.

use crate::error::AdapterError;
use crate::models::credentials::{self, CredentialState};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshError {
    #[serde(default)]
    error: String,
}

pub struct TokenProvider {
    http: reqwest::Client,
    refresh_url: String,
    client_id: String,
    path: PathBuf,
    timeout: Duration,
    state: RwLock<Option<CredentialState>>,
    /// Set when the drive rejected the current access token.
    stale: AtomicBool,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl TokenProvider {
    /// Loads any saved credentials from `path`.
    pub fn open(
        http: reqwest::Client,
        refresh_url: impl Into<String>,
        client_id: impl Into<String>,
        path: PathBuf,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let state = credentials::load(&path)?;
        if state.is_some() {
            tracing::info!(path = %path.display(), "Loaded drive credentials");
        }
        Ok(Self {
            http,
            refresh_url: refresh_url.into(),
            client_id: client_id.into(),
            path,
            timeout,
            state: RwLock::new(state),
            stale: AtomicBool::new(false),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.read().is_some()
    }

    pub fn current(&self) -> Option<CredentialState> {
        self.read().clone()
    }

    /// Stores credentials handed over by the exchange service.
    pub fn set(&self, creds: CredentialState) -> anyhow::Result<()> {
        credentials::save(&self.path, &creds)?;
        *self.write() = Some(creds);
        self.stale.store(false, Ordering::SeqCst);
        tracing::info!("Drive credentials updated");
        Ok(())
    }

    pub fn forget(&self) -> anyhow::Result<()> {
        *self.write() = None;
        credentials::remove(&self.path)?;
        tracing::warn!("Drive credentials removed; re-authorization required");
        Ok(())
    }

    /// Forces a refresh before the next request.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    pub async fn access_token(&self) -> Result<String, AdapterError> {
        if let Some(token) = self.fresh_token()? {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(token) = self.fresh_token()? {
            return Ok(token);
        }

        let current = self
            .current()
            .ok_or_else(|| AdapterError::unauthorized("drive credentials are not configured"))?;
        let refreshed = self.refresh(&current).await?;
        let token = refreshed.access_token.clone();

        if let Err(e) = credentials::save(&self.path, &refreshed) {
            tracing::warn!("Failed to persist refreshed credentials: {e:#}");
        }
        *self.write() = Some(refreshed);
        self.stale.store(false, Ordering::SeqCst);
        Ok(token)
    }

    fn fresh_token(&self) -> Result<Option<String>, AdapterError> {
        let guard = self.read();
        let creds = guard
            .as_ref()
            .ok_or_else(|| AdapterError::unauthorized("drive credentials are not configured"))?;
        if self.stale.load(Ordering::SeqCst) || creds.needs_refresh(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(creds.access_token.clone()))
    }

    async fn refresh(&self, current: &CredentialState) -> Result<CredentialState, AdapterError> {
        tracing::debug!("Requesting refreshed drive credentials");
        let resp = self
            .http
            .post(&self.refresh_url)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("refresh_token", current.refresh_token.as_str()),
            ])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| AdapterError::transient(format!("credential refresh failed: {e}")))?;

        let status = resp.status().as_u16();
        match status {
            200 => {
                let body: RefreshResponse = resp
                    .json()
                    .await
                    .map_err(|e| AdapterError::transient(format!("malformed refresh response: {e}")))?;
                Ok(CredentialState {
                    access_token: body.access_token,
                    refresh_token: body.refresh_token.unwrap_or_else(|| current.refresh_token.clone()),
                    expires_at: Utc::now() + ChronoDuration::seconds(body.expires_in),
                })
            }
            401 => {
                if let Err(e) = self.forget() {
                    tracing::warn!("Failed to remove revoked credentials: {e:#}");
                }
                Err(AdapterError::unauthorized("drive credentials were revoked"))
            }
            _ => {
                let detail = resp
                    .json::<RefreshError>()
                    .await
                    .map(|b| b.error)
                    .unwrap_or_default();
                Err(AdapterError::transient(format!(
                    "credential refresh returned HTTP {status} {detail}"
                )))
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<CredentialState>> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<CredentialState>> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}
