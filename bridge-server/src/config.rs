use crate::error::CycleError;
use crate::models::backup::Side;
use crate::services::backoff::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Process configuration, read once at start-up.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub credentials_path: PathBuf,
    pub log_level: String,
    pub supervisor_url: String,
    pub supervisor_token: String,
    pub drive_url: String,
    pub drive_refresh_url: String,
    pub drive_client_id: String,
    pub drive_folder_id: Option<String>,
    pub request_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "/data".into()));

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8099),
            db_path: data_dir.join("bridge.db"),
            credentials_path: data_dir.join("credentials.json"),
            data_dir,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            supervisor_url: std::env::var("SUPERVISOR_URL")
                .unwrap_or_else(|_| "http://supervisor".into()),
            supervisor_token: std::env::var("SUPERVISOR_TOKEN").unwrap_or_default(),
            drive_url: std::env::var("DRIVE_URL")
                .unwrap_or_else(|_| "https://www.googleapis.com".into()),
            drive_refresh_url: std::env::var("DRIVE_REFRESH_URL")
                .unwrap_or_else(|_| "https://backup.example.com/drive/refresh".into()),
            drive_client_id: std::env::var("DRIVE_CLIENT_ID").unwrap_or_default(),
            drive_folder_id: std::env::var("DRIVE_FOLDER_ID").ok().filter(|v| !v.is_empty()),
            request_timeout: Duration::from_secs(
                std::env::var("REQUEST_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(180),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionLimits {
    #[serde(default)]
    pub max_count: Option<usize>,
    #[serde(default)]
    pub max_age_days: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub local: RetentionLimits,
    #[serde(default)]
    pub remote: RetentionLimits,
    /// Which side loses its copy first when both would delete the same record.
    #[serde(default = "default_delete_first")]
    pub delete_first: Side,
}

impl RetentionPolicy {
    pub fn limits(&self, side: Side) -> RetentionLimits {
        match side {
            Side::Local => self.local,
            Side::Remote => self.remote,
        }
    }
}

/// Runtime settings. Edited through the settings endpoint and snapshotted at cycle start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_retention")]
    pub retention: RetentionPolicy,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Create a local snapshot when the newest one is older than this.
    #[serde(default)]
    pub snapshot_interval_hours: Option<u32>,
    #[serde(default = "default_snapshot_name_template")]
    pub snapshot_name_template: String,
    /// Allowed created-at skew when linking unlabelled remote copies by name.
    #[serde(default = "default_link_tolerance_secs")]
    pub link_tolerance_secs: u64,
}

pub const MAX_CONCURRENCY: usize = 8;
pub const MIN_SYNC_INTERVAL_SECS: u64 = 60;

fn default_delete_first() -> Side {
    Side::Remote
}

fn default_sync_interval_secs() -> u64 {
    3600
}

fn default_retention() -> RetentionPolicy {
    RetentionPolicy {
        local: RetentionLimits {
            max_count: Some(4),
            max_age_days: None,
        },
        remote: RetentionLimits {
            max_count: Some(4),
            max_age_days: None,
        },
        delete_first: default_delete_first(),
    }
}

fn default_concurrency() -> usize {
    2
}

fn default_max_attempts() -> u32 {
    5
}

fn default_call_timeout_secs() -> u64 {
    300
}

fn default_snapshot_name_template() -> String {
    "Full Snapshot {date}".to_string()
}

fn default_link_tolerance_secs() -> u64 {
    1
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval_secs(),
            retention: default_retention(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff: BackoffPolicy::default(),
            call_timeout_secs: default_call_timeout_secs(),
            snapshot_interval_hours: None,
            snapshot_name_template: default_snapshot_name_template(),
            link_tolerance_secs: default_link_tolerance_secs(),
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), CycleError> {
        let bad = |msg: String| Err(CycleError::Configuration(msg));

        for side in Side::ALL {
            let limits = self.retention.limits(side);
            if limits.max_count == Some(0) {
                return bad(format!("{side} max_count must be at least 1"));
            }
            if limits.max_age_days == Some(0) {
                return bad(format!("{side} max_age_days must be at least 1"));
            }
        }
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return bad(format!("concurrency must be between 1 and {MAX_CONCURRENCY}"));
        }
        if self.max_attempts == 0 {
            return bad("max_attempts must be at least 1".into());
        }
        if self.sync_interval_secs < MIN_SYNC_INTERVAL_SECS {
            return bad(format!("sync_interval_secs must be at least {MIN_SYNC_INTERVAL_SECS}"));
        }
        if self.call_timeout_secs == 0 {
            return bad("call_timeout_secs must be at least 1".into());
        }
        if self.snapshot_interval_hours == Some(0) {
            return bad("snapshot_interval_hours must be at least 1".into());
        }
        self.backoff.validate().map_err(CycleError::Configuration)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}
