use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

/// Why a store refused an operation for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermanentReason {
    Unauthorized,
    QuotaExceeded,
    NotFound,
    InvalidId,
    Rejected,
}

/// Failure of a single adapter call, classified where it happens.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("{reason:?}: {message}")]
    Permanent {
        reason: PermanentReason,
        message: String,
    },
}

impl AdapterError {
    pub fn transient(message: impl Into<String>) -> Self {
        AdapterError::Transient(message.into())
    }

    pub fn permanent(reason: PermanentReason, message: impl Into<String>) -> Self {
        AdapterError::Permanent {
            reason,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::permanent(PermanentReason::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::permanent(PermanentReason::NotFound, message)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }

    pub fn reason(&self) -> Option<PermanentReason> {
        match self {
            AdapterError::Transient(_) => None,
            AdapterError::Permanent { reason, .. } => Some(*reason),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.reason() == Some(PermanentReason::Unauthorized)
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        // Status errors are classified by the adapters; what reaches here is I/O.
        AdapterError::Transient(e.to_string())
    }
}

/// Cycle-level failure: nothing (or nothing more) was executed.
#[derive(thiserror::Error, Debug)]
pub enum CycleError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("{side} store unavailable: {source}")]
    Source {
        side: crate::models::backup::Side,
        #[source]
        source: AdapterError,
    },

    #[error("state store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("cycle cancelled")]
    Cancelled,
}

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<AdapterError> for AppError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::Transient(m) => AppError::ServiceUnavailable(m),
            AdapterError::Permanent { reason: PermanentReason::NotFound, message } => AppError::NotFound(message),
            AdapterError::Permanent { message, .. } => AppError::Unprocessable(message),
        }
    }
}

impl From<CycleError> for AppError {
    fn from(e: CycleError) -> Self {
        match e {
            CycleError::Configuration(m) => AppError::Unprocessable(m),
            CycleError::Store(e) => AppError::Internal(e),
            CycleError::Cancelled => AppError::Conflict("cycle cancelled".into()),
            e @ (CycleError::Authorization(_) | CycleError::Source { .. }) => {
                AppError::ServiceUnavailable(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            AppError::ServiceUnavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_classification() {
        assert!(AdapterError::transient("503").is_transient());
        let revoked = AdapterError::unauthorized("token revoked");
        assert!(!revoked.is_transient());
        assert!(revoked.is_unauthorized());
        assert_eq!(
            AdapterError::not_found("gone").reason(),
            Some(PermanentReason::NotFound)
        );
    }

    #[test]
    fn test_adapter_error_maps_to_http_status() {
        let resp = AppError::from(AdapterError::not_found("no such snapshot")).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = AppError::from(AdapterError::transient("timeout")).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
