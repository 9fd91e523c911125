use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

use crate::types::StopReason;

/// Infrastructure failures. Any of these escaping a run marks it `failed`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sourcing error: {0}")]
    Sourcing(String),

    #[error("A {0} scan is already running")]
    AlreadyRunning(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::AlreadyRunning(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Per-ticker failures. Caught at the ticker boundary and turned into a
/// detail entry; they never unwind into orchestrator control flow.
#[derive(Debug, Clone, Error)]
pub enum ScanError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("auth/session: {0}")]
    Auth(String),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("unexpected data shape: {0}")]
    DataShape(String),

    #[error("validation: {0}")]
    Validation(String),

    /// Still in flight when the deep-scan phase hit its stall or budget limit.
    #[error("cut off: {0}")]
    CutOff(StopReason),
}

impl ScanError {
    /// Worth another attempt through the retry helper.
    pub fn is_transient(&self) -> bool {
        matches!(self, ScanError::Transport(_) | ScanError::Timeout(_))
    }

    /// Short machine-readable tag stored alongside detail entries.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::Transport(_) => "transport",
            ScanError::Auth(_) => "auth",
            ScanError::Timeout(_) => "timeout",
            ScanError::DataShape(_) => "data_shape",
            ScanError::Validation(_) => "validation",
            ScanError::CutOff(_) => "cut_off",
        }
    }
}

impl From<reqwest::Error> for ScanError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ScanError::Timeout(Duration::from_secs(crate::config::HTTP_TIMEOUT_SECS))
        } else if e.is_decode() {
            ScanError::DataShape(e.to_string())
        } else {
            ScanError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_timeout_are_transient() {
        assert!(ScanError::Transport("reset".into()).is_transient());
        assert!(ScanError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(!ScanError::Auth("crumb".into()).is_transient());
        assert!(!ScanError::DataShape("bad".into()).is_transient());
        assert!(!ScanError::Validation("gap".into()).is_transient());
        assert!(!ScanError::CutOff(StopReason::Stalled).is_transient());
    }

    #[test]
    fn conflict_maps_to_409() {
        let resp = AppError::AlreadyRunning("ath".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
