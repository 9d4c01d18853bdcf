//! Error handling module
//!
//! Provides unified error types for the detection pipeline, the CLI and the
//! dashboard. Each variant maps onto one failure class of the pipeline so that
//! callers can decide whether to degrade, abort the cycle, or stop the process.

use crate::config::ConfigError;
use crate::process::ProcessError;
use crate::store::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Privileged tooling or credentials are missing. Never fatal: the run
    /// is downgraded to the fallback strategy.
    #[error("Strategy unavailable: {0}")]
    StrategyUnavailable(String),

    /// A single detection attempt failed; the next tick retries.
    #[error("Transient detection failure: {0}")]
    TransientDetection(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Version control refused the commit after validation passed.
    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Supervised unit crashed: {0}")]
    SubprocessCrash(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("A detection cycle is already in progress")]
    CycleInFlight,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code, used in HTTP bodies and notification payloads.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::StrategyUnavailable(_) => "STRATEGY_UNAVAILABLE",
            AppError::TransientDetection(_) => "TRANSIENT_DETECTION_FAILURE",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Commit(_) => "COMMIT_FAILURE",
            AppError::SubprocessCrash(_) => "SUBPROCESS_CRASH",
            AppError::Config(ConfigError::Corrupt { .. }) => "CONFIG_CORRUPTION",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Store(_) => "STORAGE_ERROR",
            AppError::Process(_) => "PROCESS_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Pool(_) => "POOL_ERROR",
            AppError::CycleInFlight => "CYCLE_IN_FLIGHT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Io(_) => "IO_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Fatal errors stop the whole process instead of a single cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Config(ConfigError::Corrupt { .. }) | AppError::Config(ConfigError::Invalid(_))
        )
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message, details) = match &self {
            AppError::CycleInFlight => (
                StatusCode::CONFLICT,
                "A detection cycle is already running, try again later".to_string(),
                None,
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            AppError::StrategyUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone(), None)
            }
            other => {
                error!("Request failed: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                    Some(other.to_string()),
                )
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_config_is_fatal() {
        let err = AppError::Config(ConfigError::Corrupt {
            path: "config.json".into(),
            reason: "expected value at line 1".into(),
        });
        assert!(err.is_fatal());
        assert_eq!(err.code(), "CONFIG_CORRUPTION");
    }

    #[test]
    fn cycle_in_flight_maps_to_conflict() {
        let response = AppError::CycleInFlight.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(!AppError::CycleInFlight.is_fatal());
    }
}
