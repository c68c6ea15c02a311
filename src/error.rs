//! Error handling module
//!
//! Two layers of errors live here:
//! - [`SimulationError`]: fatal engine failures (the sandbox cannot be built or
//!   read). Record-level problems are never errors; they become report findings.
//! - [`AppError`]: HTTP-facing errors rendered as JSON responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::error;

/// Fatal failures that abort a validation run
#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Sandbox setup failed for {path}: {reason}")]
    Setup { path: PathBuf, reason: String },

    #[error("Sandbox copy failed integrity check (expected {expected}, got {actual})")]
    Integrity { expected: String, actual: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema unavailable: {0}")]
    Schema(String),
}

impl SimulationError {
    pub fn setup(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SimulationError::Setup {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Simulation error: {0}")]
    Simulation(#[from] SimulationError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
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
        let (status, error_code, message, details) = match &self {
            AppError::Simulation(e) => {
                error!("Simulation error: {:?}", e);
                let status = match e {
                    SimulationError::Setup { .. } | SimulationError::Schema(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (
                    status,
                    "SIMULATION_ERROR",
                    "The sandbox could not be prepared".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None),
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}

/// Helper function to create a not found error
pub fn not_found_error(msg: impl Into<String>) -> AppError {
    AppError::NotFound(msg.into())
}
