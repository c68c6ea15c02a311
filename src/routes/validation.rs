//! Changeset validation route handlers
//!
//! Engine runs are blocking (SQLite, file copies) and go through
//! `spawn_blocking`. Findings and fatal sandbox failures both come back as a
//! `ValidationReport` with status 200; only malformed requests are errors.

use crate::error::{validation_error, ApiResult, AppError};
use crate::models::{BatchValidateRequest, ValidateRequest};
use crate::simulation::{BatchReport, ValidationReport};
use crate::state::SharedState;
use axum::{extract::State, Json};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use validator::Validate;

/// Database the request runs against: its own `databasePath` or the configured
/// one. A requested path must resolve inside the database root.
pub(crate) fn source_path(state: &SharedState, requested: Option<&str>) -> ApiResult<PathBuf> {
    let engine = &state.settings.engine;
    let Some(requested) = requested else {
        return Ok(engine.database_path.clone());
    };
    engine.resolve_database_path(requested).ok_or_else(|| {
        warn!("Rejected databasePath '{}' outside {}", requested, engine.database_root().display());
        validation_error(format!(
            "databasePath '{}' must name a database inside the configured database directory",
            requested
        ))
    })
}

fn join_error(e: tokio::task::JoinError) -> AppError {
    AppError::Internal(format!("validation task failed: {}", e))
}

/// Validate a single changeset
pub async fn validate_changeset(
    State(state): State<SharedState>,
    Json(payload): Json<ValidateRequest>,
) -> ApiResult<Json<ValidationReport>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let source = source_path(&state, payload.database_path.as_deref())?;
    debug!("Validating changeset against {}", source.display());

    let report = match state.schemas.get_or_load(&source).await {
        Ok(schema) => {
            let state = state.clone();
            tokio::task::spawn_blocking(move || {
                state.engine.validate(&source, &schema, &payload.changeset)
            })
            .await
            .map_err(join_error)?
        }
        // the engine turns an unusable source into a SetupError report
        Err(_) => {
            let state = state.clone();
            tokio::task::spawn_blocking(move || state.engine.validate_path(&source, &payload.changeset))
                .await
                .map_err(join_error)?
        }
    };

    info!(
        "Changeset validation {}: {} errors, {} warnings",
        if report.valid { "passed" } else { "failed" },
        report.errors.len(),
        report.warnings.len()
    );
    Ok(Json(report))
}

/// Validate several changesets, each in a fresh sandbox
pub async fn validate_batch(
    State(state): State<SharedState>,
    Json(payload): Json<BatchValidateRequest>,
) -> ApiResult<Json<BatchReport>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let source = source_path(&state, payload.database_path.as_deref())?;
    let cases: Vec<(String, serde_json::Value)> = payload
        .cases
        .into_iter()
        .enumerate()
        .map(|(i, case)| (case.name.unwrap_or_else(|| format!("case-{}", i + 1)), case.changeset))
        .collect();

    let schema = state.schemas.get_or_load(&source).await;
    let state = state.clone();
    let batch = tokio::task::spawn_blocking(move || match schema {
        Ok(schema) => state.engine.validate_batch(&source, &schema, cases),
        // the engine turns an unusable source into per-case SetupError reports
        Err(_) => state.engine.validate_batch_path(&source, cases),
    })
    .await
    .map_err(join_error)?;

    info!("Batch validation: {}/{} passed", batch.passed, batch.total);
    Ok(Json(batch))
}
