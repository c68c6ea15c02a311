//! Schema route handlers

use super::validation::source_path;
use crate::error::{not_found_error, ApiResult};
use crate::models::{SchemaQuery, SchemaResponse, SuccessResponse};
use crate::state::SharedState;
use axum::{
    extract::{Query, State},
    Json,
};
use tracing::debug;

/// Introspected schema of the canonical database (or `databasePath`)
pub async fn get_schema(
    State(state): State<SharedState>,
    Query(query): Query<SchemaQuery>,
) -> ApiResult<Json<SuccessResponse<SchemaResponse>>> {
    let source = source_path(&state, query.database_path.as_deref())?;
    if !source.is_file() {
        return Err(not_found_error(format!(
            "Database '{}' does not exist",
            source.display()
        )));
    }

    if query.refresh {
        debug!("Refreshing cached schema for {}", source.display());
        state.schemas.invalidate(&source).await;
    }

    let schema = state.schemas.get_or_load(&source).await?;
    let table_count = schema.tables.len();

    Ok(Json(SuccessResponse::with_data(
        format!("Found {} tables", table_count),
        SchemaResponse {
            database_path: source.display().to_string(),
            table_count,
            schema: (*schema).clone(),
        },
    )))
}
