//! Data models and DTOs (Data Transfer Objects)
//!
//! Contains all request/response structures used by the API.

use crate::introspection::Schema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Request to validate one changeset
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    /// Raw changeset document; parsed and checked by the engine
    pub changeset: Value,

    /// Overrides the configured canonical database
    #[serde(default)]
    #[validate(length(min = 1, message = "databasePath must not be empty"))]
    pub database_path: Option<String>,
}

/// One named changeset inside a batch
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct BatchCase {
    #[serde(default)]
    #[validate(length(min = 1, max = 128, message = "Case name must be between 1 and 128 characters"))]
    pub name: Option<String>,

    pub changeset: Value,
}

/// Request to validate several independent changesets
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BatchValidateRequest {
    #[validate(length(min = 1, max = 100, message = "Between 1 and 100 cases are required"))]
    #[validate(nested)]
    pub cases: Vec<BatchCase>,

    #[serde(default)]
    #[validate(length(min = 1, message = "databasePath must not be empty"))]
    pub database_path: Option<String>,
}

/// Query for the schema endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaQuery {
    #[serde(default)]
    pub database_path: Option<String>,

    /// Drop the cached schema and introspect again
    #[serde(default)]
    pub refresh: bool,
}

/// Schema of the canonical database
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaResponse {
    pub database_path: String,
    pub table_count: usize,
    pub schema: Schema,
}
