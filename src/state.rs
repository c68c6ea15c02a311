//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::config::Settings;
use crate::introspection::SchemaCache;
use crate::simulation::ValidationEngine;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Settings,

    /// Introspected schemas, keyed by database path
    pub schemas: SchemaCache,

    /// Validation engine (sandboxes, rules, report archive)
    pub engine: ValidationEngine,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let engine = ValidationEngine::new(&settings.engine, settings.rules.clone());
        Self {
            settings,
            schemas: SchemaCache::new(),
            engine,
        }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
