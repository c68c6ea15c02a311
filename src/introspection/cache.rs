//! Schema cache keyed by database path.
//!
//! Concurrent validation runs share one immutable [`Schema`] per canonical
//! database. An entry is reloaded when the file's modification time moves.

use super::{Schema, SqliteIntrospector};
use crate::error::SimulationError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Clone)]
struct CachedSchema {
    modified: SystemTime,
    schema: Arc<Schema>,
}

/// Thread-safe schema cache
#[derive(Clone, Default)]
pub struct SchemaCache {
    inner: Arc<RwLock<HashMap<PathBuf, CachedSchema>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached schema for `path`, introspecting it when absent or stale
    pub async fn get_or_load(&self, path: &Path) -> Result<Arc<Schema>, SimulationError> {
        let modified = Self::modified_time(path)?;

        {
            let cache = self.inner.read().await;
            if let Some(entry) = cache.get(path) {
                if entry.modified == modified {
                    return Ok(entry.schema.clone());
                }
            }
        }

        let owned = path.to_path_buf();
        let schema = tokio::task::spawn_blocking(move || SqliteIntrospector::introspect_path(&owned))
            .await
            .map_err(|e| SimulationError::Schema(format!("introspection task failed: {}", e)))??;
        let schema = Arc::new(schema);

        debug!("Schema cache refreshed for {}", path.display());

        let mut cache = self.inner.write().await;
        cache.insert(
            path.to_path_buf(),
            CachedSchema {
                modified,
                schema: schema.clone(),
            },
        );
        Ok(schema)
    }

    /// Drop the entry for `path`
    pub async fn invalidate(&self, path: &Path) {
        self.inner.write().await.remove(path);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    fn modified_time(path: &Path) -> Result<SystemTime, SimulationError> {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| {
                SimulationError::Schema(format!("cannot stat {}: {}", path.display(), e))
            })
    }
}
