//! Sandbox Manager
//!
//! Each validation run gets a private copy of the canonical database in its
//! own temporary directory. The copy is checksummed against the source before
//! it is handed out and removed when the [`Sandbox`] is destroyed or dropped.

use crate::error::SimulationError;
use rusqlite::{Connection, OpenFlags};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SANDBOX_FILE: &str = "sandbox.sqlite";

/// Creates isolated database copies
#[derive(Debug, Clone, Default)]
pub struct SandboxManager {
    /// `None` uses the system temp directory
    base_dir: Option<PathBuf>,
}

impl SandboxManager {
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self { base_dir }
    }

    /// Copy `source` into a fresh private directory and verify the copy
    pub fn create(&self, source: &Path) -> Result<Sandbox, SimulationError> {
        if !source.is_file() {
            return Err(SimulationError::setup(source, "source database not found"));
        }

        let id = Uuid::new_v4();
        let mut builder = tempfile::Builder::new();
        builder.prefix("changeflow-sandbox-");
        let dir = match &self.base_dir {
            Some(base) => {
                std::fs::create_dir_all(base)
                    .map_err(|e| SimulationError::setup(base, format!("cannot create sandbox dir: {}", e)))?;
                builder.tempdir_in(base)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| SimulationError::setup(source, format!("cannot allocate sandbox: {}", e)))?;

        let path = dir.path().join(SANDBOX_FILE);

        let expected = file_checksum(source)
            .map_err(|e| SimulationError::setup(source, format!("cannot read source database: {}", e)))?;
        std::fs::copy(source, &path)
            .map_err(|e| SimulationError::setup(source, format!("copy failed: {}", e)))?;
        let actual = file_checksum(&path)
            .map_err(|e| SimulationError::setup(&path, format!("cannot read sandbox copy: {}", e)))?;

        if expected != actual {
            // dir is dropped here, taking the bad copy with it
            return Err(SimulationError::Integrity { expected, actual });
        }

        info!("🧪 Sandbox {} created at {}", id, path.display());

        Ok(Sandbox {
            id,
            path,
            checksum: actual,
            dir: Some(dir),
        })
    }
}

/// One run's private database copy
#[derive(Debug)]
pub struct Sandbox {
    id: Uuid,
    path: PathBuf,
    checksum: String,
    dir: Option<TempDir>,
}

impl Sandbox {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checksum of the source at copy time
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn is_destroyed(&self) -> bool {
        self.dir.is_none()
    }

    /// Open a read-write connection to the copy
    pub fn open(&self) -> Result<Connection, SimulationError> {
        if self.is_destroyed() {
            return Err(SimulationError::setup(&self.path, "sandbox already destroyed"));
        }
        Ok(Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?)
    }

    /// Remove the copy. Safe to call more than once; failures are logged only.
    pub fn destroy(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let dir_path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => debug!("Sandbox {} destroyed", self.id),
            Err(e) => warn!(
                "⚠️  Failed to remove sandbox {} at {}: {}",
                self.id,
                dir_path.display(),
                e
            ),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// SHA-256 of a file's bytes
pub fn file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
