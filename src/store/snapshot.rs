//! Crash-safe JSON snapshots of the in-memory repository.
//!
//! Snapshots are written atomically: the JSON is written to a temp file,
//! fsynced, renamed over the target, and the parent directory is fsynced so
//! the rename itself survives a power loss.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Operation, Resource};

/// Current snapshot schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors that can occur during snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Full contents of a repository at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    pub schema_version: u32,
    pub snapshot_at: DateTime<Utc>,
    pub resources: Vec<Resource>,
    pub operations: Vec<Operation>,
}

impl RepositorySnapshot {
    pub fn new(resources: Vec<Resource>, operations: Vec<Operation>) -> Self {
        RepositorySnapshot {
            schema_version: SCHEMA_VERSION,
            snapshot_at: Utc::now(),
            resources,
            operations,
        }
    }
}

fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory so that entries created or renamed in it are durable.
fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

/// Writes `snapshot` to `path` atomically.
pub fn save_snapshot_atomic(path: &Path, snapshot: &RepositorySnapshot) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(snapshot)?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        fsync_file(&file)?;
    }

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fsync_dir(parent)?;
    }

    Ok(())
}

/// Loads a snapshot, rejecting unknown schema versions.
pub fn load_snapshot(path: &Path) -> Result<RepositorySnapshot> {
    let bytes = std::fs::read(path)?;
    let snapshot: RepositorySnapshot = serde_json::from_slice(&bytes)?;

    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(SnapshotError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: snapshot.schema_version,
        });
    }

    Ok(snapshot)
}

/// Like [`load_snapshot`], but returns `None` if the file does not exist.
pub fn try_load_snapshot(path: &Path) -> Result<Option<RepositorySnapshot>> {
    match load_snapshot(path) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(SnapshotError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
