//! JSON metadata records and atomic file writes.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use coldvault_protocol::TreeHash;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::LocalError;

/// An open multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub upload_id: String,
    pub description: String,
    pub part_size: u64,
    pub created_at: DateTime<Utc>,
}

/// A stored archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveMeta {
    pub archive_id: String,
    pub size: u64,
    pub tree_hash: TreeHash,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A retrieval job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub archive_id: String,
    #[serde(default)]
    pub description: String,
    pub submitted_at: DateTime<Utc>,
}

/// Reads a JSON record; a missing file becomes `NotFound(what)`.
pub fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T, LocalError> {
    let bytes = fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LocalError::NotFound(what.to_string())
        } else {
            LocalError::Io(e)
        }
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Writes a JSON record atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), LocalError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Temporary sibling of `path`, unique per call.
pub fn temp_path(path: &Path) -> std::path::PathBuf {
    let temp_name = format!(".tmp.{}", Uuid::new_v4());
    path.with_file_name(
        path.file_name()
            .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
            .unwrap_or_else(|| temp_name.clone()),
    )
}

/// Writes to a temp file, fsyncs, then renames over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), LocalError> {
    let temp = temp_path(path);
    {
        let mut file = fs::File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&temp, path)?;
    Ok(())
}
