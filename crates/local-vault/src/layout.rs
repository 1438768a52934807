//! On-disk layout and identifier validation.
//!
//! ```text
//! <root>/<region>/<vault>/
//!     archives/<archive_id>.bin
//!     archives/<archive_id>.json
//!     uploads/<upload_id>/session.json
//!     uploads/<upload_id>/<offset>.part
//!     jobs/<job_id>.json
//! ```

use std::path::{Path, PathBuf};

use crate::LocalError;

const MAX_NAME_LEN: usize = 255;

/// Checks a vault name, region, or generated id before it becomes a path
/// component.
///
/// Allows ASCII letters, digits, `-`, `_` and `.`; rejects `.`/`..` and
/// anything longer than 255 bytes.
pub fn validate_name(kind: &str, name: &str) -> Result<(), LocalError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(LocalError::InvalidName(format!(
            "{kind} must be 1-{MAX_NAME_LEN} characters: {name:?}"
        )));
    }
    if name == "." || name == ".." {
        return Err(LocalError::InvalidName(format!(
            "{kind} not allowed: {name:?}"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(LocalError::InvalidName(format!(
            "{kind} contains {c:?}: {name:?}"
        )));
    }
    Ok(())
}

/// Paths of one vault.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    dir: PathBuf,
}

impl VaultPaths {
    pub fn new(region_dir: &Path, vault: &str) -> Result<Self, LocalError> {
        validate_name("vault name", vault)?;
        Ok(Self {
            dir: region_dir.join(vault),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archives(&self) -> PathBuf {
        self.dir.join("archives")
    }

    pub fn uploads(&self) -> PathBuf {
        self.dir.join("uploads")
    }

    pub fn jobs(&self) -> PathBuf {
        self.dir.join("jobs")
    }

    pub fn archive_data(&self, archive_id: &str) -> Result<PathBuf, LocalError> {
        validate_name("archive id", archive_id)?;
        Ok(self.archives().join(format!("{archive_id}.bin")))
    }

    pub fn archive_meta(&self, archive_id: &str) -> Result<PathBuf, LocalError> {
        validate_name("archive id", archive_id)?;
        Ok(self.archives().join(format!("{archive_id}.json")))
    }

    pub fn upload_dir(&self, upload_id: &str) -> Result<PathBuf, LocalError> {
        validate_name("upload id", upload_id)?;
        Ok(self.uploads().join(upload_id))
    }

    pub fn job(&self, job_id: &str) -> Result<PathBuf, LocalError> {
        validate_name("job id", job_id)?;
        Ok(self.jobs().join(format!("{job_id}.json")))
    }
}

/// File name of the part stored at `offset`; zero-padded so names sort by
/// offset.
pub fn part_file_name(offset: u64) -> String {
    format!("{offset:020}.part")
}

/// Inverse of [`part_file_name`].
pub fn parse_part_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".part")?.parse().ok()
}
