use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::TreeHash;

/// Region used when a vault reference omits one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// A `region:vault` reference as typed by a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VaultRef {
    pub region: String,
    pub name: String,
}

/// Error returned for malformed vault references.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaultRefError {
    #[error("vault name is empty in {0:?}")]
    EmptyName(String),

    #[error("region is empty in {0:?}")]
    EmptyRegion(String),
}

impl VaultRef {
    pub fn new(region: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            name: name.into(),
        }
    }
}

impl FromStr for VaultRef {
    type Err = VaultRefError;

    /// Splits at the first colon; without one the whole input is the vault
    /// name and the region is [`DEFAULT_REGION`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (region, name) = match s.split_once(':') {
            Some((region, name)) => (region, name),
            None => (DEFAULT_REGION, s),
        };
        if region.is_empty() {
            return Err(VaultRefError::EmptyRegion(s.to_string()));
        }
        if name.is_empty() {
            return Err(VaultRefError::EmptyName(s.to_string()));
        }
        Ok(Self::new(region, name))
    }
}

impl fmt::Display for VaultRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.region, self.name)
    }
}

/// An immutable archive stored in a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Archive {
    pub archive_id: String,
    pub size: u64,
    pub tree_hash: TreeHash,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Receipt of a finished upload, handed back to the command layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRecord {
    pub date: NaiveDate,
    pub region: String,
    pub vault: String,
    pub archive_id: String,
    pub path: String,
    pub description: String,
    pub size: u64,
    pub tree_hash: TreeHash,
}

impl ArchiveRecord {
    /// Renders `date, region, vault, archive_id, path, description`.
    pub fn to_csv_line(&self) -> String {
        format!(
            "{}, {}, {}, {}, {}, {}",
            self.date.format("%Y-%m-%d"),
            self.region,
            self.vault,
            self.archive_id,
            self.path,
            self.description
        )
    }
}

/// Server-side status of a retrieval job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Submitted,
    InProgress,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// `true` for `Succeeded` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Position in the lifecycle; terminal states share the highest rank.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Submitted => 0,
            JobStatus::InProgress => 1,
            JobStatus::Succeeded | JobStatus::Failed => 2,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Submitted => "Submitted",
            JobStatus::InProgress => "InProgress",
            JobStatus::Succeeded => "Succeeded",
            JobStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Result of a single job status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub archive_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Size of the retrieved archive (present once succeeded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_size: Option<u64>,
    /// Tree hash of the retrieved archive (present once succeeded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_hash: Option<TreeHash>,
}

/// Bytes returned by a ranged fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeBody {
    pub data: Vec<u8>,
    /// Tree hash of `data` as reported by the service, when it reports one.
    pub tree_hash: Option<TreeHash>,
}

/// Upload state of one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartStatus {
    Pending,
    InFlight,
    Committed,
    Failed,
}

/// Fetch state of one download range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeStatus {
    Pending,
    Fetched,
    Verified,
    Failed,
}
