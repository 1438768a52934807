//! CLI configuration.
//!
//! Stored as TOML at `$COLDVAULT_CONFIG`, or `~/.config/coldvault/config.toml`
//! by default. Every field is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use coldvault_engine::{PollConfig, RetryPolicy, TransferConfig};
use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory of the local vault store.
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,

    /// Seconds before a retrieval job's output becomes available.
    #[serde(default)]
    pub job_ready_after_secs: u64,

    /// Upload part size in MiB (power of two).
    #[serde(default = "default_part_size_mib")]
    pub part_size_mib: u64,

    /// Download range size in MiB (power of two).
    #[serde(default = "default_range_size_mib")]
    pub range_size_mib: u64,

    /// Parallel part uploads or range downloads.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Timeout for each service call, in seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Attempts per part or range before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Seconds between retrieval job status checks.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Failed status checks in a row tolerated while waiting for a job.
    #[serde(default = "default_max_poll_errors")]
    pub max_poll_errors: u32,
}

fn default_store_root() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("coldvault")
}

fn default_part_size_mib() -> u64 {
    32
}

fn default_range_size_mib() -> u64 {
    4
}

fn default_concurrency() -> usize {
    10
}

fn default_call_timeout_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    5
}

fn default_poll_interval_secs() -> u64 {
    600
}

fn default_max_poll_errors() -> u32 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            job_ready_after_secs: 0,
            part_size_mib: default_part_size_mib(),
            range_size_mib: default_range_size_mib(),
            concurrency: default_concurrency(),
            call_timeout_secs: default_call_timeout_secs(),
            max_attempts: default_max_attempts(),
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_errors: default_max_poll_errors(),
        }
    }
}

impl Config {
    /// Loads `path`, or the default location. A missing file yields the
    /// defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path(),
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Engine settings derived from this configuration.
    pub fn transfer_config(&self) -> anyhow::Result<TransferConfig> {
        let defaults = TransferConfig::default();
        Ok(TransferConfig {
            part_size: mib_to_bytes("part_size_mib", self.part_size_mib)?,
            range_size: mib_to_bytes("range_size_mib", self.range_size_mib)?,
            concurrency: self.concurrency,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
            poll: PollConfig {
                interval: Duration::from_secs(self.poll_interval_secs),
                retry: RetryPolicy {
                    max_attempts: self.max_poll_errors,
                    ..defaults.poll.retry
                },
            },
        })
    }
}

fn mib_to_bytes(field: &str, mib: u64) -> anyhow::Result<u64> {
    mib.checked_mul(MIB)
        .with_context(|| format!("{field} = {mib} is too large"))
}

/// Returns the default configuration file path.
fn config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("coldvault")
        .join("config.toml")
}
