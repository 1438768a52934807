//! Storage-service abstraction.
//!
//! `Transport` is implemented once per backend (the local filesystem vault
//! in `coldvault-local`, an HTTP client elsewhere). Engine logic only talks
//! to this trait, which keeps it testable with scripted mocks.

use std::future::Future;
use std::pin::Pin;

use coldvault_protocol::{Archive, JobSnapshot, RangeBody, TreeHash};

/// Boxed future returned by every [`Transport`] call.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Failure reported by a transport call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("request timed out")]
    Timeout,

    #[error("service rejected tree hash: expected {expected}, computed {actual}")]
    Integrity { expected: TreeHash, actual: TreeHash },

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Throttled(_) | Self::Timeout
        )
    }
}

/// Calls exposed by a cold-archive storage service.
///
/// One instance serves one region; the vault name travels with each call.
pub trait Transport: Send + Sync {
    /// Returns whether `vault` exists.
    fn vault_exists<'a>(&'a self, vault: &'a str) -> TransportFuture<'a, bool>;

    /// Opens a multipart upload session and returns its id.
    fn initiate_upload<'a>(
        &'a self,
        vault: &'a str,
        description: &'a str,
        part_size: u64,
    ) -> TransportFuture<'a, String>;

    /// Stores one part at `offset`. The service checks `tree_hash`.
    fn upload_part<'a>(
        &'a self,
        vault: &'a str,
        upload_id: &'a str,
        offset: u64,
        data: &'a [u8],
        tree_hash: TreeHash,
    ) -> TransportFuture<'a, ()>;

    /// Finalizes a session into an archive.
    fn complete_upload<'a>(
        &'a self,
        vault: &'a str,
        upload_id: &'a str,
        total_size: u64,
        tree_hash: TreeHash,
    ) -> TransportFuture<'a, Archive>;

    /// Discards a session and every part stored for it.
    fn abort_upload<'a>(&'a self, vault: &'a str, upload_id: &'a str) -> TransportFuture<'a, ()>;

    /// Starts an asynchronous retrieval job and returns its id.
    fn submit_retrieval<'a>(
        &'a self,
        vault: &'a str,
        archive_id: &'a str,
        description: &'a str,
    ) -> TransportFuture<'a, String>;

    /// Reads the current state of a job. Has no side effects.
    fn query_job<'a>(&'a self, vault: &'a str, job_id: &'a str) -> TransportFuture<'a, JobSnapshot>;

    /// Reads `length` bytes of a succeeded job's output at `offset`.
    fn fetch_range<'a>(
        &'a self,
        vault: &'a str,
        job_id: &'a str,
        offset: u64,
        length: u64,
    ) -> TransportFuture<'a, RangeBody>;
}
