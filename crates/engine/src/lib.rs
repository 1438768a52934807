//! Chunked transfer engine for cold-archive vaults.
//!
//! This crate holds the transfer logic and no backend: callers provide a
//! [`Transport`] implementation that talks to the actual service.
//!
//! # Operations
//!
//! 1. **Upload** — split a file into parts, upload them through a bounded
//!    worker pool, fold per-part tree hashes into the archive root
//! 2. **Retrieve** — submit a retrieval job and poll it until terminal
//! 3. **Download** — fetch the job output in ranges, write them at their
//!    offsets and verify the whole-archive tree hash

pub mod client;
pub mod config;
pub mod download;
pub mod error;
#[cfg(test)]
mod mock;
pub mod retrieval;
mod retry;
pub mod transport;
pub mod types;
pub mod upload;

// Re-export primary types for convenience.
pub use client::{RETRIEVAL_DESCRIPTION, VaultClient};
pub use config::{PollConfig, RetryPolicy, TransferConfig};
pub use download::ConcurrentDownloader;
pub use error::VaultError;
pub use retrieval::{CompletedJob, RetrievalJob, Transition};
pub use transport::{Transport, TransportError, TransportFuture};
pub use types::TransferEvent;
pub use upload::ConcurrentUploader;
