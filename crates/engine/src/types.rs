//! Progress events and small shared types.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use coldvault_protocol::JobStatus;
use coldvault_transfer::PartPlan;
use tokio::sync::mpsc;
use tracing::trace;

/// Progress event emitted during vault operations.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// A multipart session was opened.
    UploadStarted {
        upload_id: String,
        parts: usize,
        part_size: u64,
        total_bytes: u64,
    },
    /// A part was committed by the service.
    UploadProgress {
        bytes_done: u64,
        total_bytes: u64,
        parts_committed: usize,
        parts_total: usize,
        bytes_per_second: f64,
    },
    /// The archive was created and its tree hash confirmed.
    UploadCompleted { archive_id: String },
    /// A retrieval job was accepted.
    JobSubmitted { job_id: String },
    /// A retrieval job changed state.
    JobStatus { job_id: String, status: JobStatus },
    /// A range was fetched, verified and written.
    DownloadProgress {
        bytes_done: u64,
        total_bytes: u64,
        ranges_verified: usize,
        ranges_total: usize,
        bytes_per_second: f64,
    },
    /// The output was written and its tree hash confirmed.
    DownloadCompleted { bytes: u64 },
    /// The operation failed.
    Failed { error: String },
}

/// Optional event channel handle.
///
/// Events never block a transfer: when the receiver lags the event is
/// dropped.
#[derive(Debug, Clone, Default)]
pub(crate) struct Events {
    tx: Option<mpsc::Sender<TransferEvent>>,
}

impl Events {
    pub(crate) fn new(tx: mpsc::Sender<TransferEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub(crate) fn none() -> Self {
        Self { tx: None }
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.tx
            && let Err(e) = tx.try_send(event)
        {
            trace!("dropping transfer event: {e}");
        }
    }
}

/// Shared queue of parts or ranges that pool workers pull from.
#[derive(Debug)]
pub(crate) struct WorkQueue {
    items: Mutex<VecDeque<PartPlan>>,
}

impl WorkQueue {
    pub(crate) fn new(items: Vec<PartPlan>) -> Self {
        Self {
            items: Mutex::new(items.into()),
        }
    }

    /// Takes the next item. A poisoned lock still yields the remaining
    /// items; popping cannot leave the deque half-updated.
    pub(crate) fn pop(&self) -> Option<PartPlan> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}
