//! Concurrent multipart upload.
//!
//! A fixed pool of workers pulls parts from a shared queue, reads and
//! hashes each one on the blocking pool, and uploads it with bounded
//! retry. Workers report to the coordinator over a channel; only the
//! coordinator touches part statuses and the digest slots.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use coldvault_protocol::{Archive, PartStatus, TreeHash};
use coldvault_transfer::{
    DigestSlots, PartPlan, ThroughputMeter, TransferError, plan, read_part, required_part_size,
    tree_hash,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::VaultError;
use crate::retry::{call_with_retry, with_timeout};
use crate::transport::Transport;
use crate::types::{Events, TransferEvent, WorkQueue};

/// Message from a part worker to the coordinator.
#[derive(Debug)]
enum PartReport {
    Started {
        index: usize,
    },
    Committed {
        index: usize,
        len: u64,
        tree_hash: TreeHash,
    },
    Failed {
        index: usize,
        error: VaultError,
    },
}

/// Uploads files to a vault as multipart sessions.
pub struct ConcurrentUploader {
    transport: Arc<dyn Transport>,
    config: TransferConfig,
    cancel: CancellationToken,
    events: Events,
}

impl ConcurrentUploader {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: TransferConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            config,
            cancel,
            events: Events::none(),
        }
    }

    pub(crate) fn with_events(mut self, events: Events) -> Self {
        self.events = events;
        self
    }

    /// Uploads `path` into `vault` and returns the created archive.
    ///
    /// On failure or cancellation the session is aborted and no archive is
    /// reported. The local file is only read.
    pub async fn upload(
        &self,
        vault: &str,
        path: &Path,
        description: &str,
    ) -> Result<Archive, VaultError> {
        self.config.validate()?;

        let file_size = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                return Err(VaultError::NotFound(format!(
                    "{} is not a regular file",
                    path.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let part_size = required_part_size(file_size, self.config.part_size)?;
        if part_size != self.config.part_size {
            info!(
                file_size,
                preferred = self.config.part_size,
                part_size,
                "part size enlarged to stay within the part limit"
            );
        }
        let parts = plan(file_size, part_size)?;

        if self.cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }

        let upload_id = call_with_retry(
            &self.config.retry,
            self.config.call_timeout,
            &self.cancel,
            "initiate_upload",
            || self.transport.initiate_upload(vault, description, part_size),
        )
        .await
        .map_err(|e| e.into_vault_error(|e, _| VaultError::Transport(e)))?;

        info!(
            vault,
            upload_id = %upload_id,
            parts = parts.len(),
            part_size,
            file_size,
            "upload session opened"
        );
        self.events.emit(TransferEvent::UploadStarted {
            upload_id: upload_id.clone(),
            parts: parts.len(),
            part_size,
            total_bytes: file_size,
        });

        match self
            .run_session(vault, &upload_id, path, parts, file_size)
            .await
        {
            Ok(archive) => {
                info!(
                    vault,
                    archive_id = %archive.archive_id,
                    size = archive.size,
                    tree_hash = %archive.tree_hash,
                    "upload complete"
                );
                self.events.emit(TransferEvent::UploadCompleted {
                    archive_id: archive.archive_id.clone(),
                });
                Ok(archive)
            }
            Err(e) => {
                self.abort(vault, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn run_session(
        &self,
        vault: &str,
        upload_id: &str,
        path: &Path,
        parts: Vec<PartPlan>,
        file_size: u64,
    ) -> Result<Archive, VaultError> {
        let root = self
            .upload_parts(vault, upload_id, path, parts, file_size)
            .await?;

        let archive = call_with_retry(
            &self.config.retry,
            self.config.call_timeout,
            &self.cancel,
            "complete_upload",
            || {
                self.transport
                    .complete_upload(vault, upload_id, file_size, root)
            },
        )
        .await
        .map_err(|e| e.into_vault_error(|e, _| VaultError::Transport(e)))?;

        if archive.tree_hash != root {
            return Err(VaultError::Integrity {
                expected: root,
                actual: archive.tree_hash,
            });
        }
        if archive.size != file_size {
            return Err(VaultError::Protocol(format!(
                "archive {} reports {} bytes, uploaded {file_size}",
                archive.archive_id, archive.size
            )));
        }
        Ok(archive)
    }

    /// Uploads every part and returns the folded root digest.
    async fn upload_parts(
        &self,
        vault: &str,
        upload_id: &str,
        path: &Path,
        parts: Vec<PartPlan>,
        file_size: u64,
    ) -> Result<TreeHash, VaultError> {
        let total_parts = parts.len();
        let session_cancel = self.cancel.child_token();
        let queue = Arc::new(WorkQueue::new(parts));
        let (tx, mut rx) = mpsc::channel(self.config.concurrency * 2);

        let mut workers = JoinSet::new();
        for _ in 0..self.config.concurrency.min(total_parts) {
            let worker = PartWorker {
                transport: Arc::clone(&self.transport),
                config: self.config.clone(),
                vault: vault.to_string(),
                upload_id: upload_id.to_string(),
                path: path.to_path_buf(),
                queue: Arc::clone(&queue),
                tx: tx.clone(),
                cancel: session_cancel.clone(),
            };
            workers.spawn(worker.run());
        }
        drop(tx);

        let mut slots = DigestSlots::new(total_parts);
        let mut statuses = vec![PartStatus::Pending; total_parts];
        let mut speed = ThroughputMeter::default();
        speed.start();
        let mut bytes_done = 0u64;
        let mut committed = 0usize;
        let mut failure: Option<VaultError> = None;

        while let Some(report) = rx.recv().await {
            match report {
                PartReport::Started { index } => {
                    statuses[index] = PartStatus::InFlight;
                }
                PartReport::Committed {
                    index,
                    len,
                    tree_hash,
                } => {
                    statuses[index] = PartStatus::Committed;
                    if let Err(e) = slots.insert(index, tree_hash) {
                        if failure.is_none() {
                            failure = Some(e.into());
                        }
                        session_cancel.cancel();
                        continue;
                    }
                    bytes_done += len;
                    committed += 1;
                    speed.record(len);
                    debug!(index, committed, total_parts, "part committed");
                    self.events.emit(TransferEvent::UploadProgress {
                        bytes_done,
                        total_bytes: file_size,
                        parts_committed: committed,
                        parts_total: total_parts,
                        bytes_per_second: speed.bytes_per_second(),
                    });
                }
                PartReport::Failed { index, error } => {
                    statuses[index] = PartStatus::Failed;
                    if failure.is_none() {
                        warn!(index, error = %error, "part failed, stopping upload");
                        failure = Some(error);
                        session_cancel.cancel();
                    }
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined
                && failure.is_none()
            {
                failure = Some(VaultError::Protocol(format!("upload worker failed: {e}")));
            }
        }

        if let Some(err) = failure {
            let committed_parts = statuses
                .iter()
                .filter(|s| **s == PartStatus::Committed)
                .count();
            debug!(committed_parts, total_parts, "upload stopped early");
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }
        Ok(slots.root()?)
    }

    /// Best-effort abort: one attempt, not subject to cancellation.
    async fn abort(&self, vault: &str, upload_id: &str) {
        match with_timeout(
            self.config.call_timeout,
            self.transport.abort_upload(vault, upload_id),
        )
        .await
        {
            Ok(()) => info!(vault, upload_id, "upload session aborted"),
            Err(e) => warn!(vault, upload_id, error = %e, "failed to abort upload session"),
        }
    }
}

/// One member of the upload pool.
struct PartWorker {
    transport: Arc<dyn Transport>,
    config: TransferConfig,
    vault: String,
    upload_id: String,
    path: PathBuf,
    queue: Arc<WorkQueue>,
    tx: mpsc::Sender<PartReport>,
    cancel: CancellationToken,
}

impl PartWorker {
    async fn run(self) {
        while !self.cancel.is_cancelled() {
            let Some(part) = self.next_part() else {
                break;
            };
            if self
                .tx
                .send(PartReport::Started { index: part.index })
                .await
                .is_err()
            {
                break;
            }

            let (report, failed) = match self.upload_one(part).await {
                Ok(tree_hash) => (
                    PartReport::Committed {
                        index: part.index,
                        len: part.len,
                        tree_hash,
                    },
                    false,
                ),
                Err(error) => (
                    PartReport::Failed {
                        index: part.index,
                        error,
                    },
                    true,
                ),
            };
            if self.tx.send(report).await.is_err() || failed {
                break;
            }
        }
    }

    fn next_part(&self) -> Option<PartPlan> {
        self.queue.pop()
    }

    async fn upload_one(&self, part: PartPlan) -> Result<TreeHash, VaultError> {
        let (data, digest) = tokio::task::spawn_blocking({
            let path = self.path.clone();
            move || -> Result<_, TransferError> {
                let data = read_part(&path, part.offset, part.len)?;
                let digest = tree_hash(&data);
                Ok((data, digest))
            }
        })
        .await
        .map_err(|e| VaultError::Upload {
            offset: part.offset,
            reason: format!("task join error: {e}"),
        })??;

        call_with_retry(
            &self.config.retry,
            self.config.call_timeout,
            &self.cancel,
            "upload_part",
            || {
                self.transport.upload_part(
                    &self.vault,
                    &self.upload_id,
                    part.offset,
                    &data,
                    digest,
                )
            },
        )
        .await
        .map_err(|e| {
            e.into_vault_error(|e, attempts| VaultError::Upload {
                offset: part.offset,
                reason: format!("{e} (after {attempts} attempts)"),
            })
        })?;

        Ok(digest)
    }
}
