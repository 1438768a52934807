//! Retrieval job lifecycle.
//!
//! `Submitted → InProgress → {Succeeded, Failed}`; `InProgress` may be
//! skipped. The job only moves when a status query is applied to it.

use std::time::Duration;

use coldvault_protocol::{JobSnapshot, JobStatus, TreeHash};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::VaultError;
use crate::retry::{call_with_retry, with_timeout};
use crate::transport::{Transport, TransportError};
use crate::types::{Events, TransferEvent};

/// Outcome of applying a snapshot to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Same state as before.
    Unchanged,
    /// The job moved forward.
    Advanced { from: JobStatus, to: JobStatus },
    /// The snapshot would move the job backwards or out of a terminal
    /// state and was discarded.
    Ignored,
}

/// A succeeded retrieval job whose output can be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedJob {
    vault: String,
    job_id: String,
    archive_id: String,
    size: u64,
    tree_hash: TreeHash,
}

impl CompletedJob {
    /// Builds a completed job from a `Succeeded` snapshot carrying size
    /// and digest. Any other snapshot yields `None`.
    pub fn from_snapshot(vault: &str, snapshot: &JobSnapshot) -> Option<Self> {
        if snapshot.status != JobStatus::Succeeded {
            return None;
        }
        Some(Self {
            vault: vault.to_string(),
            job_id: snapshot.job_id.clone(),
            archive_id: snapshot.archive_id.clone(),
            size: snapshot.archive_size?,
            tree_hash: snapshot.tree_hash?,
        })
    }

    pub fn vault(&self) -> &str {
        &self.vault
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn archive_id(&self) -> &str {
        &self.archive_id
    }

    /// Size of the retrieved archive in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Tree hash the downloaded bytes must reproduce.
    pub fn tree_hash(&self) -> TreeHash {
        self.tree_hash
    }
}

/// Client-side view of one retrieval job.
#[derive(Debug, Clone)]
pub struct RetrievalJob {
    vault: String,
    job_id: String,
    archive_id: String,
    status: JobStatus,
    last: Option<JobSnapshot>,
}

impl RetrievalJob {
    /// Tracks an already-submitted job, starting from `Submitted`.
    pub fn new(vault: &str, job_id: &str, archive_id: &str) -> Self {
        Self {
            vault: vault.to_string(),
            job_id: job_id.to_string(),
            archive_id: archive_id.to_string(),
            status: JobStatus::Submitted,
            last: None,
        }
    }

    /// Submits a retrieval for `archive_id`.
    ///
    /// Unknown archives fail with [`VaultError::NotFound`].
    pub async fn submit(
        transport: &dyn Transport,
        config: &TransferConfig,
        cancel: &CancellationToken,
        vault: &str,
        archive_id: &str,
        description: &str,
    ) -> Result<Self, VaultError> {
        let job_id = call_with_retry(
            &config.retry,
            config.call_timeout,
            cancel,
            "submit_retrieval",
            || transport.submit_retrieval(vault, archive_id, description),
        )
        .await
        .map_err(|e| e.into_vault_error(|e, _| VaultError::Transport(e)))?;

        info!(vault, archive_id, job_id = %job_id, "retrieval job submitted");
        Ok(Self::new(vault, &job_id, archive_id))
    }

    pub fn vault(&self) -> &str {
        &self.vault
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn archive_id(&self) -> &str {
        &self.archive_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Latest applied snapshot.
    pub fn last_snapshot(&self) -> Option<&JobSnapshot> {
        self.last.as_ref()
    }

    /// Queries the job once. Does not change local state.
    pub async fn poll(
        &self,
        transport: &dyn Transport,
        call_timeout: Duration,
    ) -> Result<JobSnapshot, TransportError> {
        with_timeout(call_timeout, transport.query_job(&self.vault, &self.job_id)).await
    }

    /// Applies a status snapshot.
    pub fn apply(&mut self, snapshot: JobSnapshot) -> Result<Transition, VaultError> {
        if snapshot.job_id != self.job_id {
            return Err(VaultError::Protocol(format!(
                "status for job {} returned while polling job {}",
                snapshot.job_id, self.job_id
            )));
        }
        if !snapshot.archive_id.is_empty() && snapshot.archive_id != self.archive_id {
            return Err(VaultError::Protocol(format!(
                "job {} reports archive {}, expected {}",
                self.job_id, snapshot.archive_id, self.archive_id
            )));
        }

        let from = self.status;
        let to = snapshot.status;
        if from.is_terminal() && to != from {
            warn!(job_id = %self.job_id, %from, %to, "ignoring status change after terminal state");
            return Ok(Transition::Ignored);
        }
        if to.rank() < from.rank() {
            warn!(job_id = %self.job_id, %from, %to, "ignoring backwards status change");
            return Ok(Transition::Ignored);
        }
        if to == JobStatus::Succeeded
            && (snapshot.archive_size.is_none() || snapshot.tree_hash.is_none())
        {
            return Err(VaultError::Protocol(format!(
                "job {} succeeded without archive size or tree hash",
                self.job_id
            )));
        }

        self.status = to;
        self.last = Some(snapshot);
        if from == to {
            Ok(Transition::Unchanged)
        } else {
            Ok(Transition::Advanced { from, to })
        }
    }

    /// The downloadable result, once the job has succeeded.
    pub fn completed(&self) -> Option<CompletedJob> {
        self.last
            .as_ref()
            .and_then(|s| CompletedJob::from_snapshot(&self.vault, s))
    }

    /// Polls until the job is terminal.
    ///
    /// Sleeps `poll.interval` between queries. Failed queries back off and
    /// count against `poll.retry.max_attempts`; `NotFound` ends the
    /// wait at once. Cancelling only stops waiting locally.
    pub async fn wait_until_complete(
        &mut self,
        transport: &dyn Transport,
        config: &TransferConfig,
        cancel: &CancellationToken,
    ) -> Result<CompletedJob, VaultError> {
        self.wait_with_events(transport, config, cancel, &Events::none())
            .await
    }

    pub(crate) async fn wait_with_events(
        &mut self,
        transport: &dyn Transport,
        config: &TransferConfig,
        cancel: &CancellationToken,
        events: &Events,
    ) -> Result<CompletedJob, VaultError> {
        let poll = &config.poll;
        let mut consecutive_errors = 0u32;

        loop {
            match self.status {
                JobStatus::Succeeded => {
                    return self.completed().ok_or_else(|| {
                        VaultError::Protocol(format!("job {} has no result", self.job_id))
                    });
                }
                JobStatus::Failed => {
                    let message = self
                        .last
                        .as_ref()
                        .and_then(|s| s.status_message.clone())
                        .unwrap_or_else(|| "no status message".into());
                    return Err(VaultError::RetrievalFailed {
                        job_id: self.job_id.clone(),
                        message,
                    });
                }
                JobStatus::Submitted | JobStatus::InProgress => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(VaultError::Cancelled),
                r = self.poll(transport, config.call_timeout) => r,
            };

            let delay = match result {
                Ok(snapshot) => {
                    consecutive_errors = 0;
                    if let Transition::Advanced { from, to } = self.apply(snapshot)? {
                        info!(job_id = %self.job_id, %from, %to, "retrieval job status changed");
                        events.emit(TransferEvent::JobStatus {
                            job_id: self.job_id.clone(),
                            status: to,
                        });
                    }
                    if self.status.is_terminal() {
                        continue;
                    }
                    debug!(job_id = %self.job_id, status = %self.status, "job still running");
                    poll.interval
                }
                Err(e) if !e.is_retryable() => return Err(e.into()),
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= poll.retry.max_attempts {
                        warn!(
                            job_id = %self.job_id,
                            consecutive_errors,
                            error = %e,
                            "giving up on job status queries"
                        );
                        return Err(VaultError::Transport(e));
                    }
                    let delay = poll.retry.delay_for_attempt(consecutive_errors);
                    warn!(
                        job_id = %self.job_id,
                        consecutive_errors,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "job status query failed"
                    );
                    delay
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(VaultError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
