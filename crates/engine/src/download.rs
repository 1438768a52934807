//! Concurrent ranged download of a succeeded retrieval job.
//!
//! Workers fetch and hash ranges; the coordinator is the only writer to
//! the sink and to the digest slots. The result channel is bounded by the
//! pool size, so at most that many fetched ranges wait in memory.

use std::sync::Arc;

use coldvault_protocol::{RangeBody, RangeStatus, TreeHash};
use coldvault_transfer::{
    DigestSlots, PartPlan, RangeSink, ThroughputMeter, plan_ranges, tree_hash,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::VaultError;
use crate::retrieval::CompletedJob;
use crate::retry::call_with_retry;
use crate::transport::{Transport, TransportError};
use crate::types::{Events, TransferEvent, WorkQueue};

#[derive(Debug)]
enum RangeReport {
    Fetched {
        range: PartPlan,
        data: Vec<u8>,
        tree_hash: TreeHash,
    },
    Failed {
        range: PartPlan,
        error: VaultError,
    },
}

/// Downloads retrieval job output into a [`RangeSink`].
pub struct ConcurrentDownloader {
    transport: Arc<dyn Transport>,
    config: TransferConfig,
    cancel: CancellationToken,
    events: Events,
}

impl ConcurrentDownloader {
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

    /// Downloads `job` into `sink` and verifies the result against the
    /// job's tree hash. Returns the sink after it has been finished.
    ///
    /// On [`VaultError::Integrity`] the sink content is untrustworthy.
    pub async fn download<S>(&self, job: &CompletedJob, sink: S) -> Result<S, VaultError>
    where
        S: RangeSink + 'static,
    {
        self.config.validate()?;
        let total = job.size();
        let expected = job.tree_hash();

        if total == 0 {
            let actual = tree_hash(&[]);
            if actual != expected {
                return Err(VaultError::Integrity { expected, actual });
            }
            let sink = finish_sink(sink).await?;
            self.events
                .emit(TransferEvent::DownloadCompleted { bytes: 0 });
            return Ok(sink);
        }

        let ranges = plan_ranges(total, self.config.range_size)?;
        info!(
            vault = job.vault(),
            job_id = job.job_id(),
            size = total,
            ranges = ranges.len(),
            "download started"
        );

        let (sink, root) = self.fetch_ranges(job, ranges, sink).await?;
        if root != expected {
            warn!(
                job_id = job.job_id(),
                %expected,
                actual = %root,
                "downloaded data does not match archive tree hash"
            );
            return Err(VaultError::Integrity {
                expected,
                actual: root,
            });
        }

        let sink = finish_sink(sink).await?;
        info!(job_id = job.job_id(), bytes = total, tree_hash = %root, "download verified");
        self.events
            .emit(TransferEvent::DownloadCompleted { bytes: total });
        Ok(sink)
    }

    async fn fetch_ranges<S>(
        &self,
        job: &CompletedJob,
        ranges: Vec<PartPlan>,
        mut sink: S,
    ) -> Result<(S, TreeHash), VaultError>
    where
        S: RangeSink + 'static,
    {
        let total = job.size();
        let total_ranges = ranges.len();
        let session_cancel = self.cancel.child_token();
        let queue = Arc::new(WorkQueue::new(ranges));
        let (tx, mut rx) = mpsc::channel(self.config.concurrency);

        let mut workers = JoinSet::new();
        for _ in 0..self.config.concurrency.min(total_ranges) {
            let worker = RangeWorker {
                transport: Arc::clone(&self.transport),
                config: self.config.clone(),
                vault: job.vault().to_string(),
                job_id: job.job_id().to_string(),
                queue: Arc::clone(&queue),
                tx: tx.clone(),
                cancel: session_cancel.clone(),
            };
            workers.spawn(worker.run());
        }
        drop(tx);

        let mut slots = DigestSlots::new(total_ranges);
        let mut statuses = vec![RangeStatus::Pending; total_ranges];
        let mut speed = ThroughputMeter::default();
        speed.start();
        let mut bytes_done = 0u64;
        let mut verified = 0usize;
        let mut failure: Option<VaultError> = None;

        while let Some(report) = rx.recv().await {
            let (range, data, digest) = match report {
                RangeReport::Fetched {
                    range,
                    data,
                    tree_hash,
                } => (range, data, tree_hash),
                RangeReport::Failed { range, error } => {
                    statuses[range.index] = RangeStatus::Failed;
                    if failure.is_none() {
                        warn!(
                            offset = range.offset,
                            error = %error,
                            "range failed, stopping download"
                        );
                        failure = Some(error);
                        session_cancel.cancel();
                    }
                    continue;
                }
            };
            statuses[range.index] = RangeStatus::Fetched;
            if failure.is_some() {
                continue;
            }

            let written = tokio::task::spawn_blocking(move || {
                let result = sink.write_range(range.offset, &data);
                (sink, result)
            })
            .await;
            let (returned, result) = match written {
                Ok(pair) => pair,
                Err(e) => {
                    session_cancel.cancel();
                    return Err(VaultError::Download {
                        offset: range.offset,
                        length: range.len,
                        reason: format!("task join error: {e}"),
                    });
                }
            };
            sink = returned;

            if let Err(e) = result.map_err(VaultError::from).and_then(|()| {
                slots.insert(range.index, digest).map_err(VaultError::from)
            }) {
                statuses[range.index] = RangeStatus::Failed;
                failure = Some(e);
                session_cancel.cancel();
                continue;
            }

            statuses[range.index] = RangeStatus::Verified;
            bytes_done += range.len;
            verified += 1;
            speed.record(range.len);
            debug!(index = range.index, verified, total_ranges, "range written");
            self.events.emit(TransferEvent::DownloadProgress {
                bytes_done,
                total_bytes: total,
                ranges_verified: verified,
                ranges_total: total_ranges,
                bytes_per_second: speed.bytes_per_second(),
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined
                && failure.is_none()
            {
                failure = Some(VaultError::Protocol(format!("download worker failed: {e}")));
            }
        }

        if let Some(err) = failure {
            let verified_ranges = statuses
                .iter()
                .filter(|s| **s == RangeStatus::Verified)
                .count();
            debug!(verified_ranges, total_ranges, "download stopped early");
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }
        let root = slots.root()?;
        Ok((sink, root))
    }
}

async fn finish_sink<S>(mut sink: S) -> Result<S, VaultError>
where
    S: RangeSink + 'static,
{
    let (sink, result) = tokio::task::spawn_blocking(move || {
        let result = sink.finish();
        (sink, result)
    })
    .await
    .map_err(|e| VaultError::Io(std::io::Error::other(format!("task join error: {e}"))))?;
    result?;
    Ok(sink)
}

/// One member of the download pool.
struct RangeWorker {
    transport: Arc<dyn Transport>,
    config: TransferConfig,
    vault: String,
    job_id: String,
    queue: Arc<WorkQueue>,
    tx: mpsc::Sender<RangeReport>,
    cancel: CancellationToken,
}

impl RangeWorker {
    async fn run(self) {
        while !self.cancel.is_cancelled() {
            let Some(range) = self.next_range() else {
                break;
            };
            let (report, failed) = match self.fetch_one(range).await {
                Ok((data, tree_hash)) => (
                    RangeReport::Fetched {
                        range,
                        data,
                        tree_hash,
                    },
                    false,
                ),
                Err(error) => (RangeReport::Failed { range, error }, true),
            };
            if self.tx.send(report).await.is_err() || failed {
                break;
            }
        }
    }

    fn next_range(&self) -> Option<PartPlan> {
        self.queue.pop()
    }

    async fn fetch_one(&self, range: PartPlan) -> Result<(Vec<u8>, TreeHash), VaultError> {
        let transport = &*self.transport;
        let vault = self.vault.as_str();
        let job_id = self.job_id.as_str();

        let body: RangeBody = call_with_retry(
            &self.config.retry,
            self.config.call_timeout,
            &self.cancel,
            "fetch_range",
            move || async move {
                let body = transport
                    .fetch_range(vault, job_id, range.offset, range.len)
                    .await?;
                if body.data.len() as u64 != range.len {
                    return Err(TransportError::Unavailable(format!(
                        "short read: got {} of {} bytes",
                        body.data.len(),
                        range.len
                    )));
                }
                Ok(body)
            },
        )
        .await
        .map_err(|e| {
            e.into_vault_error(|e, attempts| VaultError::Download {
                offset: range.offset,
                length: range.len,
                reason: format!("{e} (after {attempts} attempts)"),
            })
        })?;

        let reported = body.tree_hash;
        let (data, actual) = tokio::task::spawn_blocking(move || {
            let digest = tree_hash(&body.data);
            (body.data, digest)
        })
        .await
        .map_err(|e| VaultError::Download {
            offset: range.offset,
            length: range.len,
            reason: format!("task join error: {e}"),
        })?;

        if let Some(expected) = reported
            && expected != actual
        {
            return Err(VaultError::Integrity { expected, actual });
        }
        Ok((data, actual))
    }
}
