//! Vault client: the entry points used by the command layer.
//!
//! Wraps one [`Transport`] with a transfer configuration, an event channel
//! and a cancellation token shared by every operation it runs.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use coldvault_protocol::{ArchiveRecord, VaultRef};
use coldvault_transfer::RangeWriter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::TransferConfig;
use crate::download::ConcurrentDownloader;
use crate::error::VaultError;
use crate::retrieval::{CompletedJob, RetrievalJob};
use crate::retry::call_with_retry;
use crate::transport::Transport;
use crate::types::{Events, TransferEvent};
use crate::upload::ConcurrentUploader;

/// Job description used by [`VaultClient::download_archive`].
pub const RETRIEVAL_DESCRIPTION: &str = "Retrieving archive";

/// Runs uploads and downloads against one storage service.
pub struct VaultClient {
    transport: Arc<dyn Transport>,
    config: TransferConfig,
    events_tx: mpsc::Sender<TransferEvent>,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
    cancel: CancellationToken,
}

impl VaultClient {
    /// Creates a client. Fails if `config` is unusable.
    pub fn new(transport: Arc<dyn Transport>, config: TransferConfig) -> Result<Self, VaultError> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::channel(256);
        Ok(Self {
            transport,
            config,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        })
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    /// Returns the token that cancels every operation of this client.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn events(&self) -> Events {
        Events::new(self.events_tx.clone())
    }

    /// Uploads `path` into `vault` and returns the receipt.
    ///
    /// An empty `description` is replaced by the file name.
    pub async fn upload_file(
        &self,
        path: &Path,
        description: &str,
        vault: &VaultRef,
    ) -> Result<ArchiveRecord, VaultError> {
        let result = self.upload_inner(path, description, vault).await;
        self.report("upload", result)
    }

    async fn upload_inner(
        &self,
        path: &Path,
        description: &str,
        vault: &VaultRef,
    ) -> Result<ArchiveRecord, VaultError> {
        let description = if description.trim().is_empty() {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        } else {
            description.to_string()
        };

        self.ensure_vault(&vault.name).await?;
        let archive = ConcurrentUploader::new(
            Arc::clone(&self.transport),
            self.config.clone(),
            self.cancel.clone(),
        )
        .with_events(self.events())
        .upload(&vault.name, path, &description)
        .await?;

        Ok(ArchiveRecord {
            date: Utc::now().date_naive(),
            region: vault.region.clone(),
            vault: vault.name.clone(),
            archive_id: archive.archive_id,
            path: path.display().to_string(),
            description,
            size: archive.size,
            tree_hash: archive.tree_hash,
        })
    }

    /// Submits a retrieval job for `archive_id`.
    pub async fn submit_retrieval(
        &self,
        archive_id: &str,
        vault: &VaultRef,
    ) -> Result<RetrievalJob, VaultError> {
        let result = async {
            self.ensure_vault(&vault.name).await?;
            RetrievalJob::submit(
                self.transport.as_ref(),
                &self.config,
                &self.cancel,
                &vault.name,
                archive_id,
                RETRIEVAL_DESCRIPTION,
            )
            .await
        }
        .await;
        let job = self.report("submit retrieval", result)?;
        self.events().emit(TransferEvent::JobSubmitted {
            job_id: job.job_id().to_string(),
        });
        Ok(job)
    }

    /// Polls `job` until it is terminal.
    pub async fn wait_for_job(&self, job: &mut RetrievalJob) -> Result<CompletedJob, VaultError> {
        let result = job
            .wait_with_events(
                self.transport.as_ref(),
                &self.config,
                &self.cancel,
                &self.events(),
            )
            .await;
        self.report("retrieval", result)
    }

    /// Downloads a succeeded job into `output` and verifies it.
    /// Returns the number of bytes written.
    pub async fn download_job(&self, job: &CompletedJob, output: &Path) -> Result<u64, VaultError> {
        let result = async {
            let writer = tokio::task::spawn_blocking({
                let output = output.to_path_buf();
                let size = job.size();
                move || RangeWriter::create(&output, size)
            })
            .await
            .map_err(|e| VaultError::Io(std::io::Error::other(format!("task join error: {e}"))))??;

            ConcurrentDownloader::new(
                Arc::clone(&self.transport),
                self.config.clone(),
                self.cancel.clone(),
            )
            .with_events(self.events())
            .download(job, writer)
            .await
            .map(|w| w.bytes_written())
        }
        .await;
        self.report("download", result)
    }

    /// Retrieves `archive_id` from `vault` into `output`: submits a job,
    /// waits for it, downloads the result and verifies its tree hash.
    pub async fn download_archive(
        &self,
        archive_id: &str,
        vault: &VaultRef,
        output: &Path,
    ) -> Result<(), VaultError> {
        let mut job = self.submit_retrieval(archive_id, vault).await?;
        let completed = self.wait_for_job(&mut job).await?;
        let bytes = self.download_job(&completed, output).await?;
        info!(
            archive_id,
            vault = %vault,
            output = %output.display(),
            bytes,
            "archive retrieved"
        );
        Ok(())
    }

    async fn ensure_vault(&self, name: &str) -> Result<(), VaultError> {
        let exists = call_with_retry(
            &self.config.retry,
            self.config.call_timeout,
            &self.cancel,
            "vault_exists",
            || self.transport.vault_exists(name),
        )
        .await
        .map_err(|e| e.into_vault_error(|e, _| VaultError::Transport(e)))?;
        if exists {
            Ok(())
        } else {
            Err(VaultError::NotFound(format!("vault {name}")))
        }
    }

    fn report<T>(&self, operation: &str, result: Result<T, VaultError>) -> Result<T, VaultError> {
        if let Err(e) = &result {
            error!(operation, error = %e, "operation failed");
            self.events().emit(TransferEvent::Failed {
                error: e.to_string(),
            });
        }
        result
    }
}
