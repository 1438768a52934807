//! Command execution: wires the local store, the vault client and Ctrl-C
//! handling together.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use coldvault_engine::{Transport, TransferEvent, VaultClient, VaultError};
use coldvault_local::{LocalVault, LocalVaultConfig};
use coldvault_protocol::VaultRef;
use coldvault_transfer::{combine, plan_file, required_part_size};
use tokio::sync::mpsc;

use crate::Command;
use crate::config::Config;

/// Runs one command to completion.
pub async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    match command {
        Command::Upload {
            vault,
            file,
            description,
        } => upload(&config, &vault, &file, &description.join(" ")).await,
        Command::Download {
            vault,
            archive_id,
            output,
        } => download(&config, &vault, &archive_id, &output).await,
        Command::Hash { file } => hash(&config, file).await,
        Command::CreateVault { vault } => {
            open_store(&config, &vault)?
                .create_vault(&vault.name)
                .with_context(|| format!("failed to create vault {vault}"))?;
            println!("{vault}");
            Ok(())
        }
    }
}

fn open_store(config: &Config, vault: &VaultRef) -> anyhow::Result<LocalVault> {
    LocalVault::open(LocalVaultConfig {
        root: config.store_root.clone(),
        region: vault.region.clone(),
        job_ready_after: Duration::from_secs(config.job_ready_after_secs),
    })
    .with_context(|| format!("failed to open store at {}", config.store_root.display()))
}

fn client(config: &Config, vault: &VaultRef) -> anyhow::Result<VaultClient> {
    let store = open_store(config, vault)?;
    let transport: Arc<dyn Transport> = Arc::new(store);
    let mut client = VaultClient::new(transport, config.transfer_config()?)
        .context("invalid transfer configuration")?;
    if let Some(events) = client.take_events() {
        tokio::spawn(log_events(events));
    }
    Ok(client)
}

async fn upload(
    config: &Config,
    vault: &VaultRef,
    file: &Path,
    description: &str,
) -> anyhow::Result<()> {
    let client = client(config, vault)?;
    let record = until_interrupted(&client, client.upload_file(file, description, vault))
        .await
        .with_context(|| format!("failed to upload {}", file.display()))?;
    println!("{}", record.to_csv_line());
    Ok(())
}

async fn download(
    config: &Config,
    vault: &VaultRef,
    archive_id: &str,
    output: &Path,
) -> anyhow::Result<()> {
    let client = client(config, vault)?;
    let result = until_interrupted(&client, async {
        let mut job = client.submit_retrieval(archive_id, vault).await?;
        println!("{}", job.job_id());
        let completed = client.wait_for_job(&mut job).await?;
        client.download_job(&completed, output).await
    })
    .await;
    let bytes = result.with_context(|| format!("failed to retrieve archive {archive_id}"))?;
    tracing::info!(archive_id, output = %output.display(), bytes, "archive written");
    Ok(())
}

async fn hash(config: &Config, file: PathBuf) -> anyhow::Result<()> {
    let part_size = config.transfer_config()?.part_size;
    let parts = tokio::task::spawn_blocking({
        let file = file.clone();
        move || {
            let size = std::fs::metadata(&file)?.len();
            plan_file(&file, required_part_size(size, part_size)?)
        }
    })
    .await
    .context("hashing task panicked")?
    .with_context(|| format!("failed to hash {}", file.display()))?;

    let digests: Vec<_> = parts.iter().map(|p| p.tree_hash).collect();
    let size = parts.last().map_or(0, |p| p.offset + p.len);
    tracing::debug!(parts = parts.len(), size, "file hashed");
    println!("{}  {}", combine(&digests), file.display());
    Ok(())
}

/// Drives `op`; Ctrl-C cancels it and waits for it to wind down.
async fn until_interrupted<T>(
    client: &VaultClient,
    op: impl Future<Output = Result<T, VaultError>>,
) -> Result<T, VaultError> {
    let cancel = client.cancel_token();
    tokio::pin!(op);
    tokio::select! {
        result = &mut op => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, cancelling");
            cancel.cancel();
            op.await
        }
    }
}

async fn log_events(mut events: mpsc::Receiver<TransferEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::UploadStarted {
                upload_id,
                parts,
                part_size,
                total_bytes,
            } => tracing::info!(%upload_id, parts, part_size, total_bytes, "uploading"),
            TransferEvent::UploadProgress {
                bytes_done,
                total_bytes,
                parts_committed,
                parts_total,
                bytes_per_second,
            } => tracing::info!(
                bytes_done,
                total_bytes,
                parts = format_args!("{parts_committed}/{parts_total}"),
                mib_per_second = format_args!("{:.1}", bytes_per_second / (1024.0 * 1024.0)),
                "upload progress"
            ),
            TransferEvent::UploadCompleted { archive_id } => {
                tracing::debug!(%archive_id, "upload completed")
            }
            TransferEvent::JobSubmitted { job_id } => {
                tracing::info!(%job_id, "retrieval job submitted, waiting for it to complete")
            }
            TransferEvent::JobStatus { job_id, status } => {
                tracing::info!(%job_id, %status, "retrieval job status")
            }
            TransferEvent::DownloadProgress {
                bytes_done,
                total_bytes,
                ranges_verified,
                ranges_total,
                bytes_per_second,
            } => tracing::info!(
                bytes_done,
                total_bytes,
                ranges = format_args!("{ranges_verified}/{ranges_total}"),
                mib_per_second = format_args!("{:.1}", bytes_per_second / (1024.0 * 1024.0)),
                "download progress"
            ),
            TransferEvent::DownloadCompleted { bytes } => {
                tracing::debug!(bytes, "download completed")
            }
            TransferEvent::Failed { error } => tracing::debug!(%error, "operation failed"),
        }
    }
}
