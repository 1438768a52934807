//! Filesystem-backed vault service.
//!
//! [`LocalVault`] implements the engine's [`Transport`] on a local
//! directory tree, with the service-side rules of a cold-archive store:
//! parts are verified on receipt, archives are reassembled and re-hashed
//! on completion, and retrieval jobs only become downloadable after a
//! configurable delay.

mod layout;
mod records;

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use coldvault_engine::{Transport, TransportError, TransportFuture};
use coldvault_protocol::{Archive, JobSnapshot, JobStatus, RangeBody, TreeHash};
use coldvault_transfer::{MIB, TreeHasher, tree_hash, validate_part_size};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use layout::validate_name;

use layout::{VaultPaths, parse_part_file_name, part_file_name};
use records::{ArchiveMeta, JobRecord, SessionRecord, read_json, temp_path, write_json};

/// Errors raised inside the local service before they are mapped onto
/// [`TransportError`].
#[derive(Debug, thiserror::Error)]
pub enum LocalError {
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("tree hash mismatch: expected {expected}, computed {actual}")]
    Integrity { expected: TreeHash, actual: TreeHash },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<LocalError> for TransportError {
    fn from(err: LocalError) -> Self {
        match err {
            LocalError::InvalidName(msg) | LocalError::Rejected(msg) => Self::Rejected(msg),
            LocalError::NotFound(what) => Self::NotFound(what),
            LocalError::Integrity { expected, actual } => Self::Integrity { expected, actual },
            LocalError::Io(e) => Self::Unavailable(e.to_string()),
            LocalError::Json(e) => Self::Unavailable(format!("corrupt metadata: {e}")),
        }
    }
}

/// Configuration of a [`LocalVault`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVaultConfig {
    /// Directory holding one subdirectory per region.
    pub root: PathBuf,
    pub region: String,
    /// Time from job submission until its output can be downloaded.
    pub job_ready_after: Duration,
}

struct Inner {
    region_dir: PathBuf,
    job_ready_after: Duration,
}

/// A vault service for one region, stored under a local directory.
#[derive(Clone)]
pub struct LocalVault {
    inner: Arc<Inner>,
}

impl LocalVault {
    /// Opens the region directory, creating it if needed.
    pub fn open(config: LocalVaultConfig) -> Result<Self, LocalError> {
        validate_name("region", &config.region)?;
        let region_dir = config.root.join(&config.region);
        fs::create_dir_all(&region_dir)?;
        debug!(dir = %region_dir.display(), "local vault service opened");
        Ok(Self {
            inner: Arc::new(Inner {
                region_dir,
                job_ready_after: config.job_ready_after,
            }),
        })
    }

    /// Creates `vault` if it does not exist yet.
    pub fn create_vault(&self, vault: &str) -> Result<(), LocalError> {
        let paths = VaultPaths::new(&self.inner.region_dir, vault)?;
        for dir in [paths.archives(), paths.uploads(), paths.jobs()] {
            fs::create_dir_all(dir)?;
        }
        info!(vault, "vault created");
        Ok(())
    }

    /// Directory of this service's region.
    pub fn region_dir(&self) -> &Path {
        &self.inner.region_dir
    }

    /// Runs `f` on the blocking pool.
    fn blocking<'a, T, F>(&'a self, f: F) -> TransportFuture<'a, T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, LocalError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || f(&inner))
                .await
                .map_err(|e| TransportError::Unavailable(format!("task join error: {e}")))?
                .map_err(TransportError::from)
        })
    }
}

impl Inner {
    /// Paths of an existing vault.
    fn vault(&self, vault: &str) -> Result<VaultPaths, LocalError> {
        let paths = VaultPaths::new(&self.region_dir, vault)?;
        if !paths.dir().is_dir() {
            return Err(LocalError::NotFound(format!("vault {vault}")));
        }
        Ok(paths)
    }

    fn vault_exists(&self, vault: &str) -> Result<bool, LocalError> {
        let paths = VaultPaths::new(&self.region_dir, vault)?;
        Ok(paths.dir().is_dir())
    }

    fn initiate_upload(
        &self,
        vault: &str,
        description: &str,
        part_size: u64,
    ) -> Result<String, LocalError> {
        let paths = self.vault(vault)?;
        validate_part_size(part_size).map_err(|e| LocalError::Rejected(e.to_string()))?;

        let upload_id = Uuid::new_v4().simple().to_string();
        let dir = paths.upload_dir(&upload_id)?;
        fs::create_dir_all(&dir)?;
        write_json(
            &dir.join("session.json"),
            &SessionRecord {
                upload_id: upload_id.clone(),
                description: description.to_string(),
                part_size,
                created_at: Utc::now(),
            },
        )?;
        info!(vault, upload_id = %upload_id, part_size, "upload session created");
        Ok(upload_id)
    }

    fn session(
        &self,
        paths: &VaultPaths,
        upload_id: &str,
    ) -> Result<(PathBuf, SessionRecord), LocalError> {
        let dir = paths.upload_dir(upload_id)?;
        let session = read_json(&dir.join("session.json"), &format!("upload {upload_id}"))?;
        Ok((dir, session))
    }

    fn upload_part(
        &self,
        vault: &str,
        upload_id: &str,
        offset: u64,
        data: &[u8],
        digest: TreeHash,
    ) -> Result<(), LocalError> {
        let paths = self.vault(vault)?;
        let (dir, session) = self.session(&paths, upload_id)?;

        if offset % session.part_size != 0 {
            return Err(LocalError::Rejected(format!(
                "offset {offset} is not a multiple of the part size {}",
                session.part_size
            )));
        }
        let len = data.len() as u64;
        if len > session.part_size {
            return Err(LocalError::Rejected(format!(
                "part of {len} bytes exceeds the part size {}",
                session.part_size
            )));
        }
        if len == 0 && offset != 0 {
            return Err(LocalError::Rejected(format!("empty part at offset {offset}")));
        }

        let actual = tree_hash(data);
        if actual != digest {
            warn!(vault, upload_id, offset, "part tree hash mismatch");
            return Err(LocalError::Integrity {
                expected: digest,
                actual,
            });
        }

        records::write_atomic(&dir.join(part_file_name(offset)), data)?;
        debug!(vault, upload_id, offset, len, "part stored");
        Ok(())
    }

    /// Stored parts of a session, sorted by offset.
    fn parts(&self, dir: &Path) -> Result<Vec<(u64, PathBuf, u64)>, LocalError> {
        let mut parts = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(offset) = name.to_str().and_then(parse_part_file_name) {
                parts.push((offset, entry.path(), entry.metadata()?.len()));
            }
        }
        parts.sort_by_key(|(offset, _, _)| *offset);
        Ok(parts)
    }

    fn complete_upload(
        &self,
        vault: &str,
        upload_id: &str,
        total_size: u64,
        digest: TreeHash,
    ) -> Result<Archive, LocalError> {
        let paths = self.vault(vault)?;
        let (dir, session) = self.session(&paths, upload_id)?;
        let parts = self.parts(&dir)?;

        let mut expected_offset = 0u64;
        for (i, (offset, _, len)) in parts.iter().enumerate() {
            if *offset != expected_offset {
                return Err(LocalError::Rejected(format!(
                    "missing part at offset {expected_offset}"
                )));
            }
            let last = i + 1 == parts.len();
            if !last && *len != session.part_size {
                return Err(LocalError::Rejected(format!(
                    "part at offset {offset} has {len} bytes, expected {}",
                    session.part_size
                )));
            }
            expected_offset += len;
        }
        if expected_offset != total_size {
            return Err(LocalError::Rejected(format!(
                "parts hold {expected_offset} bytes, declared {total_size}"
            )));
        }

        let archive_id = Uuid::new_v4().simple().to_string();
        let data_path = paths.archive_data(&archive_id)?;
        let temp = temp_path(&data_path);
        let actual = match assemble(&parts, &temp) {
            Ok(actual) => actual,
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(e);
            }
        };
        if actual != digest {
            let _ = fs::remove_file(&temp);
            warn!(vault, upload_id, %digest, %actual, "archive tree hash mismatch");
            return Err(LocalError::Integrity {
                expected: digest,
                actual,
            });
        }
        fs::rename(&temp, &data_path)?;

        let meta = ArchiveMeta {
            archive_id: archive_id.clone(),
            size: total_size,
            tree_hash: actual,
            description: session.description,
            created_at: Utc::now(),
        };
        write_json(&paths.archive_meta(&archive_id)?, &meta)?;
        fs::remove_dir_all(&dir)?;

        info!(vault, archive_id = %archive_id, size = total_size, "archive created");
        Ok(Archive {
            archive_id,
            size: meta.size,
            tree_hash: meta.tree_hash,
            description: meta.description,
        })
    }

    fn abort_upload(&self, vault: &str, upload_id: &str) -> Result<(), LocalError> {
        let paths = self.vault(vault)?;
        let dir = paths.upload_dir(upload_id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(vault, upload_id, "upload session aborted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LocalError::NotFound(format!("upload {upload_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn archive_meta(
        &self,
        paths: &VaultPaths,
        archive_id: &str,
    ) -> Result<ArchiveMeta, LocalError> {
        read_json(
            &paths.archive_meta(archive_id)?,
            &format!("archive {archive_id}"),
        )
    }

    fn submit_retrieval(
        &self,
        vault: &str,
        archive_id: &str,
        description: &str,
    ) -> Result<String, LocalError> {
        let paths = self.vault(vault)?;
        self.archive_meta(&paths, archive_id)?;

        let job_id = Uuid::new_v4().simple().to_string();
        write_json(
            &paths.job(&job_id)?,
            &JobRecord {
                job_id: job_id.clone(),
                archive_id: archive_id.to_string(),
                description: description.to_string(),
                submitted_at: Utc::now(),
            },
        )?;
        info!(vault, archive_id, job_id = %job_id, "retrieval job submitted");
        Ok(job_id)
    }

    fn job(&self, paths: &VaultPaths, job_id: &str) -> Result<JobRecord, LocalError> {
        read_json(&paths.job(job_id)?, &format!("job {job_id}"))
    }

    fn is_ready(&self, job: &JobRecord) -> bool {
        let elapsed = (Utc::now() - job.submitted_at).to_std().unwrap_or_default();
        elapsed >= self.job_ready_after
    }

    fn query_job(&self, vault: &str, job_id: &str) -> Result<JobSnapshot, LocalError> {
        let paths = self.vault(vault)?;
        let job = self.job(&paths, job_id)?;

        let mut snapshot = JobSnapshot {
            job_id: job.job_id.clone(),
            archive_id: job.archive_id.clone(),
            status: JobStatus::InProgress,
            status_message: None,
            archive_size: None,
            tree_hash: None,
        };
        let archive = match self.archive_meta(&paths, &job.archive_id) {
            Ok(archive) => archive,
            Err(LocalError::NotFound(_)) => {
                snapshot.status = JobStatus::Failed;
                snapshot.status_message =
                    Some(format!("archive {} no longer exists", job.archive_id));
                return Ok(snapshot);
            }
            Err(e) => return Err(e),
        };
        if self.is_ready(&job) {
            snapshot.status = JobStatus::Succeeded;
            snapshot.status_message = Some("Succeeded".into());
            snapshot.archive_size = Some(archive.size);
            snapshot.tree_hash = Some(archive.tree_hash);
        }
        Ok(snapshot)
    }

    fn fetch_range(
        &self,
        vault: &str,
        job_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<RangeBody, LocalError> {
        let paths = self.vault(vault)?;
        let job = self.job(&paths, job_id)?;
        if !self.is_ready(&job) {
            return Err(LocalError::Rejected(format!("job {job_id} is still in progress")));
        }
        let archive = self.archive_meta(&paths, &job.archive_id)?;
        if offset > archive.size {
            return Err(LocalError::Rejected(format!(
                "offset {offset} beyond archive size {}",
                archive.size
            )));
        }

        let len = length.min(archive.size - offset);
        let mut file = fs::File::open(paths.archive_data(&job.archive_id)?)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data)?;

        let digest = (offset % MIB == 0).then(|| tree_hash(&data));
        Ok(RangeBody {
            data,
            tree_hash: digest,
        })
    }
}

/// Concatenates parts into `dest` and returns the tree hash of the result.
fn assemble(parts: &[(u64, PathBuf, u64)], dest: &Path) -> Result<TreeHash, LocalError> {
    use std::io::Write;

    let mut out = fs::File::create(dest)?;
    let mut hasher = TreeHasher::new();
    for (_, path, _) in parts {
        let data = fs::read(path)?;
        hasher.update(&data);
        out.write_all(&data)?;
    }
    out.sync_all()?;
    Ok(hasher.finish())
}

impl Transport for LocalVault {
    fn vault_exists<'a>(&'a self, vault: &'a str) -> TransportFuture<'a, bool> {
        let vault = vault.to_string();
        self.blocking(move |inner| inner.vault_exists(&vault))
    }

    fn initiate_upload<'a>(
        &'a self,
        vault: &'a str,
        description: &'a str,
        part_size: u64,
    ) -> TransportFuture<'a, String> {
        let (vault, description) = (vault.to_string(), description.to_string());
        self.blocking(move |inner| inner.initiate_upload(&vault, &description, part_size))
    }

    fn upload_part<'a>(
        &'a self,
        vault: &'a str,
        upload_id: &'a str,
        offset: u64,
        data: &'a [u8],
        tree_hash: TreeHash,
    ) -> TransportFuture<'a, ()> {
        let (vault, upload_id, data) = (vault.to_string(), upload_id.to_string(), data.to_vec());
        self.blocking(move |inner| inner.upload_part(&vault, &upload_id, offset, &data, tree_hash))
    }

    fn complete_upload<'a>(
        &'a self,
        vault: &'a str,
        upload_id: &'a str,
        total_size: u64,
        tree_hash: TreeHash,
    ) -> TransportFuture<'a, Archive> {
        let (vault, upload_id) = (vault.to_string(), upload_id.to_string());
        self.blocking(move |inner| inner.complete_upload(&vault, &upload_id, total_size, tree_hash))
    }

    fn abort_upload<'a>(&'a self, vault: &'a str, upload_id: &'a str) -> TransportFuture<'a, ()> {
        let (vault, upload_id) = (vault.to_string(), upload_id.to_string());
        self.blocking(move |inner| inner.abort_upload(&vault, &upload_id))
    }

    fn submit_retrieval<'a>(
        &'a self,
        vault: &'a str,
        archive_id: &'a str,
        description: &'a str,
    ) -> TransportFuture<'a, String> {
        let (vault, archive_id, description) = (
            vault.to_string(),
            archive_id.to_string(),
            description.to_string(),
        );
        self.blocking(move |inner| inner.submit_retrieval(&vault, &archive_id, &description))
    }

    fn query_job<'a>(
        &'a self,
        vault: &'a str,
        job_id: &'a str,
    ) -> TransportFuture<'a, JobSnapshot> {
        let (vault, job_id) = (vault.to_string(), job_id.to_string());
        self.blocking(move |inner| inner.query_job(&vault, &job_id))
    }

    fn fetch_range<'a>(
        &'a self,
        vault: &'a str,
        job_id: &'a str,
        offset: u64,
        length: u64,
    ) -> TransportFuture<'a, RangeBody> {
        let (vault, job_id) = (vault.to_string(), job_id.to_string());
        self.blocking(move |inner| inner.fetch_range(&vault, &job_id, offset, length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path, ready_after: Duration) -> LocalVault {
        let vault = LocalVault::open(LocalVaultConfig {
            root: dir.to_path_buf(),
            region: "eu-west-1".into(),
            job_ready_after: ready_after,
        })
        .unwrap();
        vault.create_vault("photos").unwrap();
        vault
    }

    #[tokio::test]
    async fn vault_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let service = open(dir.path(), Duration::ZERO);
        assert!(service.vault_exists("photos").await.unwrap());
        assert!(!service.vault_exists("music").await.unwrap());
        assert!(matches!(
            service.vault_exists("../photos").await.unwrap_err(),
            TransportError::Rejected(_)
        ));
        assert!(dir.path().join("eu-west-1/photos/archives").is_dir());
    }

    #[tokio::test]
    async fn part_with_wrong_digest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = open(dir.path(), Duration::ZERO);
        let upload_id = service.initiate_upload("photos", "d", MIB).await.unwrap();

        let err = service
            .upload_part("photos", &upload_id, 0, b"abc", tree_hash(b"abd"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Integrity { .. }));
    }

    #[tokio::test]
    async fn misaligned_or_oversized_parts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = open(dir.path(), Duration::ZERO);
        let upload_id = service.initiate_upload("photos", "d", MIB).await.unwrap();

        let err = service
            .upload_part("photos", &upload_id, 17, b"x", tree_hash(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));

        let big = vec![0u8; MIB as usize + 1];
        let err = service
            .upload_part("photos", &upload_id, 0, &big, tree_hash(&big))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
    }

    #[tokio::test]
    async fn invalid_part_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = open(dir.path(), Duration::ZERO);
        let err = service
            .initiate_upload("photos", "d", 3 * MIB)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
    }

    #[tokio::test]
    async fn complete_requires_contiguous_parts() {
        let dir = tempfile::tempdir().unwrap();
        let service = open(dir.path(), Duration::ZERO);
        let upload_id = service.initiate_upload("photos", "d", MIB).await.unwrap();
        let part = vec![1u8; MIB as usize];
        service
            .upload_part("photos", &upload_id, MIB, &part, tree_hash(&part))
            .await
            .unwrap();

        let err = service
            .complete_upload("photos", &upload_id, MIB, tree_hash(&part))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected(msg) if msg.contains("offset 0")));
    }

    #[tokio::test]
    async fn complete_rejects_wrong_root() {
        let dir = tempfile::tempdir().unwrap();
        let service = open(dir.path(), Duration::ZERO);
        let upload_id = service.initiate_upload("photos", "d", MIB).await.unwrap();
        service
            .upload_part("photos", &upload_id, 0, b"hello", tree_hash(b"hello"))
            .await
            .unwrap();

        let err = service
            .complete_upload("photos", &upload_id, 5, tree_hash(b"world"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Integrity { .. }));
        // Session survives a rejected completion.
        service.abort_upload("photos", &upload_id).await.unwrap();
    }

    #[tokio::test]
    async fn aborting_unknown_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let service = open(dir.path(), Duration::ZERO);
        let err = service.abort_upload("photos", "nope").await.unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
    }

    #[tokio::test]
    async fn job_is_in_progress_until_ready() {
        let dir = tempfile::tempdir().unwrap();
        let service = open(dir.path(), Duration::from_secs(3600));
        let upload_id = service.initiate_upload("photos", "d", MIB).await.unwrap();
        service
            .upload_part("photos", &upload_id, 0, b"hello", tree_hash(b"hello"))
            .await
            .unwrap();
        let archive = service
            .complete_upload("photos", &upload_id, 5, tree_hash(b"hello"))
            .await
            .unwrap();

        let job_id = service
            .submit_retrieval("photos", &archive.archive_id, "r")
            .await
            .unwrap();
        let snapshot = service.query_job("photos", &job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::InProgress);
        assert!(snapshot.tree_hash.is_none());

        let err = service.fetch_range("photos", &job_id, 0, 5).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
    }

    #[tokio::test]
    async fn ready_job_serves_ranges_with_digests() {
        let dir = tempfile::tempdir().unwrap();
        let service = open(dir.path(), Duration::ZERO);
        let data: Vec<u8> = (0..(2 * MIB as usize + 10)).map(|i| i as u8).collect();
        let upload_id = service.initiate_upload("photos", "d", 2 * MIB).await.unwrap();
        let (first, rest) = data.split_at(2 * MIB as usize);
        for (offset, part) in [(0, first), (2 * MIB, rest)] {
            service
                .upload_part("photos", &upload_id, offset, part, tree_hash(part))
                .await
                .unwrap();
        }
        let archive = service
            .complete_upload("photos", &upload_id, data.len() as u64, tree_hash(&data))
            .await
            .unwrap();
        assert_eq!(archive.description, "d");

        let job_id = service
            .submit_retrieval("photos", &archive.archive_id, "r")
            .await
            .unwrap();
        let snapshot = service.query_job("photos", &job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Succeeded);
        assert_eq!(snapshot.archive_size, Some(data.len() as u64));
        assert_eq!(snapshot.tree_hash, Some(tree_hash(&data)));

        let body = service.fetch_range("photos", &job_id, MIB, MIB).await.unwrap();
        assert_eq!(body.data, &data[MIB as usize..2 * MIB as usize]);
        assert_eq!(body.tree_hash, Some(tree_hash(&body.data)));

        let tail = service
            .fetch_range("photos", &job_id, 2 * MIB, MIB)
            .await
            .unwrap();
        assert_eq!(tail.data.len(), 10);

        let unaligned = service.fetch_range("photos", &job_id, 3, 4).await.unwrap();
        assert_eq!(unaligned.data, &data[3..7]);
        assert!(unaligned.tree_hash.is_none());
    }

    #[tokio::test]
    async fn unknown_archive_cannot_be_retrieved() {
        let dir = tempfile::tempdir().unwrap();
        let service = open(dir.path(), Duration::ZERO);
        let err = service
            .submit_retrieval("photos", "doesnotexist", "r")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
    }
}
