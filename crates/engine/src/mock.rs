//! Scripted in-memory transport for engine tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use coldvault_protocol::{Archive, JobSnapshot, JobStatus, RangeBody, TreeHash};
use coldvault_transfer::tree_hash;

use crate::transport::{Transport, TransportError, TransportFuture};

struct Session {
    vault: String,
    description: String,
    parts: BTreeMap<u64, Vec<u8>>,
}

struct StoredArchive {
    vault: String,
    data: Vec<u8>,
}

struct MockJob {
    archive_id: String,
    script: VecDeque<JobStatus>,
    current: JobStatus,
}

#[derive(Default)]
struct MockState {
    vaults: HashSet<String>,
    sessions: HashMap<String, Session>,
    archives: HashMap<String, StoredArchive>,
    jobs: HashMap<String, MockJob>,
    job_script: Vec<JobStatus>,
    part_failures: HashMap<u64, u32>,
    fetch_failures: HashMap<u64, u32>,
    query_failures: u32,
    archive_digest_override: Option<TreeHash>,
    corrupt_range_digests: bool,
    calls: Vec<&'static str>,
    aborted: Vec<String>,
    next_id: u32,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn check_vault(&self, vault: &str) -> Result<(), TransportError> {
        if self.vaults.contains(vault) {
            Ok(())
        } else {
            Err(TransportError::NotFound(format!("vault {vault}")))
        }
    }
}

/// Consumes one injected failure, if any remain. `u32::MAX` never runs out.
fn take_failure(remaining: Option<&mut u32>) -> bool {
    match remaining {
        Some(n) if *n > 0 => {
            if *n != u32::MAX {
                *n -= 1;
            }
            true
        }
        _ => false,
    }
}

/// In-memory vault service with failure injection and a call log.
pub(crate) struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// A service with a single vault named `vault`. Retrieval jobs succeed
    /// on their first status query.
    pub(crate) fn new() -> Self {
        let mut state = MockState {
            job_script: vec![JobStatus::Succeeded],
            ..Default::default()
        };
        state.vaults.insert("vault".into());
        Self {
            state: Mutex::new(state),
        }
    }

    /// Stores an archive directly and returns its id.
    pub(crate) fn put_archive(&self, vault: &str, data: Vec<u8>) -> String {
        let mut s = self.state.lock().unwrap();
        let id = s.next_id("archive");
        s.archives.insert(
            id.clone(),
            StoredArchive {
                vault: vault.into(),
                data,
            },
        );
        id
    }

    /// Creates an already-succeeded job for `archive_id`.
    pub(crate) fn start_job(&self, _vault: &str, archive_id: &str) -> String {
        let mut s = self.state.lock().unwrap();
        let id = s.next_id("job");
        s.jobs.insert(
            id.clone(),
            MockJob {
                archive_id: archive_id.into(),
                script: VecDeque::new(),
                current: JobStatus::Succeeded,
            },
        );
        id
    }

    /// Statuses returned by successive queries of newly submitted jobs.
    /// The last one repeats.
    pub(crate) fn script_jobs(&self, statuses: Vec<JobStatus>) {
        self.state.lock().unwrap().job_script = statuses;
    }

    /// Fails the next `times` uploads of the part at `offset`.
    pub(crate) fn fail_part_at(&self, offset: u64, times: u32) {
        self.state.lock().unwrap().part_failures.insert(offset, times);
    }

    /// Fails the next `times` fetches of the range at `offset`.
    pub(crate) fn fail_fetch_at(&self, offset: u64, times: u32) {
        self.state.lock().unwrap().fetch_failures.insert(offset, times);
    }

    /// Fails the next `times` job status queries.
    pub(crate) fn fail_queries(&self, times: u32) {
        self.state.lock().unwrap().query_failures = times;
    }

    /// Makes `complete_upload` report `digest` instead of the real one.
    pub(crate) fn report_archive_digest(&self, digest: TreeHash) {
        self.state.lock().unwrap().archive_digest_override = Some(digest);
    }

    /// Makes `fetch_range` report a wrong range digest.
    pub(crate) fn corrupt_range_digests(&self) {
        self.state.lock().unwrap().corrupt_range_digests = true;
    }

    pub(crate) fn archive_data(&self, archive_id: &str) -> Option<Vec<u8>> {
        let s = self.state.lock().unwrap();
        s.archives.get(archive_id).map(|a| a.data.clone())
    }

    pub(crate) fn archive_count(&self) -> usize {
        self.state.lock().unwrap().archives.len()
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub(crate) fn aborted(&self) -> Vec<String> {
        self.state.lock().unwrap().aborted.clone()
    }

    /// Names of every call made, in order.
    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }

    fn count(&self, call: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| **c == call)
            .count()
    }

    pub(crate) fn part_uploads(&self) -> usize {
        self.count("upload_part")
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.count("fetch_range")
    }

    pub(crate) fn query_count(&self) -> usize {
        self.count("query_job")
    }
}

impl Transport for MockTransport {
    fn vault_exists<'a>(&'a self, vault: &'a str) -> TransportFuture<'a, bool> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.calls.push("vault_exists");
            Ok(s.vaults.contains(vault))
        })
    }

    fn initiate_upload<'a>(
        &'a self,
        vault: &'a str,
        description: &'a str,
        _part_size: u64,
    ) -> TransportFuture<'a, String> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.calls.push("initiate_upload");
            s.check_vault(vault)?;
            let id = s.next_id("upload");
            s.sessions.insert(
                id.clone(),
                Session {
                    vault: vault.into(),
                    description: description.into(),
                    parts: BTreeMap::new(),
                },
            );
            Ok(id)
        })
    }

    fn upload_part<'a>(
        &'a self,
        _vault: &'a str,
        upload_id: &'a str,
        offset: u64,
        data: &'a [u8],
        digest: TreeHash,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut guard = self.state.lock().unwrap();
            let s = &mut *guard;
            s.calls.push("upload_part");
            if take_failure(s.part_failures.get_mut(&offset)) {
                return Err(TransportError::Unavailable(format!(
                    "injected failure at {offset}"
                )));
            }
            let actual = tree_hash(data);
            if actual != digest {
                return Err(TransportError::Integrity {
                    expected: digest,
                    actual,
                });
            }
            let session = s
                .sessions
                .get_mut(upload_id)
                .ok_or_else(|| TransportError::NotFound(format!("upload {upload_id}")))?;
            session.parts.insert(offset, data.to_vec());
            Ok(())
        })
    }

    fn complete_upload<'a>(
        &'a self,
        vault: &'a str,
        upload_id: &'a str,
        total_size: u64,
        digest: TreeHash,
    ) -> TransportFuture<'a, Archive> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.calls.push("complete_upload");
            s.check_vault(vault)?;
            let session = s
                .sessions
                .remove(upload_id)
                .ok_or_else(|| TransportError::NotFound(format!("upload {upload_id}")))?;
            let data: Vec<u8> = session.parts.into_values().flatten().collect();
            if data.len() as u64 != total_size {
                return Err(TransportError::Rejected(format!(
                    "expected {total_size} bytes, have {}",
                    data.len()
                )));
            }
            let actual = tree_hash(&data);
            if actual != digest {
                return Err(TransportError::Integrity {
                    expected: digest,
                    actual,
                });
            }
            let id = s.next_id("archive");
            s.archives.insert(
                id.clone(),
                StoredArchive {
                    vault: session.vault,
                    data,
                },
            );
            Ok(Archive {
                archive_id: id,
                size: total_size,
                tree_hash: s.archive_digest_override.unwrap_or(actual),
                description: session.description,
            })
        })
    }

    fn abort_upload<'a>(&'a self, _vault: &'a str, upload_id: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.calls.push("abort_upload");
            s.sessions.remove(upload_id);
            s.aborted.push(upload_id.to_string());
            Ok(())
        })
    }

    fn submit_retrieval<'a>(
        &'a self,
        vault: &'a str,
        archive_id: &'a str,
        _description: &'a str,
    ) -> TransportFuture<'a, String> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.calls.push("submit_retrieval");
            s.check_vault(vault)?;
            if !s.archives.get(archive_id).is_some_and(|a| a.vault == vault) {
                return Err(TransportError::NotFound(format!("archive {archive_id}")));
            }
            let id = s.next_id("job");
            let script: VecDeque<JobStatus> = s.job_script.iter().copied().collect();
            s.jobs.insert(
                id.clone(),
                MockJob {
                    archive_id: archive_id.into(),
                    script,
                    current: JobStatus::Submitted,
                },
            );
            Ok(id)
        })
    }

    fn query_job<'a>(
        &'a self,
        _vault: &'a str,
        job_id: &'a str,
    ) -> TransportFuture<'a, JobSnapshot> {
        Box::pin(async move {
            let mut guard = self.state.lock().unwrap();
            let s = &mut *guard;
            s.calls.push("query_job");
            if take_failure(Some(&mut s.query_failures)) {
                return Err(TransportError::Unavailable("injected query failure".into()));
            }
            let job = s
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| TransportError::NotFound(format!("job {job_id}")))?;
            if let Some(next) = job.script.pop_front() {
                job.current = next;
            }
            let archive = s.archives.get(&job.archive_id);
            let succeeded = job.current == JobStatus::Succeeded;
            Ok(JobSnapshot {
                job_id: job_id.to_string(),
                archive_id: job.archive_id.clone(),
                status: job.current,
                status_message: (job.current == JobStatus::Failed)
                    .then(|| "retrieval failed".to_string()),
                archive_size: archive
                    .filter(|_| succeeded)
                    .map(|a| a.data.len() as u64),
                tree_hash: archive.filter(|_| succeeded).map(|a| tree_hash(&a.data)),
            })
        })
    }

    fn fetch_range<'a>(
        &'a self,
        _vault: &'a str,
        job_id: &'a str,
        offset: u64,
        length: u64,
    ) -> TransportFuture<'a, RangeBody> {
        Box::pin(async move {
            let mut guard = self.state.lock().unwrap();
            let s = &mut *guard;
            s.calls.push("fetch_range");
            if take_failure(s.fetch_failures.get_mut(&offset)) {
                return Err(TransportError::Unavailable(format!(
                    "injected failure at {offset}"
                )));
            }
            let job = s
                .jobs
                .get(job_id)
                .ok_or_else(|| TransportError::NotFound(format!("job {job_id}")))?;
            if job.current != JobStatus::Succeeded {
                return Err(TransportError::Rejected(format!("job {job_id} not ready")));
            }
            let archive = s
                .archives
                .get(&job.archive_id)
                .ok_or_else(|| TransportError::NotFound(format!("archive {}", job.archive_id)))?;
            let start = offset.min(archive.data.len() as u64) as usize;
            let end = (offset + length).min(archive.data.len() as u64) as usize;
            let data = archive.data[start..end].to_vec();
            let digest = if s.corrupt_range_digests {
                TreeHash::from_bytes([0xee; 32])
            } else {
                tree_hash(&data)
            };
            Ok(RangeBody {
                data,
                tree_hash: Some(digest),
            })
        })
    }
}
