//! Shared data model for coldvault: digests, vault references, archives
//! and retrieval-job snapshots.

pub mod digest;
pub mod types;

pub use digest::{DIGEST_LEN, DigestParseError, TreeHash};
pub use types::{
    Archive, ArchiveRecord, DEFAULT_REGION, JobSnapshot, JobStatus, PartStatus, RangeBody,
    RangeStatus, VaultRef, VaultRefError,
};
