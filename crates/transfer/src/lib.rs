//! Tree hashing, part planning and offset-addressed file I/O.
//!
//! Everything here is synchronous; the engine crate moves blocking reads
//! and writes onto tokio's blocking pool.

mod chunked;
mod plan;
mod progress;
pub mod treehash;
mod validation;

pub use chunked::{Chunk, ChunkReader, RangeSink, RangeWriter, read_part};
pub use plan::{Part, PartPlan, part_count, plan, plan_file, plan_ranges, required_part_size};
pub use progress::ThroughputMeter;
pub use treehash::{
    DigestSlots, TreeHasher, combine, compute_digest, hash_block, tree_hash, verify,
};
pub use validation::{validate_concurrency, validate_part_size};

use coldvault_protocol::TreeHash;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Leaf block size of the tree hash: 1 MiB.
pub const TREE_HASH_BLOCK_SIZE: usize = MIB as usize;

/// Default upload part size: 32 MiB.
pub const DEFAULT_PART_SIZE: u64 = 32 * MIB;

/// Default download range size: 4 MiB.
pub const DEFAULT_RANGE_SIZE: u64 = 4 * MIB;

/// Smallest part the service accepts: 1 MiB.
pub const MIN_PART_SIZE: u64 = MIB;

/// Largest part the service accepts: 4 GiB.
pub const MAX_PART_SIZE: u64 = 4096 * MIB;

/// Maximum number of parts in one multipart upload.
pub const MAX_PARTS: u64 = 10_000;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("tree hash mismatch: expected {expected}, got {actual}")]
    Integrity {
        expected: TreeHash,
        actual: TreeHash,
    },

    #[error("digest slot {index} out of range ({len} slots)")]
    SlotOutOfRange { index: usize, len: usize },

    #[error("digest slot {0} written twice")]
    SlotOccupied(usize),

    #[error("digest slot {0} never written")]
    SlotMissing(usize),
}
