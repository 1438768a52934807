//! SHA-256 tree hash.
//!
//! Data is split into 1 MiB blocks, each block is hashed, and adjacent
//! digests are hashed together pairwise, level by level, until one root
//! remains. A node without a sibling is carried up unchanged. Empty input
//! hashes to `SHA-256("")`.
//!
//! When parts are power-of-two multiples of the block size, combining the
//! per-part roots in order gives the same root as hashing the whole input.

use std::io::Read;

use coldvault_protocol::TreeHash;
use sha2::{Digest, Sha256};

use crate::{TREE_HASH_BLOCK_SIZE, TransferError};

/// SHA-256 of a single block.
pub fn hash_block(data: &[u8]) -> TreeHash {
    TreeHash::from_bytes(Sha256::digest(data).into())
}

fn hash_pair(left: &TreeHash, right: &TreeHash) -> TreeHash {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    TreeHash::from_bytes(hasher.finalize().into())
}

/// Folds digests pairwise, left to right, until a single root remains.
pub fn combine(digests: &[TreeHash]) -> TreeHash {
    if digests.is_empty() {
        return hash_block(&[]);
    }
    let mut level = digests.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                _ => pair[0],
            })
            .collect();
    }
    level[0]
}

/// Tree hash of an in-memory buffer using 1 MiB blocks.
pub fn tree_hash(data: &[u8]) -> TreeHash {
    if data.is_empty() {
        return hash_block(data);
    }
    let leaves: Vec<TreeHash> = data.chunks(TREE_HASH_BLOCK_SIZE).map(hash_block).collect();
    combine(&leaves)
}

/// Reads `source` to the end and returns its tree hash.
pub fn compute_digest(block_size: usize, mut source: impl Read) -> std::io::Result<TreeHash> {
    let mut hasher = TreeHasher::with_block_size(block_size);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

/// Returns an integrity error when `actual` differs from `expected`.
pub fn verify(expected: &TreeHash, actual: &TreeHash) -> Result<(), TransferError> {
    if expected != actual {
        return Err(TransferError::Integrity {
            expected: *expected,
            actual: *actual,
        });
    }
    Ok(())
}

/// Incremental tree hasher for streamed input.
pub struct TreeHasher {
    block_size: usize,
    block: Vec<u8>,
    leaves: Vec<TreeHash>,
    total: u64,
}

impl Default for TreeHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeHasher {
    /// Creates a hasher with 1 MiB leaf blocks.
    pub fn new() -> Self {
        Self::with_block_size(TREE_HASH_BLOCK_SIZE)
    }

    /// Creates a hasher with a custom leaf block size (0 selects 1 MiB).
    pub fn with_block_size(block_size: usize) -> Self {
        let block_size = if block_size == 0 {
            TREE_HASH_BLOCK_SIZE
        } else {
            block_size
        };
        Self {
            block_size,
            block: Vec::with_capacity(block_size.min(TREE_HASH_BLOCK_SIZE)),
            leaves: Vec::new(),
            total: 0,
        }
    }

    /// Feeds more bytes.
    pub fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;
        while !data.is_empty() {
            let take = (self.block_size - self.block.len()).min(data.len());
            self.block.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.block.len() == self.block_size {
                self.leaves.push(hash_block(&self.block));
                self.block.clear();
            }
        }
    }

    /// Total bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.total
    }

    /// Hashes the trailing partial block and folds all leaves.
    pub fn finish(mut self) -> TreeHash {
        if !self.block.is_empty() || self.leaves.is_empty() {
            self.leaves.push(hash_block(&self.block));
        }
        combine(&self.leaves)
    }
}

/// Order-indexed digest storage filled in any order, folded in index order.
///
/// Each slot accepts exactly one write.
#[derive(Debug, Clone)]
pub struct DigestSlots {
    slots: Vec<Option<TreeHash>>,
    filled: usize,
}

impl DigestSlots {
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![None; len],
            filled: 0,
        }
    }

    /// Stores the digest for `index`.
    pub fn insert(&mut self, index: usize, digest: TreeHash) -> Result<(), TransferError> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(TransferError::SlotOutOfRange { index, len })?;
        if slot.is_some() {
            return Err(TransferError::SlotOccupied(index));
        }
        *slot = Some(digest);
        self.filled += 1;
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<TreeHash> {
        self.slots.get(index).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    /// Folds all slots in index order. Fails if any slot is still empty.
    pub fn root(&self) -> Result<TreeHash, TransferError> {
        let digests = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| slot.ok_or(TransferError::SlotMissing(i)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(combine(&digests))
    }
}
