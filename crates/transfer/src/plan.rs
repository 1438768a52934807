//! Part and range planning.

use std::path::Path;

use coldvault_protocol::TreeHash;

use crate::chunked::ChunkReader;
use crate::{MAX_PART_SIZE, MAX_PARTS, TransferError, validate_part_size};

/// Byte range of one part (or download range), before it is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    /// Position in file order (0-indexed).
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

impl PartPlan {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// A planned part whose bytes have been read and hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
    pub tree_hash: TreeHash,
}

/// Number of parts `file_size` splits into. A zero-byte file still has one.
pub fn part_count(file_size: u64, part_size: u64) -> u64 {
    if file_size == 0 {
        1
    } else {
        file_size.div_ceil(part_size)
    }
}

fn split(total: u64, size: u64) -> Vec<PartPlan> {
    let count = part_count(total, size);
    (0..count)
        .map(|i| {
            let offset = i * size;
            PartPlan {
                index: i as usize,
                offset,
                len: size.min(total - offset),
            }
        })
        .collect()
}

/// Splits a file into upload parts.
///
/// Every part but the last is exactly `part_size`; the last holds the
/// remainder. Fails when `part_size` is invalid or the file would need more
/// than [`MAX_PARTS`] parts.
pub fn plan(file_size: u64, part_size: u64) -> Result<Vec<PartPlan>, TransferError> {
    validate_part_size(part_size)?;
    let count = part_count(file_size, part_size);
    if count > MAX_PARTS {
        return Err(TransferError::Config(format!(
            "{file_size} bytes at {part_size} bytes per part needs {count} parts (max {MAX_PARTS})"
        )));
    }
    Ok(split(file_size, part_size))
}

/// Splits a retrieved archive into download ranges. No count limit applies.
pub fn plan_ranges(total: u64, range_size: u64) -> Result<Vec<PartPlan>, TransferError> {
    validate_part_size(range_size)?;
    Ok(split(total, range_size))
}

/// Picks the part size to upload `file_size` bytes with.
///
/// Returns `preferred` when it fits within [`MAX_PARTS`], otherwise the
/// smallest larger power-of-two size that does.
pub fn required_part_size(file_size: u64, preferred: u64) -> Result<u64, TransferError> {
    validate_part_size(preferred)?;
    if file_size > MAX_PART_SIZE * MAX_PARTS {
        return Err(TransferError::Config(format!(
            "file of {file_size} bytes exceeds the maximum archive size of {} bytes",
            MAX_PART_SIZE * MAX_PARTS
        )));
    }
    let mut size = preferred;
    while part_count(file_size, size) > MAX_PARTS {
        size *= 2;
    }
    Ok(size)
}

/// Plans `path` and reads it sequentially, hashing every part.
pub fn plan_file(path: &Path, part_size: u64) -> Result<Vec<Part>, TransferError> {
    let mut reader = ChunkReader::new(path, part_size)?;
    let plans = plan(reader.file_size(), part_size)?;
    let mut parts = Vec::with_capacity(plans.len());
    for planned in plans {
        let chunk = reader
            .next_chunk()?
            .filter(|c| c.offset == planned.offset && c.data.len() as u64 == planned.len)
            .ok_or_else(|| {
                TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("file changed while reading part {}", planned.index),
                ))
            })?;
        parts.push(Part {
            index: planned.index,
            offset: planned.offset,
            len: planned.len,
            tree_hash: chunk.tree_hash,
        });
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MIB, combine, tree_hash};
    use std::io::Write;

    fn assert_covers(parts: &[PartPlan], total: u64, size: u64) {
        let mut expected_offset = 0;
        for (i, p) in parts.iter().enumerate() {
            assert_eq!(p.index, i);
            assert_eq!(p.offset, expected_offset, "parts must be contiguous");
            if i + 1 < parts.len() {
                assert_eq!(p.len, size);
            }
            expected_offset = p.end();
        }
        assert_eq!(expected_offset, total);
    }

    #[test]
    fn thirty_three_mib_in_sixteen_mib_parts() {
        let parts = plan(33 * MIB, 16 * MIB).unwrap();
        let lens: Vec<u64> = parts.iter().map(|p| p.len).collect();
        assert_eq!(lens, vec![16 * MIB, 16 * MIB, MIB]);
        assert_covers(&parts, 33 * MIB, 16 * MIB);
    }

    #[test]
    fn exact_multiple_has_no_trailing_empty_part() {
        let parts = plan(64 * MIB, 16 * MIB).unwrap();
        assert_eq!(parts.len(), 4);
        assert!(parts.iter().all(|p| p.len == 16 * MIB));
    }

    #[test]
    fn zero_byte_file_has_one_empty_part() {
        let parts = plan(0, MIB).unwrap();
        assert_eq!(
            parts,
            vec![PartPlan {
                index: 0,
                offset: 0,
                len: 0
            }]
        );
    }

    #[test]
    fn covers_various_sizes() {
        for total in [1, MIB - 1, MIB, MIB + 1, 7 * MIB + 3, 100 * MIB] {
            for size in [MIB, 2 * MIB, 8 * MIB] {
                assert_covers(&plan(total, size).unwrap(), total, size);
            }
        }
    }

    #[test]
    fn replanning_is_idempotent() {
        assert_eq!(
            plan(123 * MIB + 17, 4 * MIB).unwrap(),
            plan(123 * MIB + 17, 4 * MIB).unwrap()
        );
    }

    #[test]
    fn rejects_invalid_part_size() {
        assert!(matches!(
            plan(10 * MIB, 3 * MIB).unwrap_err(),
            TransferError::Config(_)
        ));
    }

    #[test]
    fn rejects_too_many_parts() {
        let err = plan(MAX_PARTS * MIB + 1, MIB).unwrap_err();
        assert!(matches!(err, TransferError::Config(_)));
        assert!(plan(MAX_PARTS * MIB, MIB).is_ok());
    }

    #[test]
    fn ranges_have_no_count_limit() {
        let ranges = plan_ranges(MAX_PARTS * MIB + 1, MIB).unwrap();
        assert_eq!(ranges.len() as u64, MAX_PARTS + 1);
    }

    #[test]
    fn required_part_size_keeps_preferred_when_it_fits() {
        assert_eq!(required_part_size(100 * MIB, 32 * MIB).unwrap(), 32 * MIB);
    }

    #[test]
    fn required_part_size_grows_for_large_files() {
        // 32 MiB * 10 000 = 312.5 GiB; one byte more needs 64 MiB parts.
        let size = required_part_size(32 * MIB * MAX_PARTS + 1, 32 * MIB).unwrap();
        assert_eq!(size, 64 * MIB);
        assert!(plan(32 * MIB * MAX_PARTS + 1, size).is_ok());
    }

    #[test]
    fn required_part_size_rejects_oversized_files() {
        assert!(required_part_size(MAX_PART_SIZE * MAX_PARTS + 1, MIB).is_err());
    }

    #[test]
    fn plan_file_hashes_each_part() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..33 * MIB as usize).map(|i| (i % 253) as u8).collect();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();

        let parts = plan_file(&path, 16 * MIB).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len, MIB);
        let leaf3 = tree_hash(&data[32 * MIB as usize..]);
        assert_eq!(parts[2].tree_hash, leaf3);

        // Third root is promoted unchanged at the top level.
        let digests: Vec<_> = parts.iter().map(|p| p.tree_hash).collect();
        let expected = combine(&[combine(&digests[..2]), leaf3]);
        assert_eq!(combine(&digests), expected);
        assert_eq!(combine(&digests), tree_hash(&data));
    }

    #[test]
    fn plan_file_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::File::create(&path).unwrap();

        let parts = plan_file(&path, MIB).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].len, 0);
        assert_eq!(parts[0].tree_hash, tree_hash(&[]));
    }
}
