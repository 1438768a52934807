use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use coldvault_protocol::TreeHash;

use crate::treehash::tree_hash;
use crate::{DEFAULT_PART_SIZE, TransferError};

// ---------------------------------------------------------------------------
// Positional reads
// ---------------------------------------------------------------------------

/// Reads exactly `len` bytes of `path` starting at `offset`.
///
/// Opens its own handle so concurrent callers never share a file cursor.
pub fn read_part(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>, TransferError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// A part-sized slice of a file with its tree hash.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    /// Byte offset within the file.
    pub offset: u64,
    pub data: Vec<u8>,
    pub tree_hash: TreeHash,
}

/// Reads a file sequentially in fixed-size chunks, hashing each one.
///
/// An empty file yields a single empty chunk.
pub struct ChunkReader {
    file: File,
    chunk_size: u64,
    offset: u64,
    file_size: u64,
    next_index: usize,
}

impl ChunkReader {
    /// Opens `path` for chunked reading.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_PART_SIZE`] (32 MiB) is used.
    pub fn new(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let chunk_size = if chunk_size == 0 {
            DEFAULT_PART_SIZE
        } else {
            chunk_size
        };
        Ok(Self {
            file,
            chunk_size,
            offset: 0,
            file_size,
            next_index: 0,
        })
    }

    /// Reads the next chunk. Returns `None` at EOF.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let remaining = self.file_size - self.offset;
        if remaining == 0 && !(self.file_size == 0 && self.next_index == 0) {
            return Ok(None);
        }

        let read_size = remaining.min(self.chunk_size) as usize;
        let mut buf = vec![0u8; read_size];
        self.file.read_exact(&mut buf)?;

        let chunk = Chunk {
            index: self.next_index,
            offset: self.offset,
            tree_hash: tree_hash(&buf),
            data: buf,
        };
        self.offset += read_size as u64;
        self.next_index += 1;
        Ok(Some(chunk))
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes remaining to read.
    pub fn remaining(&self) -> u64 {
        self.file_size - self.offset
    }
}

// ---------------------------------------------------------------------------
// Range sinks
// ---------------------------------------------------------------------------

/// Destination that accepts byte ranges at arbitrary offsets.
pub trait RangeSink: Send {
    /// Writes `data` starting at `offset`.
    fn write_range(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError>;

    /// Flushes buffered data to its final destination.
    fn finish(&mut self) -> Result<(), TransferError>;
}

impl RangeSink for Cursor<Vec<u8>> {
    fn write_range(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TransferError> {
        Ok(())
    }
}

/// Writes ranges into a single output file at exact offsets.
pub struct RangeWriter {
    path: PathBuf,
    file: File,
    written: u64,
}

impl RangeWriter {
    /// Creates (or truncates) `path` and sizes it to `total_size` bytes.
    pub fn create(path: &Path, total_size: u64) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_size)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written: 0,
        })
    }

    /// Total bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Returns the output path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RangeSink for RangeWriter {
    fn write_range(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TransferError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
