use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::TransferError;
use crate::types::Chunk;

/// Number of chunks needed to carry `total` bytes in chunks of `chunk_size`.
pub fn chunk_count(total: u64, chunk_size: usize) -> u32 {
    let size = chunk_size.max(1) as u64;
    total.div_ceil(size).min(u32::MAX as u64) as u32
}

/// Reads a file as a sequence of numbered chunks.
pub struct ChunkReader {
    file: std::fs::File,
    chunk_size: usize,
    sequence: u32,
    offset: u64,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for chunked reading. `chunk_size` is clamped to what a
    /// `CHUNK` line can announce.
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        Ok(Self {
            file,
            chunk_size: chunk_size.clamp(1, u16::MAX as usize),
            sequence: 0,
            offset: 0,
            file_size,
        })
    }

    /// Reads the next chunk. Returns `None` at EOF.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let remaining = self.file_size.saturating_sub(self.offset);
        if remaining == 0 {
            return Ok(None);
        }

        let read_size = remaining.min(self.chunk_size as u64) as usize;
        let mut payload = vec![0u8; read_size];
        self.file.read_exact(&mut payload)?;

        let chunk = Chunk {
            sequence: self.sequence,
            payload,
        };
        self.sequence += 1;
        self.offset += read_size as u64;
        Ok(Some(chunk))
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes not yet handed out.
    pub fn remaining(&self) -> u64 {
        self.file_size - self.offset
    }
}

/// Appends acknowledged chunks to a partial file.
///
/// The file is created (or truncated) on open; nothing else is ever
/// written to it, so its length is always the number of bytes appended.
pub struct ChunkWriter {
    file: std::fs::File,
    path: PathBuf,
    written: u64,
}

impl ChunkWriter {
    pub fn create(path: &Path) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            written: 0,
        })
    }

    pub fn append(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Bytes appended so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes to disk and closes the file.
    pub fn finish(self) -> Result<PathBuf, TransferError> {
        self.file.sync_all()?;
        Ok(self.path)
    }
}
