//! Append-only storage for block data

use crate::{BlockError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Append-only byte sink backing a block
pub trait BlockStore {
    /// Append bytes, returning their `(offset, length)` in the store
    fn append(&mut self, bytes: &[u8]) -> Result<(u64, u64)>;

    /// Make everything appended so far durable
    fn flush(&mut self) -> Result<()>;
}

/// File backed store
pub struct FileStore {
    file: BufWriter<File>,
    offset: u64,
}

impl FileStore {
    /// Create a new file. Fails if the file already exists.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;

        Ok(Self {
            file: BufWriter::new(file),
            offset: 0,
        })
    }
}

impl BlockStore for FileStore {
    fn append(&mut self, bytes: &[u8]) -> Result<(u64, u64)> {
        self.file.write_all(bytes)?;
        let offset = self.offset;
        self.offset += bytes.len() as u64;
        Ok((offset, bytes.len() as u64))
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }
}

/// In-memory store.
///
/// Clones share the same buffer, so a handle kept by the caller sees
/// everything appended through the block.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    data: Vec<u8>,
    flushed: usize,
    fail_appends_after: Option<usize>,
    fail_flush: bool,
    appends: usize,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every append after the first `n` fail with an IO error
    pub fn fail_appends_after(&self, n: usize) {
        self.inner.lock().fail_appends_after = Some(n);
    }

    /// Make every flush fail with an IO error
    pub fn fail_flushes(&self) {
        self.inner.lock().fail_flush = true;
    }

    /// Copy of all bytes appended so far
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    /// Number of bytes appended so far
    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    /// True when nothing has been appended
    pub fn is_empty(&self) -> bool {
        self.inner.lock().data.is_empty()
    }

    /// Number of bytes covered by the last flush
    pub fn flushed_len(&self) -> usize {
        self.inner.lock().flushed
    }
}

impl BlockStore for MemoryStore {
    fn append(&mut self, bytes: &[u8]) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock();

        if let Some(limit) = inner.fail_appends_after {
            if inner.appends >= limit {
                return Err(BlockError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "memory store append failure",
                )));
            }
        }

        let offset = inner.data.len() as u64;
        inner.data.extend_from_slice(bytes);
        inner.appends += 1;
        Ok((offset, bytes.len() as u64))
    }

    fn flush(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_flush {
            return Err(BlockError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "memory store flush failure",
            )));
        }
        inner.flushed = inner.data.len();
        Ok(())
    }
}
