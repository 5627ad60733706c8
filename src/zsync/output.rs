use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

/// Shared handle to the under-construction output file.
///
/// Several jobs write disjoint block ranges through one handle, so every
/// write is the sequence seek, write, restore under one lock. The cursor is
/// never exposed to callers.
pub struct TargetFile {
    inner: Mutex<File>,
}

impl TargetFile {
    pub fn new(file: File) -> Self {
        Self {
            inner: Mutex::new(file),
        }
    }

    /// Create (or truncate) the output file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::new(file))
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut file = self.inner.lock().unwrap();
        let pos = file.stream_position()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Trim or extend to the exact target length (the last block is written
    /// zero-padded to a full block).
    pub fn set_len(&self, len: u64) -> std::io::Result<()> {
        let file = self.inner.lock().unwrap();
        file.set_len(len)
    }

    pub fn sync_all(&self) -> std::io::Result<()> {
        let file = self.inner.lock().unwrap();
        file.sync_all()
    }
}
