//! Writable table file
//!
//! The build pipeline needs more than sequential append: a writer reserves a
//! region at the current end of file, lets the next writer proceed, and only
//! then copies its bytes into the reserved range. Regions are disjoint, so
//! the copies themselves need no lock.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::StrataError;

/// Writable file contract required by the parallel builder
pub trait TableFile: Send + Sync {
    /// Reserve `len` bytes at the end of the file and return a handle for
    /// filling them in later
    fn reserve(&self, len: u64) -> Result<Box<dyn WriteRegion>>;

    /// Bytes reserved so far (the logical file length)
    fn reserved_len(&self) -> u64;

    /// Flush written data to stable storage
    fn sync(&self) -> Result<()>;

    /// Trim the file to its logical length; no writes may follow
    fn close(&self) -> Result<()>;

    /// Whether region reservation is backed by real positional writes.
    /// Files that can only append must go through a serial builder.
    fn supports_parallel_builder(&self) -> bool;
}

/// One reserved byte range of a table file
pub trait WriteRegion: Send {
    /// File offset where the region starts
    fn offset(&self) -> u64;

    /// Write `data` starting at the region's first byte
    fn assign(&mut self, data: &[u8]) -> Result<()>;

    /// Write `data` directly after the previously written bytes
    fn append(&mut self, data: &[u8]) -> Result<()>;
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(
    file: &File,
    mut buf: &mut [u8],
    mut offset: u64,
) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected end of file",
            ));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Disk-backed table file with up-front preallocation
pub struct DiskFile {
    file: Arc<File>,
    /// Allocation cursor: offset of the next reserved region
    end: Mutex<u64>,
}

impl DiskFile {
    /// Create (or truncate) `path`, preallocating `write_buffer_size` bytes.
    ///
    /// The preallocation is trimmed back to the written length on close.
    pub fn create(path: &Path, write_buffer_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(write_buffer_size as u64)?;
        Ok(Self {
            file: Arc::new(file),
            end: Mutex::new(0),
        })
    }
}

impl TableFile for DiskFile {
    fn reserve(&self, len: u64) -> Result<Box<dyn WriteRegion>> {
        let mut end = self.end.lock();
        let start = *end;
        *end += len;
        Ok(Box::new(DiskRegion {
            file: Arc::clone(&self.file),
            start,
            cursor: start,
            limit: start + len,
        }))
    }

    fn reserved_len(&self) -> u64 {
        *self.end.lock()
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let end = *self.end.lock();
        self.file.set_len(end)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn supports_parallel_builder(&self) -> bool {
        true
    }
}

/// Region of a [`DiskFile`], written with positional writes
struct DiskRegion {
    file: Arc<File>,
    start: u64,
    cursor: u64,
    limit: u64,
}

impl DiskRegion {
    fn write_at_cursor(&mut self, data: &[u8]) -> Result<()> {
        if self.cursor + data.len() as u64 > self.limit {
            return Err(StrataError::InvariantViolation(format!(
                "write of {} bytes overruns region [{}, {})",
                data.len(),
                self.start,
                self.limit
            )));
        }
        write_all_at(&self.file, data, self.cursor)?;
        self.cursor += data.len() as u64;
        Ok(())
    }
}

impl WriteRegion for DiskRegion {
    fn offset(&self) -> u64 {
        self.start
    }

    fn assign(&mut self, data: &[u8]) -> Result<()> {
        self.cursor = self.start;
        self.write_at_cursor(data)
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.write_at_cursor(data)
    }
}
