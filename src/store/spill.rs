//! Spill files
//!
//! Append-only files of length-prefixed encoded records. Spilled store buckets and
//! overflowing back-channels both sit on top of this. Every I/O call goes through a
//! [`RetryPolicy`]: transient failures are retried a bounded number of times and then
//! surface as [`IterationError::SpillIoFailure`].
//!
//! Spill I/O and its retry backoff are synchronous. On a multi-threaded runtime they run
//! under `block_in_place`, so the calling worker hands its other tasks off first.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::warn;

use crate::error::{IterationError, Result};
use crate::record::Record;

const FRAME_HEADER_BYTES: u64 = 4;

/// Bounded retry for secondary-storage operations
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: crate::constants::defaults::SPILL_IO_RETRIES,
            backoff: Duration::from_millis(crate::constants::defaults::SPILL_RETRY_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    pub fn run<T>(
        &self,
        operation: &'static str,
        path: &Path,
        op: impl FnMut() -> io::Result<T>,
    ) -> Result<T> {
        off_async_worker(|| self.run_blocking(operation, path, op))
    }

    fn run_blocking<T>(
        &self,
        operation: &'static str,
        path: &Path,
        mut op: impl FnMut() -> io::Result<T>,
    ) -> Result<T> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(error) if attempts <= self.retries => {
                    warn!(
                        operation = operation,
                        path = %path.display(),
                        attempt = attempts,
                        error = %error,
                        "⚠️ SPILL: I/O failed, retrying"
                    );
                    if !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff * attempts);
                    }
                }
                Err(source) => {
                    return Err(IterationError::SpillIoFailure {
                        operation,
                        path: path.to_path_buf(),
                        attempts,
                        source,
                    })
                }
            }
        }
    }
}

/// Run blocking I/O outside the async scheduler when called from a multi-threaded
/// runtime worker. Current-thread runtimes and plain threads run it inline.
fn off_async_worker<T>(io: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(io)
        }
        _ => io(),
    }
}

/// Temporary append-only record file, deleted on drop
#[derive(Debug)]
pub struct SpillFile {
    file: NamedTempFile,
    path: PathBuf,
    len: u64,
    retry: RetryPolicy,
}

impl SpillFile {
    pub fn create(directory: &Path, prefix: &str, retry: RetryPolicy) -> Result<Self> {
        let file = retry.run("create", directory, || {
            tempfile::Builder::new()
                .prefix(prefix)
                .suffix(".spill")
                .tempfile_in(directory)
        })?;
        let path = file.path().to_path_buf();
        Ok(Self {
            file,
            path,
            len: 0,
            retry,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total bytes written, including frame headers
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one record; returns its offset and the frame size in bytes
    pub fn append(&mut self, record: &Record) -> Result<(u64, u64)> {
        let bytes = record.encode()?;
        let offset = self.len;
        let header = (bytes.len() as u32).to_le_bytes();
        let file = self.file.as_file_mut();
        self.retry.run("append", &self.path, || {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&header)?;
            file.write_all(&bytes)
        })?;
        let frame = FRAME_HEADER_BYTES + bytes.len() as u64;
        self.len += frame;
        Ok((offset, frame))
    }

    /// Read the record stored at `offset`
    pub fn read_at(&mut self, offset: u64) -> Result<Record> {
        let file = self.file.as_file_mut();
        let bytes = self.retry.run("read", &self.path, || {
            file.seek(SeekFrom::Start(offset))?;
            let mut header = [0u8; 4];
            file.read_exact(&mut header)?;
            let mut bytes = vec![0u8; u32::from_le_bytes(header) as usize];
            file.read_exact(&mut bytes)?;
            Ok(bytes)
        })?;
        Record::decode(&bytes)
    }

    /// Read every record in write order
    pub fn read_all(&mut self) -> Result<Vec<Record>> {
        let len = self.len;
        let file = self.file.as_file_mut();
        let frames = self.retry.run("scan", &self.path, || {
            file.seek(SeekFrom::Start(0))?;
            read_frames(&*file, len)
        })?;
        frames.iter().map(|bytes| Record::decode(bytes)).collect()
    }
}

fn read_frames(file: &File, len: u64) -> io::Result<Vec<Vec<u8>>> {
    let mut reader = BufReader::new(file);
    let mut frames = Vec::new();
    let mut position = 0;
    while position < len {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header)?;
        let size = u32::from_le_bytes(header) as usize;
        let mut bytes = vec![0u8; size];
        reader.read_exact(&mut bytes)?;
        position += FRAME_HEADER_BYTES + size as u64;
        frames.push(bytes);
    }
    Ok(frames)
}
