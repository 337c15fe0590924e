//! Buffered appender for one (vbucket, bin) file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::dcp::fd_pool::{FdHandle, FdPool};
use crate::utils::bin_file_path;

/// Buffer capacity per bin writer. Records larger than this bypass the
/// buffer entirely.
pub const BIN_BUFFER_CAPACITY: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum BinError {
    #[error("bin file io on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("incomplete write to {path}: wrote {written} of {expected} bytes")]
    IncompleteWrite {
        path: PathBuf,
        expected: usize,
        written: usize,
    },
}

enum BinSink {
    Pooled(FdHandle),
    Direct { path: PathBuf, file: File },
}

impl BinSink {
    fn path(&self) -> &Path {
        match self {
            BinSink::Pooled(handle) => handle.path(),
            BinSink::Direct { path, .. } => path,
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            BinSink::Pooled(handle) => handle.append(data),
            BinSink::Direct { file, .. } => file.write(data),
        }
    }
}

/// Single-owner buffered writer; all calls come from one handler's drain
/// thread for its assigned vbuckets.
pub struct BinWriter {
    buf: Vec<u8>,
    capacity: usize,
    sink: BinSink,
}

impl BinWriter {
    pub fn new(
        dir: &Path,
        vbno: u16,
        bin: usize,
        pool: Option<&Arc<FdPool>>,
    ) -> Result<Self, BinError> {
        Self::with_capacity(dir, vbno, bin, pool, BIN_BUFFER_CAPACITY)
    }

    pub fn with_capacity(
        dir: &Path,
        vbno: u16,
        bin: usize,
        pool: Option<&Arc<FdPool>>,
        capacity: usize,
    ) -> Result<Self, BinError> {
        let path = bin_file_path(dir, vbno, bin);
        let sink = match pool {
            Some(pool) => BinSink::Pooled(pool.register(&path)),
            None => {
                let file = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&path)
                    .map_err(|source| BinError::Io {
                        path: path.clone(),
                        source,
                    })?;
                BinSink::Direct { path, file }
            }
        };
        Ok(Self {
            buf: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            sink,
        })
    }

    pub fn write(&mut self, record: &[u8]) -> Result<(), BinError> {
        if self.buf.len() + record.len() > self.capacity {
            self.flush()?;
        }
        if record.len() >= self.capacity {
            return self.write_out(record);
        }
        self.buf.extend_from_slice(record);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BinError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let buf = std::mem::take(&mut self.buf);
        let result = self.write_out(&buf);
        self.buf = buf;
        self.buf.clear();
        result
    }

    fn write_out(&mut self, data: &[u8]) -> Result<(), BinError> {
        let written = self.sink.write(data).map_err(|source| BinError::Io {
            path: self.sink.path().to_path_buf(),
            source,
        })?;
        if written != data.len() {
            return Err(BinError::IncompleteWrite {
                path: self.sink.path().to_path_buf(),
                expected: data.len(),
                written,
            });
        }
        Ok(())
    }

    /// Flush remaining buffered bytes and release the file handle.
    pub fn close(mut self) -> Result<(), BinError> {
        self.flush()?;
        if let BinSink::Pooled(handle) = self.sink {
            handle.deregister();
        }
        Ok(())
    }
}
