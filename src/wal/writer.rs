//! Append-only log writer used for WAL and checkpoint files.

use super::record::{Record, RecordType, MAX_FRAGMENT_SIZE};
use crate::error::Result;
use bytes::BytesMut;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writer appending framed entries to a log file
pub struct LogWriter {
    /// Path to the log file
    path: PathBuf,
    /// Buffered writer for efficient I/O
    writer: BufWriter<File>,
    /// Current file size
    file_size: u64,
}

impl LogWriter {
    /// Opens the file in append mode, creating it if it doesn't exist.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let file_size = file.metadata()?.len();

        Ok(Self { path, writer: BufWriter::new(file), file_size })
    }

    /// Appends one entry, fragmenting it if it exceeds the record limit.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut buf = BytesMut::new();
        let mut offset = 0;
        while offset < data.len() {
            let chunk_len = (data.len() - offset).min(MAX_FRAGMENT_SIZE);
            let record_type = RecordType::for_fragment(offset, chunk_len, data.len());
            Record::new(record_type, data[offset..offset + chunk_len].to_vec()).encode_into(&mut buf);
            offset += chunk_len;
        }

        self.writer.write_all(&buf)?;
        self.file_size += buf.len() as u64;
        Ok(())
    }

    /// Pushes buffered data to the OS without forcing it to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs the file.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Get the current file size
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Get the path to the log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        // Best effort flush on drop
        let _ = self.writer.flush();
    }
}
