//! Write-Ahead Log (WAL) and checkpoint files.
//!
//! The WAL ensures durability by persisting every committed write transaction
//! before its changes become visible in the store. Checkpoints bound the
//! amount of log replayed at startup.
//!
//! ## Files
//!
//! - `NNNNNN.log`: a WAL file, one entry per committed [`WriteBatch`]
//! - `NNNNNN.ckpt`: a full image of the store as of the end of WAL `NNNNNN`
//!
//! Both use the same checksummed, fragment-capable record framing.

pub mod checkpoint;
pub mod reader;
pub mod record;
pub mod writer;

pub use checkpoint::{Checkpoint, CheckpointWriter};
pub use reader::LogReader;
pub use record::{Record, RecordType};
pub use writer::LogWriter;

use crate::error::Result;
use crate::write_batch::WriteBatch;
use std::path::{Path, PathBuf};

/// The active write-ahead log file
pub struct Wal {
    writer: LogWriter,
    number: u64,
}

impl Wal {
    /// Opens (or creates) WAL file `number` in `dir`.
    pub fn open(dir: &Path, number: u64) -> Result<Self> {
        let writer = LogWriter::new(dir.join(wal_filename(number)))?;
        Ok(Self { writer, number })
    }

    /// Appends a committed batch.
    pub fn append_batch(&mut self, batch: &WriteBatch) -> Result<()> {
        self.writer.append(&batch.encode())
    }

    /// Hands buffered entries to the OS.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()
    }

    /// Flushes and fsyncs the WAL.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.sync()
    }

    /// Get the current file size
    pub fn size(&self) -> u64 {
        self.writer.file_size()
    }

    /// File number of this WAL
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Get the path to the WAL file
    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    /// Replays every intact batch of a WAL file whose sequence is above `after`.
    ///
    /// Replay of a file stops at its first damaged record. Returns the number
    /// of batches applied.
    pub fn replay<P, F>(path: P, after: u64, mut apply: F) -> Result<usize>
    where
        P: AsRef<Path>,
        F: FnMut(WriteBatch),
    {
        let path = path.as_ref();
        let mut reader = LogReader::new(path)?;
        let (entries, clean) = reader.recover_all()?;
        if !clean {
            log::warn!("WAL {:?} has a damaged tail after {} bytes", path, reader.position());
        }

        let mut applied = 0;
        for entry in entries {
            let batch = match WriteBatch::decode(&entry) {
                Ok(batch) => batch,
                Err(e) => {
                    log::warn!("Stopping replay of {:?}: {}", path, e);
                    break;
                }
            };
            if batch.sequence() > after {
                apply(batch);
                applied += 1;
            }
        }
        Ok(applied)
    }
}

/// WAL and checkpoint file numbers found in an environment directory.
#[derive(Debug, Default)]
pub struct LogFiles {
    /// WAL file numbers, ascending
    pub wals: Vec<u64>,
    /// Checkpoint file numbers, ascending
    pub checkpoints: Vec<u64>,
}

impl LogFiles {
    /// Scans `dir` for WAL and checkpoint files.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut files = LogFiles::default();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(num) = parse_wal_filename(name) {
                    files.wals.push(num);
                } else if let Some(num) = parse_checkpoint_filename(name) {
                    files.checkpoints.push(num);
                }
            }
        }
        files.wals.sort_unstable();
        files.checkpoints.sort_unstable();
        Ok(files)
    }

    /// Highest file number in use.
    pub fn max_number(&self) -> u64 {
        let wal = self.wals.last().copied().unwrap_or(0);
        let ckpt = self.checkpoints.last().copied().unwrap_or(0);
        wal.max(ckpt)
    }
}

/// Generate a WAL filename for a given file number
pub fn wal_filename(number: u64) -> String {
    format!("{:06}.log", number)
}

/// Parse a WAL filename to extract the file number
pub fn parse_wal_filename(filename: &str) -> Option<u64> {
    filename.strip_suffix(".log")?.parse().ok()
}

/// Generate a checkpoint filename for a given file number
pub fn checkpoint_filename(number: u64) -> String {
    format!("{:06}.ckpt", number)
}

/// Parse a checkpoint filename to extract the file number
pub fn parse_checkpoint_filename(filename: &str) -> Option<u64> {
    filename.strip_suffix(".ckpt")?.parse().ok()
}

/// Path of WAL file `number` in `dir`.
pub fn wal_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(wal_filename(number))
}
