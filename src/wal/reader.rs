//! Log reader used during recovery.

use super::record::{Record, RecordType, HEADER_SIZE};
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

/// Reader reassembling framed entries from a log file
pub struct LogReader {
    reader: BufReader<File>,
    /// Offset just past the last complete entry
    position: u64,
}

impl LogReader {
    /// Open a log file for reading
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self { reader: BufReader::new(file), position: 0 })
    }

    /// Reads the next complete entry, or `None` at a clean end of file.
    ///
    /// A record cut short by the end of the file is reported as corruption.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        let mut assembled: Option<Vec<u8>> = None;
        let mut consumed = 0u64;

        loop {
            let record = match self.read_record(&mut consumed)? {
                Some(record) => record,
                None if assembled.is_some() => {
                    return Err(Error::corruption("EOF while expecting continuation record"));
                }
                None => return Ok(None),
            };

            match (record.record_type, assembled.as_mut()) {
                (RecordType::Full, None) => {
                    self.position += consumed;
                    return Ok(Some(record.data));
                }
                (RecordType::First, None) => assembled = Some(record.data),
                (RecordType::Middle, Some(data)) => data.extend_from_slice(&record.data),
                (RecordType::Last, Some(data)) => {
                    data.extend_from_slice(&record.data);
                    self.position += consumed;
                    return Ok(assembled);
                }
                (record_type, _) => {
                    return Err(Error::corruption(format!(
                        "Unexpected {:?} record at offset {}",
                        record_type, self.position
                    )));
                }
            }
        }
    }

    fn read_record(&mut self, consumed: &mut u64) -> Result<Option<Record>> {
        let mut header = [0u8; HEADER_SIZE];
        match self.read_fully(&mut header)? {
            0 => return Ok(None),
            n if n < HEADER_SIZE => return Err(Error::corruption("Truncated record header")),
            _ => {}
        }

        let (checksum, length, type_byte) = Record::parse_header(&header)?;
        let mut data = vec![0u8; length];
        if self.read_fully(&mut data)? < length {
            return Err(Error::corruption("Truncated record body"));
        }

        *consumed += (HEADER_SIZE + length) as u64;
        Record::decode(checksum, type_byte, data).map(Some)
    }

    /// Fills `buf` as far as the file allows, returning the number of bytes read.
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(filled)
    }

    /// Offset just past the last complete entry
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads every entry up to the end of the file or the first damaged record.
    ///
    /// Returns the entries and whether the file ended cleanly.
    pub fn recover_all(&mut self) -> Result<(Vec<Vec<u8>>, bool)> {
        let mut entries = Vec::new();

        loop {
            match self.read_next() {
                Ok(Some(data)) => entries.push(data),
                Ok(None) => return Ok((entries, true)),
                Err(Error::Corruption(msg)) => {
                    log::warn!("Log corruption at offset {}: {}", self.position, msg);
                    return Ok((entries, false));
                }
                Err(Error::ChecksumMismatch { expected, actual }) => {
                    log::warn!(
                        "Log checksum mismatch at offset {}: expected {:#x}, got {:#x}",
                        self.position,
                        expected,
                        actual
                    );
                    return Ok((entries, false));
                }
                Err(e) => return Err(e),
            }
        }
    }
}
