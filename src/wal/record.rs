//! Log record framing shared by WAL and checkpoint files.
//!
//! Each physical record consists of:
//! - Checksum (4 bytes): CRC32 of length, type and data
//! - Length (4 bytes): Length of the data
//! - Type (1 byte): Record type (Full, First, Middle, Last)
//! - Data (variable): Fragment payload

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;

/// Maximum size of a single record's data portion
pub const MAX_FRAGMENT_SIZE: usize = 64 * 1024; // 64KB

/// Size of the record header (checksum + length + type)
pub const HEADER_SIZE: usize = 9;

/// Record types for entries that span several fragments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Complete entry in one record
    Full = 1,
    /// First fragment of a multi-record entry
    First = 2,
    /// Middle fragment of a multi-record entry
    Middle = 3,
    /// Last fragment of a multi-record entry
    Last = 4,
}

impl RecordType {
    /// Convert from u8 to RecordType
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordType::Full),
            2 => Ok(RecordType::First),
            3 => Ok(RecordType::Middle),
            4 => Ok(RecordType::Last),
            _ => Err(Error::corruption(format!("Invalid record type: {}", value))),
        }
    }

    /// Picks the fragment type for the chunk at `offset` of an entry of `total` bytes.
    pub fn for_fragment(offset: usize, chunk_len: usize, total: usize) -> Self {
        if total <= MAX_FRAGMENT_SIZE {
            RecordType::Full
        } else if offset == 0 {
            RecordType::First
        } else if offset + chunk_len >= total {
            RecordType::Last
        } else {
            RecordType::Middle
        }
    }
}

/// One physical log record
#[derive(Debug, Clone)]
pub struct Record {
    /// Type of the record
    pub record_type: RecordType,
    /// Fragment payload
    pub data: Vec<u8>,
}

impl Record {
    /// Create a new record
    pub fn new(record_type: RecordType, data: Vec<u8>) -> Self {
        Self { record_type, data }
    }

    /// Encode the record into `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let length = self.data.len() as u32;
        buf.reserve(HEADER_SIZE + self.data.len());
        buf.put_u32_le(Self::checksum(length, self.record_type, &self.data));
        buf.put_u32_le(length);
        buf.put_u8(self.record_type as u8);
        buf.put_slice(&self.data);
    }

    /// Parses a record header, returning `(checksum, length, type byte)`.
    pub fn parse_header(mut header: &[u8]) -> Result<(u32, usize, u8)> {
        if header.len() < HEADER_SIZE {
            return Err(Error::corruption(format!("Record header too short: {} bytes", header.len())));
        }
        let checksum = header.get_u32_le();
        let length = header.get_u32_le() as usize;
        let type_byte = header.get_u8();
        if length > MAX_FRAGMENT_SIZE {
            return Err(Error::corruption(format!("Record length {} exceeds fragment limit", length)));
        }
        Ok((checksum, length, type_byte))
    }

    /// Decode a record whose header has already been parsed.
    pub fn decode(checksum: u32, type_byte: u8, data: Vec<u8>) -> Result<Self> {
        let record_type = RecordType::from_u8(type_byte)?;
        let actual = Self::checksum(data.len() as u32, record_type, &data);
        if checksum != actual {
            return Err(Error::ChecksumMismatch { expected: checksum, actual });
        }
        Ok(Record { record_type, data })
    }

    fn checksum(length: u32, record_type: RecordType, data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&length.to_le_bytes());
        hasher.update(&[record_type as u8]);
        hasher.update(data);
        hasher.finalize()
    }
}
