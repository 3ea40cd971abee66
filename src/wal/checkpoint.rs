//! Checkpoint files: a full image of the live store at one commit sequence.
//!
//! Layout (each line is one framed log entry):
//!
//! ```text
//! header:  [magic: u32][version: u8][sequence: u64][compression: u8]
//! entry*:  [tag: u8 = 1] + compressed([table: u32][key_len: u32][key][value_len: u32][value])
//! trailer: [tag: u8 = 2][magic: u32][entry_count: u64]
//! ```
//!
//! A checkpoint is written to a temporary file, fsynced and renamed into
//! place, so a file with the final name is always complete.

use super::reader::LogReader;
use super::writer::LogWriter;
use crate::config::CompressionType;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::path::{Path, PathBuf};

const HEADER_MAGIC: u32 = 0x5058_434B; // "PXCK"
const TRAILER_MAGIC: u32 = 0x5058_454E; // "PXEN"
const FORMAT_VERSION: u8 = 1;
const TAG_ENTRY: u8 = 1;
const TAG_TRAILER: u8 = 2;

/// Streams entries into a new checkpoint file.
pub struct CheckpointWriter {
    writer: LogWriter,
    tmp_path: PathBuf,
    final_path: PathBuf,
    compression: CompressionType,
    count: u64,
}

impl CheckpointWriter {
    /// Starts a checkpoint that will be published at `path`.
    pub fn create(path: &Path, sequence: u64, compression: CompressionType) -> Result<Self> {
        let tmp_path = path.with_extension("ckpt.tmp");
        if tmp_path.exists() {
            std::fs::remove_file(&tmp_path)?;
        }

        let mut writer = LogWriter::new(&tmp_path)?;
        let mut header = BytesMut::with_capacity(14);
        header.put_u32(HEADER_MAGIC);
        header.put_u8(FORMAT_VERSION);
        header.put_u64(sequence);
        header.put_u8(compression as u8);
        writer.append(&header)?;

        Ok(Self { writer, tmp_path, final_path: path.to_path_buf(), compression, count: 0 })
    }

    /// Adds one live entry.
    pub fn add(&mut self, table: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(12 + key.len() + value.len());
        buf.put_u32(table);
        buf.put_u32(key.len() as u32);
        buf.put_slice(key);
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);

        let mut payload = vec![TAG_ENTRY];
        payload.extend_from_slice(&compress(self.compression, &buf)?);
        self.writer.append(&payload)?;
        self.count += 1;
        Ok(())
    }

    /// Writes the trailer, fsyncs and atomically publishes the checkpoint.
    pub fn finish(mut self) -> Result<u64> {
        let mut trailer = BytesMut::with_capacity(13);
        trailer.put_u8(TAG_TRAILER);
        trailer.put_u32(TRAILER_MAGIC);
        trailer.put_u64(self.count);
        self.writer.append(&trailer)?;
        self.writer.sync()?;

        std::fs::rename(&self.tmp_path, &self.final_path)?;
        if let Some(dir) = self.final_path.parent() {
            // Persist the rename itself.
            if let Ok(handle) = std::fs::File::open(dir) {
                let _ = handle.sync_all();
            }
        }
        Ok(self.count)
    }
}

/// A loaded checkpoint image.
#[derive(Debug)]
pub struct Checkpoint {
    /// Commit sequence the image reflects
    pub sequence: u64,
    /// Live `(table, key, value)` entries in store order
    pub entries: Vec<(u32, Vec<u8>, Vec<u8>)>,
}

impl Checkpoint {
    /// Loads and validates a checkpoint file.
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = LogReader::new(path)?;

        let header = reader
            .read_next()?
            .ok_or_else(|| Error::corruption(format!("Empty checkpoint {:?}", path)))?;
        let mut header = header.as_slice();
        if header.remaining() != 14 || header.get_u32() != HEADER_MAGIC {
            return Err(Error::corruption(format!("Bad checkpoint header in {:?}", path)));
        }
        let version = header.get_u8();
        if version != FORMAT_VERSION {
            return Err(Error::corruption(format!("Unsupported checkpoint version {}", version)));
        }
        let sequence = header.get_u64();
        let compression = CompressionType::from_u8(header.get_u8())
            .ok_or_else(|| Error::corruption("Unsupported checkpoint compression"))?;

        let mut entries = Vec::new();
        loop {
            let data = reader
                .read_next()?
                .ok_or_else(|| Error::corruption(format!("Checkpoint {:?} has no trailer", path)))?;

            let (tag, body) = match data.split_first() {
                Some((tag, body)) => (*tag, body),
                None => return Err(Error::corruption("Empty checkpoint record")),
            };

            if tag == TAG_TRAILER {
                let mut trailer = body;
                if trailer.remaining() != 12 || trailer.get_u32() != TRAILER_MAGIC {
                    return Err(Error::corruption(format!("Bad checkpoint trailer in {:?}", path)));
                }
                let count = trailer.get_u64();
                if count != entries.len() as u64 {
                    return Err(Error::corruption(format!(
                        "Checkpoint {:?} holds {} entries, trailer says {}",
                        path,
                        entries.len(),
                        count
                    )));
                }
                break;
            }

            if tag != TAG_ENTRY {
                return Err(Error::corruption(format!("Unknown checkpoint record tag {}", tag)));
            }
            let raw = decompress(compression, body)?;
            entries.push(decode_entry(&raw)?);
        }

        Ok(Self { sequence, entries })
    }
}

fn decode_entry(mut data: &[u8]) -> Result<(u32, Vec<u8>, Vec<u8>)> {
    let short = || Error::corruption("Checkpoint entry truncated");
    if data.remaining() < 8 {
        return Err(short());
    }
    let table = data.get_u32();
    let key_len = data.get_u32() as usize;
    if data.remaining() < key_len + 4 {
        return Err(short());
    }
    let key = data[..key_len].to_vec();
    data.advance(key_len);
    let value_len = data.get_u32() as usize;
    if data.remaining() != value_len {
        return Err(short());
    }
    Ok((table, key, data.to_vec()))
}

fn compress(compression: CompressionType, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::internal(format!("Snappy compression failed: {}", e))),
    }
}

fn decompress(compression: CompressionType, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::corruption(format!("Snappy decompression failed: {}", e))),
    }
}
