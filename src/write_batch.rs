//! The set of changes made by one committed write transaction.
//!
//! A `WriteBatch` is what the writer hands to the WAL at commit time and what
//! recovery replays into the store. All operations in a batch share the
//! batch's commit sequence number.
//!
//! Encoding:
//!
//! ```text
//! [sequence: u64][op_count: u32]
//!   op: [type: u8][table: u32][key_len: u32][key][value_len: u32][value]   (put)
//!   op: [type: u8][table: u32][key_len: u32][key]                          (delete)
//! ```

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Type of write operation in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Put operation with key and value
    Put {
        /// Table id
        table: u32,
        /// Key to insert
        key: Vec<u8>,
        /// Value to associate with the key
        value: Vec<u8>,
    },
    /// Delete operation with key
    Delete {
        /// Table id
        table: u32,
        /// Key to delete
        key: Vec<u8>,
    },
}

impl WriteOp {
    /// Table the operation applies to.
    pub fn table(&self) -> u32 {
        match self {
            WriteOp::Put { table, .. } | WriteOp::Delete { table, .. } => *table,
        }
    }

    /// Key the operation applies to.
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key, .. } => key,
        }
    }
}

/// Operations committed together under one sequence number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    sequence: u64,
    operations: Vec<WriteOp>,
    approximate_size: usize,
}

impl WriteBatch {
    /// Creates an empty batch for the given commit sequence.
    pub fn new(sequence: u64) -> Self {
        Self { sequence, operations: Vec::new(), approximate_size: 0 }
    }

    /// Adds a Put operation to the batch.
    pub fn put(&mut self, table: u32, key: Vec<u8>, value: Vec<u8>) {
        self.approximate_size += key.len() + value.len() + 13;
        self.operations.push(WriteOp::Put { table, key, value });
    }

    /// Adds a Delete operation to the batch.
    pub fn delete(&mut self, table: u32, key: Vec<u8>) {
        self.approximate_size += key.len() + 9;
        self.operations.push(WriteOp::Delete { table, key });
    }

    /// Commit sequence shared by every operation.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the number of operations in the batch.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if the batch contains no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Returns the approximate encoded size of the batch in bytes.
    pub fn approximate_size(&self) -> usize {
        self.approximate_size
    }

    /// Returns an iterator over the operations in the batch.
    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.operations.iter()
    }

    /// Encodes the batch for the WAL.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(12 + self.approximate_size);
        buf.put_u64(self.sequence);
        buf.put_u32(self.operations.len() as u32);
        for op in &self.operations {
            match op {
                WriteOp::Put { table, key, value } => {
                    buf.put_u8(OP_PUT);
                    buf.put_u32(*table);
                    buf.put_u32(key.len() as u32);
                    buf.put_slice(key);
                    buf.put_u32(value.len() as u32);
                    buf.put_slice(value);
                }
                WriteOp::Delete { table, key } => {
                    buf.put_u8(OP_DELETE);
                    buf.put_u32(*table);
                    buf.put_u32(key.len() as u32);
                    buf.put_slice(key);
                }
            }
        }
        buf.to_vec()
    }

    /// Decodes a batch written by [`WriteBatch::encode`].
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < 12 {
            return Err(Error::corruption("Write batch header too short"));
        }
        let mut batch = WriteBatch::new(data.get_u64());
        let count = data.get_u32();

        for _ in 0..count {
            if data.remaining() < 9 {
                return Err(Error::corruption("Write batch operation truncated"));
            }
            let op_type = data.get_u8();
            let table = data.get_u32();
            let key = take_bytes(&mut data)?;
            match op_type {
                OP_PUT => {
                    let value = take_bytes(&mut data)?;
                    batch.put(table, key, value);
                }
                OP_DELETE => batch.delete(table, key),
                other => {
                    return Err(Error::corruption(format!("Unknown write op type: {}", other)));
                }
            }
        }

        if data.has_remaining() {
            return Err(Error::corruption("Trailing bytes after write batch"));
        }
        Ok(batch)
    }
}

fn take_bytes(data: &mut &[u8]) -> Result<Vec<u8>> {
    if data.remaining() < 4 {
        return Err(Error::corruption("Missing length prefix"));
    }
    let len = data.get_u32() as usize;
    if data.remaining() < len {
        return Err(Error::corruption(format!("Expected {} bytes, {} remain", len, data.remaining())));
    }
    let bytes = data[..len].to_vec();
    data.advance(len);
    Ok(bytes)
}
