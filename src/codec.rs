//! Byte codecs for keys and values.
//!
//! Fixed-width integers are written big-endian so that the byte order used by
//! the store's ordered iteration matches numeric order. Variable-width value
//! records are serialized with bincode through [`bincode_codec!`].

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Serializer for a key or value type.
pub trait Codec: Sized {
    /// Appends the encoded form of `self` to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Decodes a value from exactly `bytes`.
    fn decode(bytes: &[u8]) -> Result<Self>;

    /// Encodes `self` into a fresh byte vector.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Like [`Codec::to_bytes`], reporting encodings that can fail.
    fn try_to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_bytes())
    }
}

/// A compact auto-incrementing identifier type usable as a row key.
pub trait RowKey: Codec + Copy + Ord + Send + Sync + std::fmt::Debug + 'static {
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Converts a counter value into the key type.
    fn from_u64(value: u64) -> Result<Self>;

    /// Widens the key into a counter value.
    fn as_u64(self) -> u64;
}

fn check_width(bytes: &[u8], width: usize, what: &str) -> Result<()> {
    if bytes.len() != width {
        return Err(Error::Serialization(format!(
            "{} needs {} bytes, got {}",
            what,
            width,
            bytes.len()
        )));
    }
    Ok(())
}

impl Codec for u32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(*self);
    }

    fn decode(mut bytes: &[u8]) -> Result<Self> {
        check_width(bytes, 4, "u32")?;
        Ok(bytes.get_u32())
    }
}

impl RowKey for u32 {
    const WIDTH: usize = 4;

    fn from_u64(value: u64) -> Result<Self> {
        u32::try_from(value)
            .map_err(|_| Error::invalid_argument(format!("row key {} overflows u32", value)))
    }

    fn as_u64(self) -> u64 {
        u64::from(self)
    }
}

impl Codec for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(*self);
    }

    fn decode(mut bytes: &[u8]) -> Result<Self> {
        check_width(bytes, 8, "u64")?;
        Ok(bytes.get_u64())
    }
}

impl RowKey for u64 {
    const WIDTH: usize = 8;

    fn from_u64(value: u64) -> Result<Self> {
        Ok(value)
    }

    fn as_u64(self) -> u64 {
        self
    }
}

impl Codec for String {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Serialization(format!("invalid utf-8: {}", e)))
    }
}

impl Codec for Vec<u8> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

/// Implements [`Codec`] for a serde type using bincode.
///
/// Stores write values through [`Codec::try_to_bytes`], so a value that
/// fails to serialize fails its write. [`Codec::encode`] cannot report the
/// failure and logs it instead.
#[macro_export]
macro_rules! bincode_codec {
    ($ty:ty) => {
        impl $crate::codec::Codec for $ty {
            fn encode(&self, buf: &mut ::bytes::BytesMut) {
                $crate::codec::encode_bincode(self, buf, stringify!($ty));
            }

            fn decode(bytes: &[u8]) -> $crate::Result<Self> {
                Ok(::bincode::deserialize(bytes)?)
            }

            fn try_to_bytes(&self) -> $crate::Result<Vec<u8>> {
                Ok(::bincode::serialize(self)?)
            }
        }
    };
}

#[doc(hidden)]
pub fn encode_bincode<T: serde::Serialize + ?Sized>(value: &T, buf: &mut BytesMut, type_name: &str) {
    match bincode::serialize(value) {
        Ok(encoded) => buf.put_slice(&encoded),
        Err(e) => log::error!("Failed to serialize {}: {}", type_name, e),
    }
}

/// Returns the smallest key greater than every key starting with `prefix`,
/// or `None` if no such key exists (the prefix is all `0xFF`).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}
