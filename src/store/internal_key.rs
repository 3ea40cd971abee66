//! # Internal Key Format
//!
//! Every version held by the store is addressed by an internal key:
//!
//! ```text
//! InternalKey:
//!   [table: u32] [user_key: bytes] [sequence: u64] [type: u8]
//! ```
//!
//! ## Ordering
//!
//! InternalKeys are ordered by:
//! 1. table (ascending)
//! 2. user_key (ascending)
//! 3. sequence (descending - newer first)
//! 4. type (descending - Value before Deletion)

use std::cmp::Ordering;

/// The type of a version in the store.
///
/// - `Value`: A normal key-value pair
/// - `Deletion`: A tombstone marking that a key has been deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueType {
    /// A tombstone indicating the key has been deleted
    Deletion = 0,

    /// A normal value
    Value = 1,
}

/// Internal key used in the versioned store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    table: u32,
    user_key: Vec<u8>,
    sequence: u64,
    value_type: ValueType,
}

impl InternalKey {
    /// Creates a new InternalKey.
    pub fn new(table: u32, user_key: Vec<u8>, sequence: u64, value_type: ValueType) -> Self {
        Self { table, user_key, sequence, value_type }
    }

    /// Smallest internal key for `user_key`: its newest possible version.
    pub fn first_version(table: u32, user_key: Vec<u8>) -> Self {
        Self::new(table, user_key, u64::MAX, ValueType::Value)
    }

    /// Largest internal key for `user_key`: its oldest possible version.
    pub fn last_version(table: u32, user_key: Vec<u8>) -> Self {
        Self::new(table, user_key, 0, ValueType::Deletion)
    }

    /// Returns the table id.
    pub fn table(&self) -> u32 {
        self.table
    }

    /// Returns the user key portion.
    pub fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    /// Returns the sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the value type.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// True if both keys address versions of the same user key.
    pub fn same_user_key(&self, other: &InternalKey) -> bool {
        self.table == other.table && self.user_key == other.user_key
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.table
            .cmp(&other.table)
            .then_with(|| self.user_key.cmp(&other.user_key))
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.value_type.cmp(&self.value_type))
    }
}
