//! Error types for the proxy repository.

use std::io;

/// The result type used throughout proxydb.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for proxydb operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption was detected.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// The requested entity was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The environment or entity already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A checksum mismatch was detected.
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// The expected checksum value.
        expected: u32,
        /// The actual checksum value.
        actual: u32,
    },

    /// The store reached its configured size limit.
    #[error("Store full: {used} bytes used, limit is {limit} bytes")]
    StoreFull {
        /// Approximate bytes in use including the rejected write.
        used: usize,
        /// The configured limit.
        limit: usize,
    },

    /// No more tables can be created in the environment.
    #[error("Too many tables: limit is {0}")]
    TooManyTables(usize),

    /// A blocking wait was aborted because the environment is shutting down.
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// The environment no longer accepts commands.
    #[error("Environment closed")]
    Closed,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new interrupted error.
    pub fn interrupted(msg: impl Into<String>) -> Self {
        Error::Interrupted(msg.into())
    }

    /// Creates a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Returns true if this error means a blocking call was cancelled by shutdown.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted(_) | Error::Closed)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
