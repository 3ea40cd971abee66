//! Configuration options for the environment and the proxy repository.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration options for opening an environment.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the environment directory if it doesn't exist.
    /// Default: true
    pub create_if_missing: bool,

    /// Error if the environment already exists.
    /// Default: false
    pub error_if_exists: bool,

    /// Maximum number of named tables, the catalog excluded.
    /// Default: 32
    pub max_tables: usize,

    /// Maximum number of concurrently open read transactions.
    /// Default: 126
    pub max_readers: usize,

    /// Upper bound on the approximate live size of the store (in bytes).
    /// Default: 1GB
    pub max_store_size: usize,

    /// Capacity of the writer's command queue. Callers block when it is full.
    /// Default: 1000
    pub command_queue_capacity: usize,

    /// Commit the open write transaction after this many commands.
    /// Default: 1000
    pub auto_commit_max_items: usize,

    /// Commit the open write transaction once it has been open this long.
    /// Default: 100ms
    pub auto_commit_interval: Duration,

    /// Fsync the WAL on every commit rather than only on `sync()`.
    /// Default: false
    pub sync_on_commit: bool,

    /// Write a checkpoint once the active WAL grows past this size (in bytes).
    /// Default: 64MB
    pub checkpoint_wal_size: u64,

    /// Compression applied to checkpoint entries.
    /// Default: CompressionType::Snappy
    pub compression: CompressionType,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            max_tables: 32,
            max_readers: 126,
            max_store_size: 1024 * 1024 * 1024, // 1GB
            command_queue_capacity: 1000,
            auto_commit_max_items: 1000,
            auto_commit_interval: Duration::from_millis(100),
            sync_on_commit: false,
            checkpoint_wal_size: 64 * 1024 * 1024, // 64MB
            compression: CompressionType::default(),
        }
    }
}

/// Compression algorithms supported for checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    /// No compression.
    None = 0,

    /// Snappy compression (fast, moderate compression ratio).
    #[cfg(feature = "snappy")]
    Snappy = 1,
}

impl CompressionType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            #[cfg(feature = "snappy")]
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

impl Default for CompressionType {
    fn default() -> Self {
        #[cfg(feature = "snappy")]
        return CompressionType::Snappy;

        #[cfg(not(feature = "snappy"))]
        CompressionType::None
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the environment if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the maximum number of tables.
    pub fn max_tables(mut self, value: usize) -> Self {
        self.max_tables = value;
        self
    }

    /// Sets the maximum number of concurrent readers.
    pub fn max_readers(mut self, value: usize) -> Self {
        self.max_readers = value;
        self
    }

    /// Sets the store size limit.
    pub fn max_store_size(mut self, size: usize) -> Self {
        self.max_store_size = size;
        self
    }

    /// Sets the command queue capacity.
    pub fn command_queue_capacity(mut self, value: usize) -> Self {
        self.command_queue_capacity = value;
        self
    }

    /// Sets the auto-commit policy.
    pub fn auto_commit(mut self, max_items: usize, interval: Duration) -> Self {
        self.auto_commit_max_items = max_items;
        self.auto_commit_interval = interval;
        self
    }

    /// Sets whether every commit is fsynced.
    pub fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the WAL size that triggers a checkpoint.
    pub fn checkpoint_wal_size(mut self, size: u64) -> Self {
        self.checkpoint_wal_size = size;
        self
    }

    /// Sets the checkpoint compression algorithm.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_tables == 0 {
            return Err(crate::Error::invalid_argument("max_tables must be > 0"));
        }
        if self.max_readers == 0 {
            return Err(crate::Error::invalid_argument("max_readers must be > 0"));
        }
        if self.max_store_size == 0 {
            return Err(crate::Error::invalid_argument("max_store_size must be > 0"));
        }
        if self.command_queue_capacity == 0 {
            return Err(crate::Error::invalid_argument("command_queue_capacity must be > 0"));
        }
        if self.auto_commit_max_items == 0 {
            return Err(crate::Error::invalid_argument("auto_commit_max_items must be > 0"));
        }
        if self.auto_commit_interval.is_zero() {
            return Err(crate::Error::invalid_argument("auto_commit_interval must be > 0"));
        }
        if self.checkpoint_wal_size == 0 {
            return Err(crate::Error::invalid_argument("checkpoint_wal_size must be > 0"));
        }
        Ok(())
    }
}

/// How the periodic sweep decides that an open aggregate should be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseMode {
    /// Close when the item cap, the byte cap or the age limit is reached.
    #[default]
    AnyThreshold,

    /// Close only when the item cap, the byte cap and the age limit are all reached.
    AllThresholds,
}

/// Bounds applied when packing items into aggregates.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Maximum number of items in one aggregate.
    /// Default: 1000
    pub max_items_per_aggregate: u32,

    /// Maximum accumulated item bytes in one aggregate.
    /// Default: 1GB
    pub max_bytes_per_aggregate: u64,

    /// Maximum age of an open aggregate before the sweep closes it.
    /// Default: 10 minutes
    pub max_aggregate_age: Duration,

    /// Threshold combination used by the sweep.
    /// Default: CloseMode::AnyThreshold
    pub close_mode: CloseMode,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_items_per_aggregate: 1000,
            max_bytes_per_aggregate: 1024 * 1024 * 1024,
            max_aggregate_age: Duration::from_secs(600),
            close_mode: CloseMode::default(),
        }
    }
}

/// Configuration for a [`ProxyRepo`](crate::ProxyRepo).
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// Directory holding the environment.
    pub db_dir: PathBuf,

    /// Environment options.
    pub options: Options,

    /// Aggregation bounds.
    pub aggregator: AggregatorConfig,

    /// Number of consumed queue entries deleted per trimming batch.
    /// Default: 1000
    pub queue_delete_batch_size: u64,
}

impl RepoConfig {
    /// Creates a configuration for the given directory with default settings.
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_dir: db_dir.into(),
            options: Options::default(),
            aggregator: AggregatorConfig::default(),
            queue_delete_batch_size: 1000,
        }
    }

    /// Sets the environment options.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Sets the aggregation bounds.
    pub fn aggregator(mut self, aggregator: AggregatorConfig) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Sets the queue trimming batch size.
    pub fn queue_delete_batch_size(mut self, size: u64) -> Self {
        self.queue_delete_batch_size = size;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        self.options.validate()?;
        if self.aggregator.max_items_per_aggregate == 0 {
            return Err(crate::Error::invalid_argument("max_items_per_aggregate must be > 0"));
        }
        if self.aggregator.max_bytes_per_aggregate == 0 {
            return Err(crate::Error::invalid_argument("max_bytes_per_aggregate must be > 0"));
        }
        if self.queue_delete_batch_size == 0 {
            return Err(crate::Error::invalid_argument("queue_delete_batch_size must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert!(opts.create_if_missing);
        assert!(!opts.error_if_exists);
        assert_eq!(opts.auto_commit_max_items, 1000);
        assert_eq!(opts.auto_commit_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_options_builder() {
        let opts = Options::new()
            .max_tables(8)
            .auto_commit(10, Duration::from_millis(5))
            .sync_on_commit(true);

        assert_eq!(opts.max_tables, 8);
        assert_eq!(opts.auto_commit_max_items, 10);
        assert_eq!(opts.auto_commit_interval, Duration::from_millis(5));
        assert!(opts.sync_on_commit);
    }

    #[test]
    fn test_options_validation() {
        let mut opts = Options::default();
        assert!(opts.validate().is_ok());

        opts.max_readers = 0;
        assert!(opts.validate().is_err());

        opts.max_readers = 4;
        opts.auto_commit_interval = Duration::ZERO;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_repo_config_validation() {
        let config = RepoConfig::new("/tmp/proxy");
        assert!(config.validate().is_ok());
        assert_eq!(config.aggregator.close_mode, CloseMode::AnyThreshold);

        let config = RepoConfig::new("/tmp/proxy").queue_delete_batch_size(0);
        assert!(config.validate().is_err());
    }
}
