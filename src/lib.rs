//! # proxydb - Durable state for a forwarding data proxy
//!
//! proxydb is an embedded, single-writer transactional key-value engine with
//! the durable structures a store-and-forward proxy needs on top of it.
//!
//! ## Architecture
//!
//! - **Environment**: one directory, many named tables, one writer thread.
//!   Mutations are closures handed to the writer and batched into commits;
//!   readers get consistent snapshots without blocking the writer.
//! - **Versioned store**: in-memory multi-version ordered map holding the
//!   committed state of every table.
//! - **WAL and checkpoints**: every commit is logged before it becomes
//!   visible; checkpoints bound the log and speed up recovery.
//! - **Keyed record store**: auto-increment ids with a hash index for
//!   get-or-create deduplication.
//! - **Durable queue**: crash-safe FIFO over a table, with blocking takes.
//! - **Proxy repository**: feeds, sources, items and aggregates.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use proxydb::{Environment, Options, Transaction};
//!
//! # fn main() -> Result<(), proxydb::Error> {
//! let env = Environment::open("./data", Options::default())?;
//! let table = env.open_table("events")?;
//!
//! // Writes run on the writer thread
//! env.write(move |txn| {
//!     txn.put(table, b"key1", b"value1")?;
//!     Ok(())
//! })?;
//! env.sync()?;
//!
//! // Reads see the latest commit
//! let value = env.read(|txn| Ok(txn.get(table, b"key1")))?;
//! assert_eq!(value.as_deref(), Some(&b"value1"[..]));
//!
//! env.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod codec;
pub mod config;
pub mod env;
pub mod error;
pub mod keyed_store;
pub mod queue;
pub mod repo;
pub mod row_key;
pub mod store;
pub mod txn;
pub mod wal;
pub mod write_batch;

// Re-exports
pub use codec::{Codec, RowKey};
pub use config::{AggregatorConfig, CloseMode, CompressionType, Options, RepoConfig};
pub use env::{EnvInfo, Environment, Table, TableInfo};
pub use error::{Error, Result};
pub use keyed_store::KeyedRecordStore;
pub use queue::{DurableQueue, QueueAppender};
pub use repo::{
    AggregateDao, AggregateKey, AggregatePacker, AggregateValue, FeedKey, ForwardDest, ProxyRepo, SourceDao,
    SourceItem, SourceItemKey, SourceRecord,
};
pub use row_key::RowKeyGenerator;
pub use txn::{Direction, KeyRange, PutOutcome, ReadTxn, Transaction, WriteTxn};
