//! Embeddable memory-mapped transactional key-value store
//!
//! burrowdb keeps ordered byte-string tables in a single memory-mapped file
//! behind a copy-on-write B+tree. One writer and any number of readers run
//! concurrently without reader locks: readers pin an MVCC snapshot in a
//! shared lock region, the writer shadows pages and promotes its commit by
//! atomically rotating one of three meta pages. Retired pages flow through
//! a txnid-keyed free-list table and come back into use once no snapshot
//! can reach them.

#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod btree;
pub mod comparator;
pub mod copy;
pub mod cursor;
pub mod db;
pub mod env;
pub mod error;
pub mod gc;
pub mod meta;
pub mod page;
pub mod pager;
pub mod reader;
pub mod registry;
pub mod spill;
pub mod txn;
pub mod unaligned;

// Re-exports
pub use copy::{copy_to_file, copy_to_writer, CopyOptions};
pub use cursor::Cursor;
pub use db::{Database, DatabaseFlags, Dbi, PutFlags};
pub use env::{Durability, EnvBuilder, Environment};
pub use error::{Error, PageId, Result, TxnId};
pub use registry::{set_debug_sink, set_runtime_flags, DebugSink, RuntimeFlags};
pub use txn::{ReadTransaction, Transaction, WriteTransaction};

/// The page size this build uses
pub const PAGE_SIZE: usize = page::PAGE_SIZE;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
