//! Core abstractions and implementation for data storage.
//!
//! `crucible`'s storage layer is an embedded, single-file key-value store with
//! MVCC snapshot isolation, copy-on-write B+Tree pages, and a write-ahead log
//! for crash recovery. A single writer and any number of concurrent readers
//! may be active against an open database at once; readers always observe a
//! consistent snapshot taken at the start of their transaction.
//!
//! # Key Components
//!
//! - [`file`]: the on-disk file handle and memory map over the data file.
//! - [`meta`]: the two alternating superblocks that anchor the database.
//! - [`pager`]: the page allocator, with deferred reclamation for pages still
//!   visible to an in-flight reader.
//! - [`node`]: the on-disk layout of a single B+Tree page (leaf or branch).
//! - [`btree`]: copy-on-write B+Tree insert/delete/search.
//! - [`bucket`]: a named keyspace, with support for nested sub-buckets.
//! - [`wal`]: the write-ahead log writer/reader and checkpoint protocol.
//! - [`tx`]: transactions and the transaction manager.
//! - [`shm`]: the cross-process coordination segment.
//! - [`options`]: user-facing configuration for opening a database.
pub mod btree;
pub mod bucket;
pub mod error;
pub mod file;
pub mod meta;
pub mod node;
pub mod options;
pub mod pager;
pub mod shm;
pub mod tx;
pub mod wal;

pub use error::Error;
pub use options::Options;
