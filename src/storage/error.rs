//! Error types returned by the storage engine.

use std::io;

use thiserror::Error;

use super::meta::TxId;

/// Every failure mode the storage engine can produce.
///
/// Deliberately closed rather than an open `Box<dyn Error>` catch-all: each
/// component below (file I/O, the meta superblocks, the WAL, argument
/// validation, the pager, and the transaction manager) has a bounded set of
/// ways it can fail, and callers should be able to match on them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("meta error: {0}")]
    Meta(#[from] MetaError),

    #[error("logger error: {0}")]
    Logger(#[from] LoggerError),

    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] InvalidArgumentError),

    #[error("pager error: {0}")]
    Pager(#[from] PagerError),

    #[error("transaction manager error: {0}")]
    TxManager(#[from] TxManagerError),
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("bad signature: expected {expected:#x}, found {found:#x}")]
    BadSignature { expected: u32, found: u32 },
    #[error("unsupported version {found}, minimum supported is {min}")]
    UnsupportedVersion { found: u32, min: u32 },
    #[error("checksum mismatch: expected {expected:#x}, computed {computed:#x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("both meta pages are invalid")]
    NoValidMeta,
}

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("wal frame checksum mismatch at offset {offset}")]
    ChecksumMismatch { offset: u64 },
    #[error("wal frame truncated at offset {offset}")]
    Truncated { offset: u64 },
    #[error("wal contains an unterminated transaction {txid:?}")]
    UnterminatedTransaction { txid: TxId },
    #[error("wal size {size} exceeds configured maximum {max}")]
    TooLarge { size: u64, max: u64 },
}

#[derive(Debug, Error)]
pub enum InvalidArgumentError {
    #[error("page size {0} is not a power of two")]
    PageSizeNotPowerOfTwo(u32),
    #[error("page size {0} is below the minimum of 512 bytes")]
    PageSizeTooSmall(u32),
    #[error("key is empty")]
    EmptyKey,
    #[error("key of length {0} exceeds the maximum supported length")]
    KeyTooLarge(usize),
    #[error("bucket name is empty")]
    EmptyBucketName,
    #[error("database is open read-only")]
    ReadOnly,
}

#[derive(Debug, Error)]
pub enum PagerError {
    #[error("page {0:?} is out of bounds")]
    OutOfBounds(super::meta::PageId),
    #[error("free list is corrupt: {0}")]
    CorruptFreeList(String),
    #[error("out of address space: mmap cannot grow past {0} bytes")]
    AddressSpaceExhausted(u64),
}

#[derive(Debug, Error)]
pub enum TxManagerError {
    #[error("a write transaction is already in progress")]
    WriterBusy,
    #[error("transaction {0:?} was already finished")]
    AlreadyFinished(TxId),
    #[error("transaction {0:?} is not the current writer")]
    NotWriter(TxId),
}

pub type Result<T> = std::result::Result<T, Error>;
