//! User-facing configuration for opening a database.

use super::error::InvalidArgumentError;
use super::meta::MIN_PAGE_SIZE;
use super::node::{lexicographic, Comparator};

/// Default page size, chosen to match common OS page sizes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Default ceiling on WAL growth before a checkpoint is forced.
pub const DEFAULT_MAX_WAL_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// `fsync`/`msync` on every commit. Safe against power loss, slowest.
    Full,
    /// Flush to the OS page cache but do not force to disk. Safe against
    /// process crashes, not against power loss.
    Normal,
    /// Never flush explicitly; rely on the OS to write pages back
    /// eventually. Fastest, least durable.
    Off,
}

/// Options controlling how a database is opened.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub page_size: u32,
    pub max_wal_size: u64,
    pub comparator: Comparator,
    pub read_only: bool,
    pub sync: SyncMode,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            page_size: DEFAULT_PAGE_SIZE,
            max_wal_size: DEFAULT_MAX_WAL_SIZE,
            comparator: lexicographic,
            read_only: false,
            sync: SyncMode::Full,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<(), InvalidArgumentError> {
        if !self.page_size.is_power_of_two() {
            return Err(InvalidArgumentError::PageSizeNotPowerOfTwo(self.page_size));
        }
        if self.page_size < MIN_PAGE_SIZE {
            return Err(InvalidArgumentError::PageSizeTooSmall(self.page_size));
        }
        Ok(())
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn max_wal_size(mut self, max_wal_size: u64) -> Self {
        self.max_wal_size = max_wal_size;
        self
    }

    pub fn sync(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        assert!(Options::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let opts = Options::default().page_size(1000);
        assert!(matches!(
            opts.validate(),
            Err(InvalidArgumentError::PageSizeNotPowerOfTwo(1000))
        ));
    }

    #[test]
    fn rejects_too_small_page_size() {
        let opts = Options::default().page_size(256);
        assert!(matches!(
            opts.validate(),
            Err(InvalidArgumentError::PageSizeTooSmall(256))
        ));
    }
}
