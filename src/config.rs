/// Engine configuration.
///
/// All limits are checked once by `validate()` when a database is opened; the
/// B-tree relies on them to guarantee that any two entries fit in one page,
/// which bounds a split to at most three nodes.
use crate::btree::node::{HEADER_SIZE, INTERNAL_ENTRY_OVERHEAD, LEAF_ENTRY_OVERHEAD};
use crate::error::{KvError, Result};

pub const DEFAULT_PAGE_SIZE: usize = 16384;
pub const MIN_PAGE_SIZE: usize = 4096;
/// Node offsets are u16 and transient nodes may reach three pages.
pub const MAX_PAGE_SIZE: usize = 16384;

/// How recovery treats a WAL frame that fails length or checksum validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    /// A damaged frame with valid frames after it aborts recovery.
    #[default]
    Strict,
    /// Mid-log damage ends the readable log there, with a warning.
    Permissive,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub page_size: usize,
    pub max_key_size: usize,
    pub max_value_size: usize,
    /// Minimum number of pages added whenever the store has to grow.
    pub growth_pages: u64,
    pub recovery_mode: RecoveryMode,
    /// fsync the WAL on every commit.
    pub sync_wal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            page_size: DEFAULT_PAGE_SIZE,
            max_key_size: 1024,
            max_value_size: 4096,
            growth_pages: 64,
            recovery_mode: RecoveryMode::Strict,
            sync_wal: true,
        }
    }
}

impl Config {
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn max_key_size(mut self, len: usize) -> Self {
        self.max_key_size = len;
        self
    }

    pub fn max_value_size(mut self, len: usize) -> Self {
        self.max_value_size = len;
        self
    }

    pub fn growth_pages(mut self, pages: u64) -> Self {
        self.growth_pages = pages;
        self
    }

    pub fn recovery_mode(mut self, mode: RecoveryMode) -> Self {
        self.recovery_mode = mode;
        self
    }

    pub fn sync_wal(mut self, sync: bool) -> Self {
        self.sync_wal = sync;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(KvError::Config(format!(
                "page_size must be a power of two in {}..={}, got {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.page_size
            )));
        }
        if self.max_key_size == 0 || self.max_key_size > u16::MAX as usize {
            return Err(KvError::Config(format!(
                "max_key_size must be in 1..={}, got {}",
                u16::MAX,
                self.max_key_size
            )));
        }
        if self.max_value_size > u16::MAX as usize {
            return Err(KvError::Config(format!(
                "max_value_size must be at most {}, got {}",
                u16::MAX,
                self.max_value_size
            )));
        }
        let half = (self.page_size - HEADER_SIZE) / 2;
        let leaf_entry = LEAF_ENTRY_OVERHEAD + self.max_key_size + self.max_value_size;
        if leaf_entry > half {
            return Err(KvError::Config(format!(
                "a maximal leaf entry ({} bytes) must fit twice in a {} byte page",
                leaf_entry, self.page_size
            )));
        }
        if INTERNAL_ENTRY_OVERHEAD + self.max_key_size > half {
            return Err(KvError::Config(format!(
                "max_key_size {} too large for a {} byte page",
                self.max_key_size, self.page_size
            )));
        }
        if self.growth_pages == 0 {
            return Err(KvError::Config("growth_pages must be at least 1".into()));
        }
        Ok(())
    }

    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.max_key_size {
            return Err(KvError::SizeLimitExceeded {
                what: "key",
                len: key.len(),
                limit: self.max_key_size,
            });
        }
        Ok(())
    }

    pub(crate) fn check_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        if value.len() > self.max_value_size {
            return Err(KvError::SizeLimitExceeded {
                what: "value",
                len: value.len(),
                limit: self.max_value_size,
            });
        }
        Ok(())
    }
}
