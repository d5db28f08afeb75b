//! cowkv: embedded single-file transactional key-value store.
//!
//! - Copy-on-write B-tree over fixed-size pages, one tree per table
//! - Optimistic transactions: commit swaps the root pointer, losers get `Conflict`
//! - Event WAL (text events in CRC-framed records) replayed on open
//! - Freed pages recycled through a persisted free list and a lock-free allocator

pub mod btree;
pub mod config;
pub mod error;
pub mod schema;
pub mod storage;
pub mod tx;
pub mod wal;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

pub use crate::btree::cursor::{Scanner, SeekStrategy};
pub use crate::config::{Config, RecoveryMode};
pub use crate::error::{KvError, Result};
pub use crate::tx::transaction::{Transaction, TxState};
pub use crate::wal::event::Event;

use crate::storage::allocator::PageAllocator;
use crate::storage::backend::{FileStorage, MemoryStorage, Storage};
use crate::storage::meta::MetaPage;
use crate::storage::page_manager::{PageManager, SharedStorage};
use crate::storage::PageId;
use crate::tx::snapshot::SnapshotRegistry;
use crate::wal::reader::WalReader;
use crate::wal::recovery;
use crate::wal::writer::WalWriter;

/// State that only a committing transaction may touch.
pub(crate) struct CommitState {
    /// Master page as last written.
    pub(crate) meta: MetaPage,
    pub(crate) wal: WalWriter,
    /// Pages holding the persisted free list of `meta`; neither free nor
    /// reachable from the catalog.
    pub(crate) list_pages: Vec<PageId>,
    /// Set once open has finished; a failed open leaves the store as it was.
    pub(crate) opened: bool,
}

/// State shared by the database handle and all of its transactions.
pub(crate) struct DbShared {
    pub(crate) config: Config,
    pub(crate) storage: SharedStorage,
    pub(crate) allocator: Arc<PageAllocator>,
    /// Committed catalog root. Only changed by compare-and-swap at commit.
    pub(crate) root: AtomicU64,
    pub(crate) next_txid: AtomicU64,
    pub(crate) commit: Mutex<CommitState>,
    /// Lock order: `commit` before `snapshots`.
    pub(crate) snapshots: Mutex<SnapshotRegistry>,
}

/// Point-in-time counters, mostly for tests and tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbStats {
    pub root: PageId,
    pub version: u64,
    pub applied_txid: u64,
    /// Next page number the allocator would hand out when its pool is empty.
    pub page_count: u64,
    /// Page numbers waiting in the allocator pool.
    pub free_pages: usize,
    /// Released pages that open transactions may still read.
    pub pending_pages: usize,
    pub wal_bytes: u64,
}

/// Main database handle. Cheap to clone; clones share one store.
#[derive(Clone)]
pub struct Database {
    shared: Arc<DbShared>,
}

/// The WAL lives next to the data file: `data.db` -> `data.wal`.
pub fn wal_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("wal")
}

impl Database {
    /// Create a new database file; fails if `path` already exists.
    pub fn create(path: &Path, config: Config) -> Result<Self> {
        if path.exists() {
            return Err(KvError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }
        Self::open(path, config)
    }

    /// Open a database file, creating it if missing, and recover any
    /// committed transactions the master page does not reflect yet.
    pub fn open(path: &Path, config: Config) -> Result<Self> {
        config.validate()?;
        let storage = FileStorage::open(path)?;
        let wal = WalWriter::open(&wal_path(path), config.sync_wal)?;
        info!(path = %path.display(), "opening database");
        Self::with_storage(Box::new(storage), wal, config)
    }

    /// A database that lives only as long as this handle.
    pub fn open_in_memory(config: Config) -> Result<Self> {
        Self::with_storage(Box::new(MemoryStorage::new()), WalWriter::in_memory(), config)
    }

    pub(crate) fn with_storage(
        mut storage: Box<dyn Storage>,
        mut wal: WalWriter,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;

        let contents = WalReader::from_bytes(wal.contents()?, config.recovery_mode).read_all()?;
        if contents.discarded > 0 {
            wal.rewind(contents.valid_len)?;
        }

        let meta = if storage.size() == 0 {
            let meta = MetaPage::new(config.page_size);
            storage.increase_size(config.page_size as u64 * config.growth_pages)?;
            storage.flush_memory_block(&meta.serialize(), 0)?;
            storage.sync()?;
            info!(page_size = config.page_size, "initialized new store");
            meta
        } else {
            let meta = PageManager::read_meta(storage.as_ref())?;
            if meta.page_size as usize != config.page_size {
                return Err(KvError::Config(format!(
                    "store uses {} byte pages, configured for {}",
                    meta.page_size, config.page_size
                )));
            }
            meta
        };

        let max_logged_txid = contents
            .events
            .iter()
            .filter_map(|e| match e {
                Event::StartTransaction { txid } => Some(*txid),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        let next_txid = meta.next_txid.max(max_logged_txid + 1);

        let shared = Arc::new(DbShared {
            storage: Arc::new(RwLock::new(storage)),
            allocator: Arc::new(PageAllocator::new(meta.page_count)),
            root: AtomicU64::new(meta.root),
            next_txid: AtomicU64::new(next_txid),
            commit: Mutex::new(CommitState {
                meta,
                wal,
                list_pages: Vec::new(),
                opened: false,
            }),
            snapshots: Mutex::new(SnapshotRegistry::new(meta.version)),
            config,
        });
        let db = Database { shared };
        db.load_free_list()?;
        db.recover(contents.events)?;
        db.shared.commit.lock().opened = true;
        Ok(db)
    }

    fn page_manager(&self) -> PageManager {
        PageManager::new(
            Arc::clone(&self.shared.storage),
            Arc::clone(&self.shared.allocator),
            self.shared.config.page_size,
            self.shared.config.growth_pages,
        )
    }

    /// Hand the persisted free list to the allocator. The chain stays valid
    /// on disk until the next commit replaces it.
    fn load_free_list(&self) -> Result<()> {
        let mut guard = self.shared.commit.lock();
        if guard.meta.freelist_head == 0 {
            return Ok(());
        }
        let list = self.page_manager().read_free_list(guard.meta.freelist_head)?;
        list.validate(guard.meta.page_count)
            .map_err(KvError::Corruption)?;
        if list.len() as u64 != guard.meta.freelist_total {
            return Err(KvError::Corruption(format!(
                "free list holds {} pages, master page says {}",
                list.len(),
                guard.meta.freelist_total
            )));
        }

        self.shared.allocator.free(&list.free_pages);
        info!(
            free_pages = list.len(),
            list_pages = list.list_pages.len(),
            "loaded persisted free list"
        );
        guard.list_pages = list.list_pages;
        Ok(())
    }

    /// Re-apply WAL transactions newer than the master page in a single
    /// transaction. On failure nothing is applied and the error is returned.
    fn recover(&self, events: Vec<Event>) -> Result<()> {
        let applied_txid = self.shared.commit.lock().meta.applied_txid;
        let pending = recovery::pending(recovery::committed_transactions(events)?, applied_txid);
        if pending.is_empty() {
            return Ok(());
        }

        let mut tx = Transaction::begin_recovery(Arc::clone(&self.shared));
        let mut applied = 0;
        for committed in &pending {
            applied += recovery::apply_events(&mut tx, &committed.events)?;
        }
        tx.commit()?;
        info!(
            transactions = pending.len(),
            events = applied,
            "recovered transactions from WAL"
        );
        Ok(())
    }

    pub fn begin(&self) -> Transaction {
        Transaction::begin(Arc::clone(&self.shared))
    }

    /// Apply `events` in a new transaction and commit it. Entry events must
    /// match the current state; the first mismatch fails with
    /// `KvError::Replay` and nothing is applied.
    pub fn replay(&self, events: &[Event]) -> Result<()> {
        let mut tx = self.begin();
        recovery::apply_events(&mut tx, events)?;
        tx.commit()
    }

    /// Drop the WAL frames. Every commit writes its master page before it
    /// returns, so the log is only needed for commits still in flight, and
    /// those are excluded by the commit lock.
    pub fn checkpoint(&self) -> Result<()> {
        let mut guard = self.shared.commit.lock();
        let dropped = guard.wal.len();
        guard.wal.truncate()?;
        info!(
            version = guard.meta.version,
            wal_bytes = dropped,
            "checkpoint: WAL truncated"
        );
        Ok(())
    }

    /// Every event currently in the WAL.
    pub fn read_wal(&self) -> Result<Vec<Event>> {
        let data = self.shared.commit.lock().wal.contents()?;
        Ok(WalReader::from_bytes(data, self.shared.config.recovery_mode)
            .read_all()?
            .events)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Root of the committed catalog tree.
    pub fn root_page_id(&self) -> PageId {
        self.shared.root.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> DbStats {
        let guard = self.shared.commit.lock();
        DbStats {
            root: self.root_page_id(),
            version: guard.meta.version,
            applied_txid: guard.meta.applied_txid,
            page_count: self.shared.allocator.next_page(),
            free_pages: self.shared.allocator.free_count(),
            pending_pages: self.shared.snapshots.lock().pending_count(),
            wal_bytes: guard.wal.len(),
        }
    }
}

impl DbShared {
    /// Rewrite the free list when the pool holds pages it does not list,
    /// such as pages returned by rollbacks since the last commit.
    fn persist_free_pool(&mut self) -> Result<()> {
        let mut pm = PageManager::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.allocator),
            self.config.page_size,
            self.config.growth_pages,
        );
        let pending: Vec<PageId> = self.snapshots.get_mut().pending_pages().collect();
        let state = self.commit.get_mut();
        if !state.opened {
            return Ok(());
        }

        let mut persisted = if state.meta.freelist_head == 0 {
            Vec::new()
        } else {
            pm.read_free_list(state.meta.freelist_head)?.free_pages
        };
        persisted.sort_unstable();
        let mut current = self.allocator.snapshot();
        current.extend_from_slice(&pending);
        current.sort_unstable();
        if current == persisted {
            return Ok(());
        }

        let mut free = pending;
        free.extend_from_slice(&state.list_pages);
        let (freelist_head, freelist_total, list_pages) = pm.persist_free_list(&free);
        pm.save_pages()?;
        let meta = MetaPage {
            page_count: self.allocator.next_page(),
            freelist_head,
            freelist_total,
            ..state.meta
        };
        pm.write_meta(&meta)?;
        state.meta = meta;
        state.list_pages = list_pages;
        info!(free_pages = freelist_total, "persisted free pages on close");
        Ok(())
    }
}

impl Drop for DbShared {
    fn drop(&mut self) {
        if let Err(e) = self.persist_free_pool() {
            warn!(error = %e, "could not persist free pages on close");
        }
    }
}
