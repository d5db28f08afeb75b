/// Per-transaction page manager: copy-on-write staging over shared storage.
///
/// Page sets tracked for the owning transaction:
///   - `allocated`: numbers drawn from the shared allocator by this transaction.
///   - `available`: members of `allocated` freed again; reusable right away.
///   - `released`: pre-existing pages freed by this transaction; they are
///     still reachable from older snapshots and only become reusable once the
///     commit is durable and every such snapshot is closed.
///
/// Staged pages are owned by this manager and never visible to other
/// transactions until `save_pages` writes them out at commit.
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{KvError, Result};
use crate::storage::allocator::PageAllocator;
use crate::storage::backend::Storage;
use crate::storage::freelist::{self, FreeList};
use crate::storage::meta::{MetaPage, META_SIZE};
use crate::storage::page_store::PageStore;
use crate::storage::PageId;

pub type SharedStorage = Arc<RwLock<Box<dyn Storage>>>;

pub struct PageManager {
    storage: SharedStorage,
    allocator: Arc<PageAllocator>,
    page_size: usize,
    growth_pages: u64,
    allocated: BTreeSet<PageId>,
    available: Vec<PageId>,
    released: BTreeSet<PageId>,
    staged: HashMap<PageId, Vec<u8>>,
}

impl PageManager {
    pub fn new(
        storage: SharedStorage,
        allocator: Arc<PageAllocator>,
        page_size: usize,
        growth_pages: u64,
    ) -> Self {
        PageManager {
            storage,
            allocator,
            page_size,
            growth_pages,
            allocated: BTreeSet::new(),
            available: Vec::new(),
            released: BTreeSet::new(),
            staged: HashMap::new(),
        }
    }

    fn allocate_id(&mut self) -> PageId {
        if let Some(id) = self.available.pop() {
            return id;
        }
        let id = self.allocator.get();
        self.allocated.insert(id);
        id
    }

    /// Pre-existing pages freed by this transaction, in ascending order.
    pub fn released_pages(&self) -> Vec<PageId> {
        self.released.iter().copied().collect()
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    /// Stage a fresh free-list chain. It lists `free`, every number in the
    /// allocator pool and this transaction's unused allocations; the list
    /// pages themselves are drawn from that same set. Returns
    /// `(head, total, list_pages)`, or `(0, 0, [])` when nothing is free.
    pub fn persist_free_list(&mut self, free: &[PageId]) -> (PageId, u64, Vec<PageId>) {
        let mut ids: BTreeSet<PageId> = free.iter().copied().collect();
        ids.extend(self.allocator.snapshot());
        ids.extend(self.available.iter().copied());
        if ids.is_empty() {
            return (0, 0, Vec::new());
        }
        let pages_needed = ids.len().div_ceil(freelist::entries_per_page(self.page_size));
        let list_pages: Vec<PageId> = (0..pages_needed).map(|_| self.allocate_id()).collect();
        for pid in &list_pages {
            ids.remove(pid);
        }
        let ids: Vec<PageId> = ids.into_iter().collect();

        let mut head = (0, 0);
        for (pid, page) in freelist::build_chain(&ids, &list_pages, self.page_size) {
            head = (pid, page.cumulative_total);
            self.staged.insert(pid, page.serialize(self.page_size));
        }
        (head.0, head.1, list_pages)
    }

    /// Read a persisted free-list chain.
    pub fn read_free_list(&self, head: PageId) -> Result<FreeList> {
        FreeList::read_chain(head, |pid| self.read_page(pid))
    }

    /// Write every staged page to storage, growing it first when needed.
    pub fn save_pages(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let page_size = self.page_size as u64;
        let max_id = self.staged.keys().copied().max().unwrap_or(0);
        let needed = (max_id + 1) * page_size;

        let mut storage = self.storage.write();
        let current = storage.size();
        if current < needed {
            let grown = current + self.growth_pages * page_size;
            storage.increase_size(needed.max(grown))?;
        }

        let mut ids: Vec<PageId> = self.staged.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            storage.flush_memory_block(&self.staged[&id], id * page_size)?;
        }
        drop(storage);

        self.staged.clear();
        Ok(())
    }

    /// Hand this transaction's unused allocations back to the allocator after
    /// a successful commit.
    pub fn finish_commit(&mut self) {
        self.allocator.free(&self.available);
        self.available.clear();
        self.allocated.clear();
        self.released.clear();
        self.staged.clear();
    }

    /// Discard staging and return every page drawn by this transaction.
    pub fn rollback(&mut self) {
        let allocated: Vec<PageId> = self.allocated.iter().copied().collect();
        self.allocator.free(&allocated);
        self.allocated.clear();
        self.available.clear();
        self.released.clear();
        self.staged.clear();
    }

    pub fn read_meta(storage: &dyn Storage) -> Result<MetaPage> {
        if storage.size() < META_SIZE as u64 {
            return Err(KvError::Corruption("store too small for master page".into()));
        }
        MetaPage::deserialize(storage.memory_block(META_SIZE, 0))
    }

    /// Durably write the master page.
    pub fn write_meta(&self, meta: &MetaPage) -> Result<()> {
        let mut storage = self.storage.write();
        storage.flush_memory_block(&meta.serialize(), 0)?;
        storage.sync()
    }
}

impl PageStore for PageManager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        if let Some(data) = self.staged.get(&page_id) {
            return Ok(data.clone());
        }
        let storage = self.storage.read();
        let offset = page_id * self.page_size as u64;
        if page_id == 0 || offset + self.page_size as u64 > storage.size() {
            return Err(KvError::InvalidPage(page_id));
        }
        Ok(storage.memory_block(self.page_size, offset).to_vec())
    }

    fn create_page(&mut self, data: Vec<u8>) -> Result<PageId> {
        assert_eq!(
            data.len(),
            self.page_size,
            "BUG: staged page must be exactly one page"
        );
        let id = self.allocate_id();
        self.staged.insert(id, data);
        Ok(id)
    }

    fn free_page(&mut self, page_id: PageId) {
        self.staged.remove(&page_id);
        if self.allocated.contains(&page_id) {
            debug_assert!(
                !self.available.contains(&page_id),
                "double-free detected: page {} is already available",
                page_id
            );
            self.available.push(page_id);
        } else {
            let fresh = self.released.insert(page_id);
            debug_assert!(fresh, "double-free detected: page {} already released", page_id);
        }
    }
}
