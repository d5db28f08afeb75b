use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{debug, warn};

use crate::btree::cursor::Scanner;
use crate::btree::ops::BTree;
use crate::error::{KvError, Result};
use crate::schema::catalog::Catalog;
use crate::storage::meta::MetaPage;
use crate::storage::page_manager::PageManager;
use crate::storage::PageId;
use crate::wal::event::{Event, TxId};
use crate::{CommitState, DbShared};

/// Transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Aborted,
}

/// A snapshot of the database plus the copy-on-write changes made on top of
/// it. Nothing is visible to other transactions until `commit` swaps the
/// root pointer; dropping an active transaction rolls it back.
pub struct Transaction {
    shared: Arc<DbShared>,
    txid: TxId,
    state: TxState,
    snapshot_root: PageId,
    /// Commit version the snapshot was taken at; pinned until the
    /// transaction ends so pages it can reach are not recycled.
    snapshot_version: u64,
    pm: PageManager,
    catalog: Catalog,
    /// Tables touched by this transaction with their current (unflushed) roots.
    tables: HashMap<String, BTree>,
    events: Vec<Event>,
    /// Recovery replays events that are already in the WAL.
    log_events: bool,
}

impl Transaction {
    pub(crate) fn begin(shared: Arc<DbShared>) -> Self {
        let txid = shared.next_txid.fetch_add(1, Ordering::SeqCst);
        let (snapshot_root, snapshot_version) = {
            let mut snapshots = shared.snapshots.lock();
            (shared.root.load(Ordering::Acquire), snapshots.register())
        };
        let pm = PageManager::new(
            Arc::clone(&shared.storage),
            Arc::clone(&shared.allocator),
            shared.config.page_size,
            shared.config.growth_pages,
        );
        Transaction {
            shared,
            txid,
            state: TxState::Active,
            snapshot_root,
            snapshot_version,
            pm,
            catalog: Catalog::open(snapshot_root),
            tables: HashMap::new(),
            events: Vec::new(),
            log_events: true,
        }
    }

    /// A transaction that applies already-logged events: it records nothing
    /// and its commit writes pages and the master page but not the WAL.
    pub(crate) fn begin_recovery(shared: Arc<DbShared>) -> Self {
        let mut tx = Self::begin(shared);
        tx.log_events = false;
        tx
    }

    pub fn txid(&self) -> TxId {
        self.txid
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Catalog root this transaction started from.
    pub fn snapshot_root(&self) -> PageId {
        self.snapshot_root
    }

    /// Events recorded so far, in operation order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TxState::Active => Ok(()),
            state => Err(KvError::Transaction(format!(
                "transaction {} is {:?}",
                self.txid, state
            ))),
        }
    }

    fn record(&mut self, event: Event) {
        if self.log_events {
            self.events.push(event);
        }
    }

    fn table(&self, name: &str) -> Result<BTree> {
        if let Some(tree) = self.tables.get(name) {
            return Ok(*tree);
        }
        self.catalog
            .get_table(&self.pm, name)?
            .ok_or_else(|| KvError::TableNotFound(name.to_string()))
    }

    pub fn create_table(&mut self, name: &str) -> Result<()> {
        self.ensure_active()?;
        self.shared.config.check_key(name.as_bytes())?;
        self.catalog.create_table(&mut self.pm, name)?;
        self.tables.insert(name.to_string(), BTree::new());
        self.record(Event::CreateTable {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Drop a table and free all of its pages.
    pub fn delete_table(&mut self, name: &str) -> Result<()> {
        self.ensure_active()?;
        let mut tree = self.table(name)?;
        self.catalog.delete_table(&mut self.pm, name)?;
        tree.free_all(&mut self.pm)?;
        self.tables.remove(name);
        self.record(Event::DeleteTable {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        self.ensure_active()?;
        self.catalog.list_tables(&self.pm)
    }

    pub fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        self.table(table)?.get(&self.pm, key)
    }

    /// Insert a new entry; fails with `DuplicateKey` if `key` exists.
    pub fn insert(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.shared.config.check_entry(key, value)?;
        let mut tree = self.table(table)?;
        if tree.get(&self.pm, key)?.is_some() {
            return Err(KvError::DuplicateKey(table.to_string()));
        }
        tree.set(&mut self.pm, key, value)?;
        self.tables.insert(table.to_string(), tree);
        self.record(Event::InsertEntry {
            table: table.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Replace the value of an existing entry; returns the old value.
    pub fn update(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
        self.ensure_active()?;
        self.shared.config.check_entry(key, value)?;
        let mut tree = self.table(table)?;
        if tree.get(&self.pm, key)?.is_none() {
            return Err(KvError::KeyNotFound(table.to_string()));
        }
        let old = tree
            .set(&mut self.pm, key, value)?
            .ok_or_else(|| KvError::KeyNotFound(table.to_string()))?;
        self.tables.insert(table.to_string(), tree);
        self.record(Event::UpdateEntry {
            table: table.to_string(),
            key: key.to_vec(),
            old_value: old.clone(),
            new_value: value.to_vec(),
        });
        Ok(old)
    }

    /// Insert or update. Logged as whichever of the two happened.
    pub fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        self.shared.config.check_entry(key, value)?;
        let mut tree = self.table(table)?;
        let old = tree.set(&mut self.pm, key, value)?;
        self.tables.insert(table.to_string(), tree);
        let event = match &old {
            Some(old_value) => Event::UpdateEntry {
                table: table.to_string(),
                key: key.to_vec(),
                old_value: old_value.clone(),
                new_value: value.to_vec(),
            },
            None => Event::InsertEntry {
                table: table.to_string(),
                key: key.to_vec(),
                value: value.to_vec(),
            },
        };
        self.record(event);
        Ok(old)
    }

    /// Remove an entry; returns the removed value. A missing key changes
    /// nothing and records no event.
    pub fn delete(&mut self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        let mut tree = self.table(table)?;
        let old = tree.delete(&mut self.pm, key)?;
        if let Some(old_value) = &old {
            self.tables.insert(table.to_string(), tree);
            self.record(Event::DeleteEntry {
                table: table.to_string(),
                key: key.to_vec(),
                old_value: old_value.clone(),
            });
        }
        Ok(old)
    }

    /// Ordered scan over the table as this transaction sees it.
    pub fn scanner(&self, table: &str) -> Result<Scanner<'_, PageManager>> {
        self.ensure_active()?;
        let tree = self.table(table)?;
        Ok(Scanner::new(&self.pm, tree.root_page_id()))
    }

    /// Make this transaction's changes durable and visible.
    ///
    /// A transaction that recorded no events commits as a no-op. Otherwise
    /// the events are appended to the WAL, the staged pages and the master
    /// page are written, and the root pointer is swapped. If the root moved
    /// since `begin`, the transaction is rolled back and `Conflict` returned;
    /// retry from a new transaction. A failure or panic while writing undoes
    /// the WAL append.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.log_events && self.events.is_empty() {
            self.pm.rollback();
            self.state = TxState::Committed;
            self.close_snapshot();
            debug!(txid = self.txid, "empty transaction committed");
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let mut guard = WalRewindGuard::new(shared.commit.lock());
        let current = shared.root.load(Ordering::Acquire);
        if current != self.snapshot_root {
            guard.disarm();
            drop(guard);
            warn!(
                txid = self.txid,
                expected = self.snapshot_root,
                actual = current,
                "commit conflict"
            );
            self.abort();
            return Err(KvError::Conflict {
                expected: self.snapshot_root,
                actual: current,
            });
        }

        match self.write_commit(&mut guard.state) {
            Ok((meta, list_pages)) => {
                guard.disarm();
                // Pages move to the pool before the commit lock is released,
                // so the next commit's free list still covers them.
                let released = self.pm.released_pages();
                {
                    let mut snapshots = shared.snapshots.lock();
                    if shared
                        .root
                        .compare_exchange(
                            self.snapshot_root,
                            meta.root,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        panic!("BUG: root pointer moved while the commit lock was held");
                    }
                    shared
                        .allocator
                        .free(&snapshots.publish(meta.version, released));
                }
                guard.state.meta = meta;
                let old_list_pages = std::mem::replace(&mut guard.state.list_pages, list_pages);
                shared.allocator.free(&old_list_pages);
                self.pm.finish_commit();
                drop(guard);

                self.tables.clear();
                self.state = TxState::Committed;
                self.close_snapshot();
                debug!(
                    txid = self.txid,
                    root = meta.root,
                    version = meta.version,
                    events = self.events.len(),
                    "transaction committed"
                );
                Ok(())
            }
            Err(e) => {
                drop(guard);
                warn!(txid = self.txid, error = %e, "commit failed, rolling back");
                self.abort();
                Err(e)
            }
        }
    }

    /// Everything between the conflict check and the root swap. Returns the
    /// master page that is now durable and the list pages of its free list.
    fn write_commit(&mut self, state: &mut CommitState) -> Result<(MetaPage, Vec<PageId>)> {
        let mut names: Vec<&String> = self.tables.keys().collect();
        names.sort();
        for name in names {
            let root = self.tables[name].root_page_id();
            self.catalog.set_table_root(&mut self.pm, name, root)?;
        }

        let released = self.pm.released_pages();
        let mut free = released.clone();
        free.extend(self.shared.snapshots.lock().pending_pages());
        free.extend_from_slice(&state.list_pages);
        let (freelist_head, freelist_total, list_pages) = self.pm.persist_free_list(&free);

        if self.log_events {
            let mut frames = Vec::with_capacity(self.events.len() + 3);
            frames.push(Event::StartTransaction { txid: self.txid });
            frames.extend(self.events.iter().cloned());
            frames.push(Event::FreePages { pages: released });
            frames.push(Event::CommitTransaction { txid: self.txid });
            state.wal.append_all(&frames)?;
        }

        self.pm.save_pages()?;

        let meta = MetaPage {
            page_count: self.shared.allocator.next_page(),
            freelist_head,
            root: self.catalog.root_page_id(),
            version: state.meta.version + 1,
            next_txid: self.shared.next_txid.load(Ordering::SeqCst),
            applied_txid: self.txid,
            freelist_total,
            page_size: state.meta.page_size,
        };
        self.pm.write_meta(&meta)?;
        Ok((meta, list_pages))
    }

    fn abort(&mut self) {
        self.pm.rollback();
        self.tables.clear();
        self.state = TxState::Aborted;
        self.close_snapshot();
    }

    /// Unpin the snapshot and recycle pages no open transaction can reach.
    /// Called exactly once, when the state leaves `Active`.
    fn close_snapshot(&mut self) {
        let mut snapshots = self.shared.snapshots.lock();
        let reclaimable = snapshots.release(self.snapshot_version);
        self.shared.allocator.free(&reclaimable);
    }

    /// Discard every change. Calling it again, or after commit, does nothing.
    pub fn rollback(&mut self) {
        if self.state == TxState::Active {
            self.abort();
            debug!(txid = self.txid, "transaction rolled back");
        }
    }
}

/// Holds the commit lock and cuts the WAL back to where it was when the
/// lock was taken, unless the commit reached its master page write.
struct WalRewindGuard<'a> {
    state: MutexGuard<'a, CommitState>,
    mark: u64,
    armed: bool,
}

impl<'a> WalRewindGuard<'a> {
    fn new(state: MutexGuard<'a, CommitState>) -> Self {
        let mark = state.wal.len();
        WalRewindGuard {
            state,
            mark,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WalRewindGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Also clears a partially written frame the writer never counted.
        if let Err(e) = self.state.wal.rewind(self.mark) {
            warn!(error = %e, "WAL rewind failed");
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            self.abort();
            debug!(txid = self.txid, "active transaction dropped, rolled back");
        }
    }
}
