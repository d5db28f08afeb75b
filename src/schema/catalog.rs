/// Table catalog.
///
/// The catalog is itself a B-tree whose root is the database root pointer:
///   <table name bytes> -> table B-tree root (u64 LE, 0 for an empty table)
///
/// Table trees are opened through the catalog and their new roots written
/// back when a transaction flushes.
use crate::btree::cursor::Scanner;
use crate::btree::ops::BTree;
use crate::error::{KvError, Result};
use crate::storage::page_store::PageStore;
use crate::storage::PageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Catalog {
    tree: BTree,
}

fn encode_root(root: PageId) -> [u8; 8] {
    root.to_le_bytes()
}

fn decode_root(name: &str, data: &[u8]) -> Result<PageId> {
    let bytes: [u8; 8] = data.try_into().map_err(|_| {
        KvError::Corruption(format!(
            "catalog entry for table {:?} is {} bytes, expected 8",
            name,
            data.len()
        ))
    })?;
    Ok(PageId::from_le_bytes(bytes))
}

impl Catalog {
    pub fn open(root: PageId) -> Self {
        Catalog {
            tree: BTree::open(root),
        }
    }

    pub fn root_page_id(&self) -> PageId {
        self.tree.root_page_id()
    }

    /// The table's tree, or `None` if no such table exists.
    pub fn get_table<S: PageStore + ?Sized>(&self, store: &S, name: &str) -> Result<Option<BTree>> {
        match self.tree.get(store, name.as_bytes())? {
            Some(data) => Ok(Some(BTree::open(decode_root(name, &data)?))),
            None => Ok(None),
        }
    }

    /// Register an empty table.
    pub fn create_table<S: PageStore + ?Sized>(&mut self, store: &mut S, name: &str) -> Result<()> {
        if self.tree.get(store, name.as_bytes())?.is_some() {
            return Err(KvError::TableExists(name.to_string()));
        }
        self.tree.set(store, name.as_bytes(), &encode_root(0))?;
        Ok(())
    }

    /// Record a new root for an existing table.
    pub fn set_table_root<S: PageStore + ?Sized>(
        &mut self,
        store: &mut S,
        name: &str,
        root: PageId,
    ) -> Result<()> {
        match self.tree.get(store, name.as_bytes())? {
            None => Err(KvError::TableNotFound(name.to_string())),
            Some(data) if decode_root(name, &data)? == root => Ok(()),
            Some(_) => {
                self.tree.set(store, name.as_bytes(), &encode_root(root))?;
                Ok(())
            }
        }
    }

    /// Unregister a table and return its tree so the caller can free it.
    pub fn delete_table<S: PageStore + ?Sized>(&mut self, store: &mut S, name: &str) -> Result<BTree> {
        match self.tree.delete(store, name.as_bytes())? {
            Some(data) => Ok(BTree::open(decode_root(name, &data)?)),
            None => Err(KvError::TableNotFound(name.to_string())),
        }
    }

    /// All table names in byte order.
    pub fn list_tables<S: PageStore + ?Sized>(&self, store: &S) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in Scanner::new(store, self.tree.root_page_id()) {
            let (key, _) = entry?;
            let name = String::from_utf8(key)
                .map_err(|_| KvError::Corruption("catalog key is not valid UTF-8".into()))?;
            names.push(name);
        }
        Ok(names)
    }

    /// Every page of the catalog tree and of all table trees.
    pub fn collect_pages<S: PageStore + ?Sized>(&self, store: &S) -> Result<Vec<PageId>> {
        let mut pages = self.tree.collect_pages(store)?;
        for name in self.list_tables(store)? {
            if let Some(table) = self.get_table(store, &name)? {
                pages.extend(table.collect_pages(store)?);
            }
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::allocator::PageAllocator;
    use crate::storage::backend::{MemoryStorage, Storage};
    use crate::storage::page_manager::PageManager;
    use parking_lot::RwLock;
    use std::sync::Arc;

    fn setup() -> PageManager {
        let storage = Arc::new(RwLock::new(Box::new(MemoryStorage::new()) as Box<dyn Storage>));
        PageManager::new(storage, Arc::new(PageAllocator::new(1)), 4096, 4)
    }

    #[test]
    fn test_create_and_get_table() {
        let mut store = setup();
        let mut catalog = Catalog::default();

        catalog.create_table(&mut store, "users").unwrap();
        let users = catalog.get_table(&store, "users").unwrap().unwrap();
        assert!(users.is_empty());
        assert!(catalog.get_table(&store, "nonexistent").unwrap().is_none());

        let err = catalog.create_table(&mut store, "users").unwrap_err();
        assert!(matches!(err, KvError::TableExists(name) if name == "users"));
    }

    #[test]
    fn test_set_table_root() {
        let mut store = setup();
        let mut catalog = Catalog::default();
        catalog.create_table(&mut store, "t").unwrap();

        let mut table = catalog.get_table(&store, "t").unwrap().unwrap();
        table.set(&mut store, b"k", b"v").unwrap();
        catalog
            .set_table_root(&mut store, "t", table.root_page_id())
            .unwrap();

        let reopened = catalog.get_table(&store, "t").unwrap().unwrap();
        assert_eq!(reopened, table);
        assert_eq!(reopened.get(&store, b"k").unwrap(), Some(b"v".to_vec()));

        let err = catalog.set_table_root(&mut store, "missing", 1).unwrap_err();
        assert!(matches!(err, KvError::TableNotFound(_)));
    }

    #[test]
    fn test_list_and_delete_tables() {
        let mut store = setup();
        let mut catalog = Catalog::default();
        for name in ["b", "a", "c"] {
            catalog.create_table(&mut store, name).unwrap();
        }
        assert_eq!(catalog.list_tables(&store).unwrap(), vec!["a", "b", "c"]);

        catalog.delete_table(&mut store, "b").unwrap();
        assert_eq!(catalog.list_tables(&store).unwrap(), vec!["a", "c"]);
        assert!(matches!(
            catalog.delete_table(&mut store, "b"),
            Err(KvError::TableNotFound(_))
        ));

        catalog.delete_table(&mut store, "a").unwrap();
        catalog.delete_table(&mut store, "c").unwrap();
        assert_eq!(catalog.root_page_id(), 0);
        assert!(catalog.list_tables(&store).unwrap().is_empty());
    }
}
