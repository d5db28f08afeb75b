/// Copy-on-write B-tree operations: get, set (with split), delete (with merge).
///
/// No node is edited after it has been written. Every operation rebuilds
/// the root-to-leaf path bottom-up from fresh nodes, stages each of them as a
/// new page through the `PageStore` and frees the page it replaces. Internal
/// entry keys are re-derived from each rebuilt child's first key, so an
/// internal key always equals the minimum key of its subtree.
use std::collections::HashSet;

use crate::btree::node::{
    Node, NodeType, HEADER_SIZE, INTERNAL_ENTRY_OVERHEAD, LEAF_ENTRY_OVERHEAD,
};
use crate::error::{KvError, Result};
use crate::storage::page_store::PageStore;
use crate::storage::PageId;

/// Maximum B-tree depth to prevent stack overflow on corrupted trees.
const MAX_BTREE_DEPTH: usize = 64;

/// A child smaller than this fraction of a page is a merge candidate.
const MERGE_THRESHOLD_DIVISOR: usize = 4;

pub(crate) fn read_node<S: PageStore + ?Sized>(store: &S, page_id: PageId) -> Result<Node> {
    Node::from_page(store.read_page(page_id)?, page_id)
}

fn depth_exceeded() -> KvError {
    KvError::Corruption("B-tree depth exceeds maximum (possible cycle)".into())
}

/// Largest key and value a tree over `page_size` pages can hold: any two
/// entries of a node must fit in one page.
pub fn check_entry_size(page_size: usize, key: &[u8], value: &[u8]) -> Result<()> {
    let half = (page_size - HEADER_SIZE) / 2;
    let key_limit = half - INTERNAL_ENTRY_OVERHEAD;
    if key.len() > key_limit {
        return Err(KvError::SizeLimitExceeded {
            what: "key",
            len: key.len(),
            limit: key_limit,
        });
    }
    let value_limit = half - LEAF_ENTRY_OVERHEAD - key.len();
    if value.len() > value_limit {
        return Err(KvError::SizeLimitExceeded {
            what: "value",
            len: value.len(),
            limit: value_limit,
        });
    }
    Ok(())
}

/// A persisted child: its first key and page.
type ChildRef = (Vec<u8>, PageId);

/// B-tree handle. Tracks the root page; `0` is the empty tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BTree {
    root_page_id: PageId,
}

impl BTree {
    /// An empty tree. No page is allocated until the first insert.
    pub fn new() -> Self {
        BTree { root_page_id: 0 }
    }

    /// Open an existing B-tree given the root page id.
    pub fn open(root_page_id: PageId) -> Self {
        BTree { root_page_id }
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id == 0
    }

    /// Look up `key`.
    pub fn get<S: PageStore + ?Sized>(&self, store: &S, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut page_id = self.root_page_id;
        if page_id == 0 {
            return Ok(None);
        }
        for _ in 0..=MAX_BTREE_DEPTH {
            let node = read_node(store, page_id)?;
            let pos = node.lookup_le(key);
            if node.is_leaf() {
                return Ok(match pos {
                    Some(pos) if node.key(pos) == key => Some(node.value(pos).to_vec()),
                    _ => None,
                });
            }
            match pos {
                Some(pos) => page_id = node.child(pos),
                // Smaller than the subtree minimum.
                None => return Ok(None),
            }
        }
        Err(depth_exceeded())
    }

    /// Insert or update `key`. Returns the previous value if the key existed.
    pub fn set<S: PageStore + ?Sized>(
        &mut self,
        store: &mut S,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        check_entry_size(store.page_size(), key, value)?;

        if self.root_page_id == 0 {
            let capacity = HEADER_SIZE + NodeType::Leaf.entry_size(key.len(), value.len());
            let mut leaf = Node::new(NodeType::Leaf, 1, capacity);
            leaf.append_leaf(0, key, value);
            self.install_root(store, leaf)?;
            return Ok(None);
        }

        let (node, old) = self.insert_into_page(store, self.root_page_id, key, value, 0)?;
        self.install_root(store, node)?;
        Ok(old)
    }

    /// Returns the rebuilt (unpersisted, possibly oversized) replacement of `page_id`.
    fn insert_into_page<S: PageStore + ?Sized>(
        &self,
        store: &mut S,
        page_id: PageId,
        key: &[u8],
        value: &[u8],
        depth: usize,
    ) -> Result<(Node, Option<Vec<u8>>)> {
        if depth > MAX_BTREE_DEPTH {
            return Err(depth_exceeded());
        }
        let node = read_node(store, page_id)?;

        let result = if node.is_leaf() {
            leaf_upsert(&node, key, value)
        } else {
            // A key below the minimum goes to the first child, whose key then changes.
            let pos = node.lookup_le(key).unwrap_or(0);
            let (child, old) =
                self.insert_into_page(store, node.child(pos), key, value, depth + 1)?;
            let parts = persist_split(store, child)?;
            (replace_children(&node, pos, 1, &parts), old)
        };

        store.free_page(page_id);
        Ok(result)
    }

    /// Delete `key`. Returns the removed value, or `None` (and leaves every
    /// page untouched) if the key was not present.
    pub fn delete<S: PageStore + ?Sized>(
        &mut self,
        store: &mut S,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        if self.root_page_id == 0 {
            return Ok(None);
        }
        let Some((node, old)) = self.delete_from_page(store, self.root_page_id, key, 0)? else {
            return Ok(None);
        };

        match node {
            None => self.root_page_id = 0,
            Some(node) if !node.is_leaf() && node.count() == 1 => {
                // Collapse: the single child becomes the new root.
                let mut root = node.child(0);
                for _ in 0..=MAX_BTREE_DEPTH {
                    let child = read_node(store, root)?;
                    if child.is_leaf() || child.count() > 1 {
                        break;
                    }
                    store.free_page(root);
                    root = child.child(0);
                }
                self.root_page_id = root;
            }
            Some(node) => self.install_root(store, node)?,
        }
        Ok(Some(old))
    }

    /// Returns `None` if the key is absent, else the replacement node
    /// (`None` when the node became empty) and the removed value.
    fn delete_from_page<S: PageStore + ?Sized>(
        &self,
        store: &mut S,
        page_id: PageId,
        key: &[u8],
        depth: usize,
    ) -> Result<Option<(Option<Node>, Vec<u8>)>> {
        if depth > MAX_BTREE_DEPTH {
            return Err(depth_exceeded());
        }
        let node = read_node(store, page_id)?;
        let Some(pos) = node.lookup_le(key) else {
            return Ok(None);
        };

        if node.is_leaf() {
            if node.key(pos) != key {
                return Ok(None);
            }
            let old = node.value(pos).to_vec();
            let n = node.count();
            let replacement = if n == 1 {
                None
            } else {
                let mut new_node = Node::new(NodeType::Leaf, n - 1, node.size());
                new_node.copy_range(&node, 0, 0, pos);
                new_node.copy_range(&node, pos + 1, pos, n - pos - 1);
                Some(new_node)
            };
            store.free_page(page_id);
            return Ok(Some((replacement, old)));
        }

        let Some((child, old)) = self.delete_from_page(store, node.child(pos), key, depth + 1)?
        else {
            return Ok(None);
        };

        let replacement = match child {
            None => remove_child(&node, pos),
            Some(child) => Some(self.rebalance(store, &node, pos, child)?),
        };
        store.free_page(page_id);
        Ok(Some((replacement, old)))
    }

    /// Rebuild `parent` around the shrunken child at `pos`, merging it into
    /// an adjacent sibling (left first, then right) when it became small.
    fn rebalance<S: PageStore + ?Sized>(
        &self,
        store: &mut S,
        parent: &Node,
        pos: u16,
        child: Node,
    ) -> Result<Node> {
        let page_size = store.page_size();
        if child.size() < page_size / MERGE_THRESHOLD_DIVISOR {
            if pos > 0 {
                let left_id = parent.child(pos - 1);
                let left = read_node(store, left_id)?;
                if can_merge(&left, &child, page_size) {
                    let merged = merge(&left, &child);
                    store.free_page(left_id);
                    let parts = persist_split(store, merged)?;
                    return Ok(replace_children(parent, pos - 1, 2, &parts));
                }
            }
            if pos + 1 < parent.count() {
                let right_id = parent.child(pos + 1);
                let right = read_node(store, right_id)?;
                if can_merge(&child, &right, page_size) {
                    let merged = merge(&child, &right);
                    store.free_page(right_id);
                    let parts = persist_split(store, merged)?;
                    return Ok(replace_children(parent, pos, 2, &parts));
                }
            }
        }
        // The child's first key may have grown, so it can still need a split.
        let parts = persist_split(store, child)?;
        Ok(replace_children(parent, pos, 1, &parts))
    }

    /// Persist `node` as the root, adding levels while it does not fit.
    fn install_root<S: PageStore + ?Sized>(&mut self, store: &mut S, node: Node) -> Result<()> {
        let mut node = node;
        for _ in 0..=MAX_BTREE_DEPTH {
            let parts = persist_split(store, node)?;
            if let [(_, page_id)] = parts.as_slice() {
                self.root_page_id = *page_id;
                return Ok(());
            }
            node = internal_from(&parts);
        }
        Err(depth_exceeded())
    }

    /// Collect all page IDs in this B-tree (for freeing).
    pub fn collect_pages<S: PageStore + ?Sized>(&self, store: &S) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        if self.root_page_id == 0 {
            return Ok(pages);
        }
        let mut visited = HashSet::new();
        self.collect_pages_recursive(store, self.root_page_id, &mut pages, &mut visited, 0)?;
        Ok(pages)
    }

    fn collect_pages_recursive<S: PageStore + ?Sized>(
        &self,
        store: &S,
        page_id: PageId,
        pages: &mut Vec<PageId>,
        visited: &mut HashSet<PageId>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_BTREE_DEPTH {
            return Err(depth_exceeded());
        }
        if !visited.insert(page_id) {
            return Err(KvError::Corruption(format!(
                "B-tree cycle detected: page {} visited twice during collection",
                page_id
            )));
        }
        pages.push(page_id);
        let node = read_node(store, page_id)?;
        if !node.is_leaf() {
            for pos in 0..node.count() {
                self.collect_pages_recursive(store, node.child(pos), pages, visited, depth + 1)?;
            }
        }
        Ok(())
    }

    /// Free every page of the tree and reset it to empty.
    pub fn free_all<S: PageStore + ?Sized>(&mut self, store: &mut S) -> Result<()> {
        for page_id in self.collect_pages(store)? {
            store.free_page(page_id);
        }
        self.root_page_id = 0;
        Ok(())
    }
}

/// Leaf with `key` updated in place or inserted at its ordered position.
fn leaf_upsert(node: &Node, key: &[u8], value: &[u8]) -> (Node, Option<Vec<u8>>) {
    let n = node.count();
    let capacity = node.size() + NodeType::Leaf.entry_size(key.len(), value.len());
    match node.lookup_le(key) {
        Some(pos) if node.key(pos) == key => {
            let mut new_node = Node::new(NodeType::Leaf, n, capacity);
            new_node.copy_range(node, 0, 0, pos);
            new_node.append_leaf(pos, key, value);
            new_node.copy_range(node, pos + 1, pos + 1, n - pos - 1);
            (new_node, Some(node.value(pos).to_vec()))
        }
        found => {
            let at = found.map_or(0, |pos| pos + 1);
            let mut new_node = Node::new(NodeType::Leaf, n + 1, capacity);
            new_node.copy_range(node, 0, 0, at);
            new_node.append_leaf(at, key, value);
            new_node.copy_range(node, at, at + 1, n - at);
            (new_node, None)
        }
    }
}

/// `parent` with entries `pos..pos + remove` replaced by `parts`.
fn replace_children(parent: &Node, pos: u16, remove: u16, parts: &[ChildRef]) -> Node {
    let n = parent.count();
    let added: usize = parts
        .iter()
        .map(|(key, _)| NodeType::Internal.entry_size(key.len(), 0))
        .sum();
    let count = n - remove + parts.len() as u16;
    let mut node = Node::new(NodeType::Internal, count, parent.size() + added);
    node.copy_range(parent, 0, 0, pos);
    for (i, (key, page_id)) in parts.iter().enumerate() {
        node.append_child(pos + i as u16, key, *page_id);
    }
    node.copy_range(parent, pos + remove, pos + parts.len() as u16, n - pos - remove);
    node
}

/// `parent` without the entry at `pos`; `None` when nothing remains.
fn remove_child(parent: &Node, pos: u16) -> Option<Node> {
    if parent.count() == 1 {
        return None;
    }
    Some(replace_children(parent, pos, 1, &[]))
}

fn internal_from(parts: &[ChildRef]) -> Node {
    let size: usize = parts
        .iter()
        .map(|(key, _)| NodeType::Internal.entry_size(key.len(), 0))
        .sum();
    let mut node = Node::new(NodeType::Internal, parts.len() as u16, HEADER_SIZE + size);
    for (i, (key, page_id)) in parts.iter().enumerate() {
        node.append_child(i as u16, key, *page_id);
    }
    node
}

fn can_merge(left: &Node, right: &Node, page_size: usize) -> bool {
    left.node_type() == right.node_type() && left.size() + right.size() - HEADER_SIZE <= page_size
}

fn merge(left: &Node, right: &Node) -> Node {
    let (ln, rn) = (left.count(), right.count());
    let mut node = Node::new(
        left.node_type(),
        ln + rn,
        left.size() + right.size() - HEADER_SIZE,
    );
    node.copy_range(left, 0, 0, ln);
    node.copy_range(right, 0, ln, rn);
    node
}

/// Split `node` until every part fits in a page, then stage each part.
fn persist_split<S: PageStore + ?Sized>(store: &mut S, node: Node) -> Result<Vec<ChildRef>> {
    let page_size = store.page_size();
    let mut nodes = Vec::new();
    split_into(node, page_size, &mut nodes);
    let mut parts = Vec::with_capacity(nodes.len());
    for node in nodes {
        let key = node.key(0).to_vec();
        let page_id = store.create_page(node.into_page(page_size))?;
        parts.push((key, page_id));
    }
    Ok(parts)
}

fn split_into(node: Node, page_size: usize, out: &mut Vec<Node>) {
    if node.fits(page_size) {
        out.push(node);
        return;
    }
    let (left, right) = split_half(&node);
    split_into(left, page_size, out);
    split_into(right, page_size, out);
}

/// Split at the position that best balances the two halves by bytes.
fn split_half(node: &Node) -> (Node, Node) {
    let n = node.count();
    assert!(
        n >= 2,
        "BUG: oversized node with {} entries cannot be split",
        n
    );
    let total = node.range_size(0, n);
    let mut best = 1;
    let mut best_cost = usize::MAX;
    for at in 1..n {
        let left = node.range_size(0, at);
        let cost = left.max(total - left);
        if cost < best_cost {
            best = at;
            best_cost = cost;
        }
    }

    let node_type = node.node_type();
    let mut left = Node::new(node_type, best, HEADER_SIZE + node.range_size(0, best));
    left.copy_range(node, 0, 0, best);
    let mut right = Node::new(
        node_type,
        n - best,
        HEADER_SIZE + node.range_size(best, n - best),
    );
    right.copy_range(node, best, 0, n - best);
    (left, right)
}
