/// B-tree node layout over one page.
///
/// ```text
/// [tag: u16] [count: u16]
/// [child pointers: u64 x count]        (internal nodes only)
/// [entry end offsets: u16 x count]     (relative to the kv region)
/// [kv region: (key_len: u16, value_len: u16, key, value) x count]
/// ```
///
/// Internal entries carry an empty value; the key is the minimum key of the
/// child subtree. A node is built once, front to back, through `append_*`
/// and `copy_range`, and never edited after it has been written to a page.
use std::cmp::Ordering;

use crate::error::{KvError, Result};
use crate::storage::PageId;

const TAG_LEAF: u16 = 1;
const TAG_INTERNAL: u16 = 2;

pub const HEADER_SIZE: usize = 4;
const POINTER_SIZE: usize = 8;
const OFFSET_SIZE: usize = 2;
const KV_HEADER_SIZE: usize = 4;

/// Bytes a leaf entry costs beyond its key and value.
pub const LEAF_ENTRY_OVERHEAD: usize = OFFSET_SIZE + KV_HEADER_SIZE;
/// Bytes an internal entry costs beyond its key.
pub const INTERNAL_ENTRY_OVERHEAD: usize = POINTER_SIZE + OFFSET_SIZE + KV_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Leaf,
    Internal,
}

impl NodeType {
    fn tag(self) -> u16 {
        match self {
            NodeType::Leaf => TAG_LEAF,
            NodeType::Internal => TAG_INTERNAL,
        }
    }

    /// Bytes an entry with the given key/value lengths occupies in a node of this type.
    pub fn entry_size(self, key_len: usize, value_len: usize) -> usize {
        match self {
            NodeType::Leaf => LEAF_ENTRY_OVERHEAD + key_len + value_len,
            NodeType::Internal => INTERNAL_ENTRY_OVERHEAD + key_len,
        }
    }
}

#[derive(Clone)]
pub struct Node {
    data: Vec<u8>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("type", &self.node_type())
            .field("count", &self.count())
            .field("size", &self.size())
            .finish()
    }
}

impl Node {
    /// Allocate an empty node that will hold exactly `count` entries.
    ///
    /// `capacity` is the byte budget for the whole node and may exceed the
    /// page size; oversized nodes must be split before they are written.
    pub fn new(node_type: NodeType, count: u16, capacity: usize) -> Self {
        let mut node = Node {
            data: vec![0u8; capacity],
        };
        assert!(
            node.kv_start_for(node_type, count) <= capacity,
            "BUG: node capacity {} cannot hold {} slots",
            capacity,
            count
        );
        node.data[0..2].copy_from_slice(&node_type.tag().to_le_bytes());
        node.data[2..4].copy_from_slice(&count.to_le_bytes());
        node
    }

    /// Interpret page bytes as a node, validating the header and entry offsets.
    pub fn from_page(data: Vec<u8>, page_id: PageId) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(KvError::InvalidPage(page_id));
        }
        let tag = u16::from_le_bytes([data[0], data[1]]);
        if tag != TAG_LEAF && tag != TAG_INTERNAL {
            return Err(KvError::InvalidPage(page_id));
        }
        let node = Node { data };
        let kv_start = node.kv_start();
        if kv_start > node.data.len() {
            return Err(KvError::InvalidPage(page_id));
        }
        let mut prev = 0usize;
        for pos in 0..node.count() {
            let end = node.offset(pos);
            let start = kv_start + prev;
            if end < prev + KV_HEADER_SIZE || kv_start + end > node.data.len() {
                return Err(KvError::InvalidPage(page_id));
            }
            let key_len = u16::from_le_bytes([node.data[start], node.data[start + 1]]) as usize;
            let value_len =
                u16::from_le_bytes([node.data[start + 2], node.data[start + 3]]) as usize;
            if prev + KV_HEADER_SIZE + key_len + value_len != end {
                return Err(KvError::InvalidPage(page_id));
            }
            prev = end;
        }
        Ok(node)
    }

    pub fn node_type(&self) -> NodeType {
        if u16::from_le_bytes([self.data[0], self.data[1]]) == TAG_INTERNAL {
            NodeType::Internal
        } else {
            NodeType::Leaf
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.node_type() == NodeType::Leaf
    }

    /// Number of stored keys.
    pub fn count(&self) -> u16 {
        u16::from_le_bytes([self.data[2], self.data[3]])
    }

    /// Byte offset just past the last stored entry.
    pub fn size(&self) -> usize {
        let n = self.count();
        if n == 0 {
            return self.kv_start();
        }
        self.kv_start() + self.offset(n - 1)
    }

    pub fn key(&self, pos: u16) -> &[u8] {
        let (start, key_len, _) = self.entry_header(pos);
        &self.data[start + KV_HEADER_SIZE..start + KV_HEADER_SIZE + key_len]
    }

    /// Value of a leaf entry (empty for internal entries).
    pub fn value(&self, pos: u16) -> &[u8] {
        let (start, key_len, value_len) = self.entry_header(pos);
        let from = start + KV_HEADER_SIZE + key_len;
        &self.data[from..from + value_len]
    }

    /// Child pointer of an internal entry.
    pub fn child(&self, pos: u16) -> PageId {
        assert!(
            self.node_type() == NodeType::Internal,
            "BUG: child pointer requested from a leaf"
        );
        self.check_pos(pos);
        let at = HEADER_SIZE + POINTER_SIZE * pos as usize;
        u64::from_le_bytes(self.data[at..at + POINTER_SIZE].try_into().unwrap())
    }

    /// Write a leaf entry at `pos`; entries before `pos` must already be written.
    pub fn append_leaf(&mut self, pos: u16, key: &[u8], value: &[u8]) {
        assert!(self.is_leaf(), "BUG: leaf entry appended to an internal node");
        self.append_kv(pos, key, value);
    }

    /// Write an internal entry at `pos`; entries before `pos` must already be written.
    pub fn append_child(&mut self, pos: u16, key: &[u8], child: PageId) {
        assert!(
            !self.is_leaf(),
            "BUG: child pointer appended to a leaf node"
        );
        self.append_kv(pos, key, &[]);
        let at = HEADER_SIZE + POINTER_SIZE * pos as usize;
        self.data[at..at + POINTER_SIZE].copy_from_slice(&child.to_le_bytes());
    }

    /// Copy `n` entries starting at `from` in `src` to positions starting at
    /// `to` in this node, rebasing the entry offsets.
    pub fn copy_range(&mut self, src: &Node, from: u16, to: u16, n: u16) {
        if n == 0 {
            return;
        }
        assert_eq!(
            src.node_type(),
            self.node_type(),
            "BUG: copy_range between different node types"
        );
        assert!(
            from as usize + n as usize <= src.count() as usize,
            "BUG: copy_range source {}+{} exceeds count {}",
            from,
            n,
            src.count()
        );
        assert!(
            to as usize + n as usize <= self.count() as usize,
            "BUG: copy_range destination {}+{} exceeds count {}",
            to,
            n,
            self.count()
        );

        let src_base = src.entry_start(from);
        let src_end = src.kv_start() + src.offset(from + n - 1);
        let dst_base = self.entry_start(to);
        let len = src_end - src_base;
        assert!(
            dst_base + len <= self.data.len(),
            "BUG: copy_range needs {} bytes, node capacity is {}",
            dst_base + len,
            self.data.len()
        );
        self.data[dst_base..dst_base + len].copy_from_slice(&src.data[src_base..src_end]);

        let src_rel = src_base - src.kv_start();
        let dst_rel = dst_base - self.kv_start();
        for i in 0..n {
            let end = src.offset(from + i) - src_rel + dst_rel;
            self.set_offset(to + i, end);
        }
        if self.node_type() == NodeType::Internal {
            for i in 0..n {
                let child = src.child(from + i);
                let at = HEADER_SIZE + POINTER_SIZE * (to + i) as usize;
                self.data[at..at + POINTER_SIZE].copy_from_slice(&child.to_le_bytes());
            }
        }
    }

    /// Position of the greatest key <= `key`, taking the latest position on
    /// ties. `None` when every stored key is greater.
    pub fn lookup_le(&self, key: &[u8]) -> Option<u16> {
        let (mut lo, mut hi) = (0u16, self.count());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid).cmp(key) {
                Ordering::Greater => hi = mid,
                Ordering::Less | Ordering::Equal => lo = mid + 1,
            }
        }
        lo.checked_sub(1)
    }

    /// Bytes of a persisted page. Panics if the node does not fit.
    pub fn into_page(mut self, page_size: usize) -> Vec<u8> {
        let size = self.size();
        assert!(
            size <= page_size,
            "BUG: writing oversized node ({} > {} bytes)",
            size,
            page_size
        );
        self.data.resize(page_size, 0);
        self.data
    }

    pub fn fits(&self, page_size: usize) -> bool {
        self.size() <= page_size
    }

    /// Bytes taken by entries `from..from + n` (slots plus kv data).
    pub fn range_size(&self, from: u16, n: u16) -> usize {
        if n == 0 {
            return 0;
        }
        let start = if from == 0 { 0 } else { self.offset(from - 1) };
        let kv = self.offset(from + n - 1) - start;
        let slot = match self.node_type() {
            NodeType::Leaf => OFFSET_SIZE,
            NodeType::Internal => OFFSET_SIZE + POINTER_SIZE,
        };
        kv + slot * n as usize
    }

    // --- layout helpers ---

    fn kv_start_for(&self, node_type: NodeType, count: u16) -> usize {
        let slot = match node_type {
            NodeType::Leaf => OFFSET_SIZE,
            NodeType::Internal => OFFSET_SIZE + POINTER_SIZE,
        };
        HEADER_SIZE + slot * count as usize
    }

    fn kv_start(&self) -> usize {
        self.kv_start_for(self.node_type(), self.count())
    }

    fn offsets_start(&self) -> usize {
        match self.node_type() {
            NodeType::Leaf => HEADER_SIZE,
            NodeType::Internal => HEADER_SIZE + POINTER_SIZE * self.count() as usize,
        }
    }

    fn offset(&self, pos: u16) -> usize {
        let at = self.offsets_start() + OFFSET_SIZE * pos as usize;
        u16::from_le_bytes([self.data[at], self.data[at + 1]]) as usize
    }

    fn set_offset(&mut self, pos: u16, end: usize) {
        let end = u16::try_from(end).expect("BUG: node entry offset exceeds u16");
        let at = self.offsets_start() + OFFSET_SIZE * pos as usize;
        self.data[at..at + OFFSET_SIZE].copy_from_slice(&end.to_le_bytes());
    }

    fn entry_start(&self, pos: u16) -> usize {
        if pos == 0 {
            self.kv_start()
        } else {
            self.kv_start() + self.offset(pos - 1)
        }
    }

    fn check_pos(&self, pos: u16) {
        assert!(
            pos < self.count(),
            "BUG: position {} out of range for node with {} keys",
            pos,
            self.count()
        );
    }

    fn entry_header(&self, pos: u16) -> (usize, usize, usize) {
        self.check_pos(pos);
        let start = self.entry_start(pos);
        let key_len = u16::from_le_bytes([self.data[start], self.data[start + 1]]) as usize;
        let value_len = u16::from_le_bytes([self.data[start + 2], self.data[start + 3]]) as usize;
        (start, key_len, value_len)
    }

    fn append_kv(&mut self, pos: u16, key: &[u8], value: &[u8]) {
        self.check_pos(pos);
        let start = self.entry_start(pos);
        let end = start + KV_HEADER_SIZE + key.len() + value.len();
        assert!(
            end <= self.data.len(),
            "BUG: entry needs {} bytes, node capacity is {}",
            end,
            self.data.len()
        );
        self.data[start..start + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        self.data[start + 2..start + 4].copy_from_slice(&(value.len() as u16).to_le_bytes());
        self.data[start + KV_HEADER_SIZE..start + KV_HEADER_SIZE + key.len()].copy_from_slice(key);
        self.data[start + KV_HEADER_SIZE + key.len()..end].copy_from_slice(value);
        let rel = end - self.kv_start();
        self.set_offset(pos, rel);
    }
}
