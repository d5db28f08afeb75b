/// Ordered traversal over one B-tree snapshot.
///
/// A `Cursor` is a stack of `(node, position)` frames from the root down to
/// the current leaf entry. Moving past the end of a leaf pops frames until
/// one can advance, then descends the neighbouring subtree again, resetting
/// the frames below to their first (moving right) or last (moving left)
/// position. Nodes are owned copies, so a cursor stays valid while the
/// transaction that opened it keeps writing new pages.
use crate::btree::node::Node;
use crate::btree::ops::read_node;
use crate::error::{KvError, Result};
use crate::storage::page_store::PageStore;
use crate::storage::PageId;

const MAX_CURSOR_DEPTH: usize = 64;

struct Frame {
    node: Node,
    pos: u16,
}

/// Where `Cursor::seek_le` left the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Located {
    /// The tree is empty.
    Empty,
    /// Every key is greater than the target; positioned at the first entry.
    BeforeFirst,
    /// Positioned at the greatest key <= target.
    At,
}

pub struct Cursor<'s, S: PageStore + ?Sized> {
    store: &'s S,
    root: PageId,
    stack: Vec<Frame>,
}

#[derive(Clone, Copy)]
enum Edge {
    First,
    Last,
}

impl<'s, S: PageStore + ?Sized> Cursor<'s, S> {
    /// An unpositioned cursor over the tree rooted at `root`.
    pub fn new(store: &'s S, root: PageId) -> Self {
        Cursor {
            store,
            root,
            stack: Vec::new(),
        }
    }

    fn push(&mut self, page_id: PageId, edge: Edge) -> Result<()> {
        if self.stack.len() >= MAX_CURSOR_DEPTH {
            return Err(KvError::Corruption(
                "B-tree depth exceeds maximum (possible cycle)".into(),
            ));
        }
        let node = read_node(self.store, page_id)?;
        if node.count() == 0 {
            return Err(KvError::Corruption(format!(
                "empty B-tree node at page {}",
                page_id
            )));
        }
        let pos = match edge {
            Edge::First => 0,
            Edge::Last => node.count() - 1,
        };
        self.stack.push(Frame { node, pos });
        Ok(())
    }

    /// Descend from the top frame's current child to a leaf.
    fn descend(&mut self, edge: Edge) -> Result<()> {
        while let Some(top) = self.stack.last() {
            if top.node.is_leaf() {
                break;
            }
            let child = top.node.child(top.pos);
            self.push(child, edge)?;
        }
        Ok(())
    }

    fn reset(&mut self, edge: Edge) -> Result<bool> {
        self.stack.clear();
        if self.root == 0 {
            return Ok(false);
        }
        self.push(self.root, edge)?;
        self.descend(edge)?;
        Ok(true)
    }

    /// Position at the smallest key. `false` if the tree is empty.
    pub fn first(&mut self) -> Result<bool> {
        self.reset(Edge::First)
    }

    /// Position at the greatest key. `false` if the tree is empty.
    pub fn last(&mut self) -> Result<bool> {
        self.reset(Edge::Last)
    }

    /// Position at the greatest key <= `key`, descending by the same rule as
    /// `BTree::get`.
    pub fn seek_le(&mut self, key: &[u8]) -> Result<Located> {
        self.stack.clear();
        if self.root == 0 {
            return Ok(Located::Empty);
        }
        let mut page_id = self.root;
        loop {
            self.push(page_id, Edge::First)?;
            let Some(top) = self.stack.last_mut() else {
                return Ok(Located::Empty);
            };
            let Some(pos) = top.node.lookup_le(key) else {
                // Below the subtree minimum, which is the tree minimum.
                self.descend(Edge::First)?;
                return Ok(Located::BeforeFirst);
            };
            top.pos = pos;
            if top.node.is_leaf() {
                return Ok(Located::At);
            }
            page_id = top.node.child(pos);
        }
    }

    /// Key and value at the cursor, if positioned.
    pub fn current(&self) -> Option<(&[u8], &[u8])> {
        let top = self.stack.last()?;
        Some((top.node.key(top.pos), top.node.value(top.pos)))
    }

    pub fn has_next(&self) -> bool {
        self.stack
            .iter()
            .any(|frame| frame.pos + 1 < frame.node.count())
    }

    pub fn has_prev(&self) -> bool {
        self.stack.iter().any(|frame| frame.pos > 0)
    }

    /// Advance to the next key. Returns `false` (cursor unchanged) at the end.
    pub fn next(&mut self) -> Result<bool> {
        if !self.has_next() {
            return Ok(false);
        }
        while let Some(top) = self.stack.last_mut() {
            if top.pos + 1 < top.node.count() {
                top.pos += 1;
                break;
            }
            self.stack.pop();
        }
        self.descend(Edge::First)?;
        Ok(true)
    }

    /// Step back to the previous key. Returns `false` (cursor unchanged) at the start.
    pub fn prev(&mut self) -> Result<bool> {
        if !self.has_prev() {
            return Ok(false);
        }
        while let Some(top) = self.stack.last_mut() {
            if top.pos > 0 {
                top.pos -= 1;
                break;
            }
            self.stack.pop();
        }
        self.descend(Edge::Last)?;
        Ok(true)
    }
}

/// Comparison used by `Scanner::seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekStrategy {
    Less,
    LessOrEqual,
    GreaterOrEqual,
    Greater,
}

enum ScanState {
    /// Not positioned yet; iteration starts from the first key.
    Fresh,
    /// Positioned on an entry that has not been yielded yet.
    Ready,
    Yielded,
    Done,
}

/// Forward iterator over a tree snapshot, repositionable with `seek`.
pub struct Scanner<'s, S: PageStore + ?Sized> {
    cursor: Cursor<'s, S>,
    state: ScanState,
}

pub type Entry = (Vec<u8>, Vec<u8>);

impl<'s, S: PageStore + ?Sized> Scanner<'s, S> {
    pub fn new(store: &'s S, root: PageId) -> Self {
        Scanner {
            cursor: Cursor::new(store, root),
            state: ScanState::Fresh,
        }
    }

    fn current_owned(&self) -> Option<Entry> {
        self.cursor
            .current()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
    }

    /// Position at the entry matching `strategy` relative to `key` and return
    /// it. Iteration continues forward from that entry (inclusive).
    pub fn seek(&mut self, key: &[u8], strategy: SeekStrategy) -> Result<Option<Entry>> {
        let found = self.locate(key, strategy)?;
        self.state = if found { ScanState::Ready } else { ScanState::Done };
        Ok(if found { self.current_owned() } else { None })
    }

    fn locate(&mut self, key: &[u8], strategy: SeekStrategy) -> Result<bool> {
        let located = self.cursor.seek_le(key)?;
        let exact = matches!(self.cursor.current(), Some((k, _)) if k == key);
        Ok(match (located, strategy) {
            (Located::Empty, _) => false,
            (Located::BeforeFirst, SeekStrategy::Less | SeekStrategy::LessOrEqual) => false,
            (Located::BeforeFirst, SeekStrategy::GreaterOrEqual | SeekStrategy::Greater) => true,
            (Located::At, SeekStrategy::LessOrEqual) => true,
            (Located::At, SeekStrategy::Less) => !exact || self.cursor.prev()?,
            (Located::At, SeekStrategy::GreaterOrEqual) => exact || self.cursor.next()?,
            (Located::At, SeekStrategy::Greater) => self.cursor.next()?,
        })
    }
}

impl<S: PageStore + ?Sized> Iterator for Scanner<'_, S> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        let step = match self.state {
            ScanState::Done => return None,
            ScanState::Ready => Ok(true),
            ScanState::Fresh => self.cursor.first(),
            ScanState::Yielded => self.cursor.next(),
        };
        match step {
            Ok(true) => {
                self.state = ScanState::Yielded;
                self.current_owned().map(Ok)
            }
            Ok(false) => {
                self.state = ScanState::Done;
                None
            }
            Err(e) => {
                self.state = ScanState::Done;
                Some(Err(e))
            }
        }
    }
}
