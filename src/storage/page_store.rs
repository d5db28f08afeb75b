use crate::error::Result;
use crate::storage::PageId;

/// Abstraction over page I/O used by the B-tree.
///
/// Implemented by `PageManager` (per-transaction copy-on-write staging).
/// Pages are immutable once created: a changed node is always written with
/// `create_page` and its predecessor handed to `free_page`.
pub trait PageStore {
    fn page_size(&self) -> usize;
    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>>;
    fn create_page(&mut self, data: Vec<u8>) -> Result<PageId>;
    fn free_page(&mut self, page_id: PageId);
}
