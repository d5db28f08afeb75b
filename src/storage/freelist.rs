/// Persisted free-page list: a backward-linked chain of list pages.
///
/// Each list page:
///   [count: u16] [cumulative_total: u64] [prev_page: u64] [page ids: u64 x count]
///
/// `cumulative_total` of a page is its own `count` plus the total of the
/// page it links to, so the head page states how many ids the whole chain
/// holds. `prev_page == 0` terminates the chain (page 0 is the master page).
use std::collections::HashSet;

use crate::error::{KvError, Result};
use crate::storage::PageId;

pub const LIST_HEADER_SIZE: usize = 2 + 8 + 8;

/// Maximum number of ids one list page holds.
pub fn entries_per_page(page_size: usize) -> usize {
    ((page_size - LIST_HEADER_SIZE) / 8).min(u16::MAX as usize)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeListPage {
    pub cumulative_total: u64,
    pub prev: PageId,
    pub ids: Vec<PageId>,
}

impl FreeListPage {
    pub fn serialize(&self, page_size: usize) -> Vec<u8> {
        assert!(
            self.ids.len() <= entries_per_page(page_size),
            "BUG: {} ids do not fit in one free-list page",
            self.ids.len()
        );
        let mut buf = vec![0u8; page_size];
        buf[0..2].copy_from_slice(&(self.ids.len() as u16).to_le_bytes());
        buf[2..10].copy_from_slice(&self.cumulative_total.to_le_bytes());
        buf[10..18].copy_from_slice(&self.prev.to_le_bytes());
        for (i, id) in self.ids.iter().enumerate() {
            let at = LIST_HEADER_SIZE + i * 8;
            buf[at..at + 8].copy_from_slice(&id.to_le_bytes());
        }
        buf
    }

    pub fn deserialize(data: &[u8], page_id: PageId) -> Result<Self> {
        if data.len() < LIST_HEADER_SIZE {
            return Err(KvError::InvalidPage(page_id));
        }
        let count = u16::from_le_bytes([data[0], data[1]]) as usize;
        if LIST_HEADER_SIZE + count * 8 > data.len() {
            return Err(KvError::InvalidPage(page_id));
        }
        let cumulative_total = u64::from_le_bytes(data[2..10].try_into().unwrap());
        let prev = u64::from_le_bytes(data[10..18].try_into().unwrap());
        let ids = (0..count)
            .map(|i| {
                let at = LIST_HEADER_SIZE + i * 8;
                u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
            })
            .collect();
        Ok(FreeListPage {
            cumulative_total,
            prev,
            ids,
        })
    }
}

/// Lay `ids` out over the list pages `page_ids`, filling each page before
/// moving on; trailing pages may be empty.
///
/// The last entry of `page_ids` becomes the chain head. Returns
/// `(page_id, page)` pairs in chain order.
pub fn build_chain(
    ids: &[PageId],
    page_ids: &[PageId],
    page_size: usize,
) -> Vec<(PageId, FreeListPage)> {
    let per_page = entries_per_page(page_size);
    assert!(
        ids.len() <= page_ids.len() * per_page,
        "BUG: {} free-list pages cannot hold {} ids",
        page_ids.len(),
        ids.len()
    );
    let mut rest = ids;
    let mut prev = 0;
    let mut total = 0u64;
    let mut pages = Vec::with_capacity(page_ids.len());
    for &pid in page_ids {
        let (chunk, tail) = rest.split_at(rest.len().min(per_page));
        rest = tail;
        total += chunk.len() as u64;
        pages.push((
            pid,
            FreeListPage {
                cumulative_total: total,
                prev,
                ids: chunk.to_vec(),
            },
        ));
        prev = pid;
    }
    pages
}

/// Ids recorded in a drained chain plus the list pages that held them.
#[derive(Debug, Default)]
pub struct FreeList {
    pub free_pages: Vec<PageId>,
    pub list_pages: Vec<PageId>,
}

impl FreeList {
    /// Walk the chain from `head`, reading pages through `read`.
    pub fn read_chain<F>(head: PageId, mut read: F) -> Result<Self>
    where
        F: FnMut(PageId) -> Result<Vec<u8>>,
    {
        let mut list = FreeList::default();
        let mut visited = HashSet::new();
        let mut cur = head;
        let mut expected_total: Option<u64> = None;
        while cur != 0 {
            if !visited.insert(cur) {
                return Err(KvError::Corruption(format!(
                    "free-list cycle detected at page {}",
                    cur
                )));
            }
            let page = FreeListPage::deserialize(&read(cur)?, cur)?;
            if let Some(total) = expected_total {
                if total != page.cumulative_total {
                    return Err(KvError::Corruption(format!(
                        "free-list page {} total {} does not match expected {}",
                        cur, page.cumulative_total, total
                    )));
                }
            }
            expected_total = Some(
                page.cumulative_total
                    .checked_sub(page.ids.len() as u64)
                    .ok_or_else(|| {
                        KvError::Corruption(format!("free-list page {} total underflow", cur))
                    })?,
            );
            list.free_pages.extend_from_slice(&page.ids);
            list.list_pages.push(cur);
            cur = page.prev;
        }
        if let Some(rest) = expected_total {
            if rest != 0 {
                return Err(KvError::Corruption(format!(
                    "free-list chain ends with {} ids unaccounted for",
                    rest
                )));
            }
        }
        Ok(list)
    }

    /// Number of free pages recorded in the chain.
    pub fn len(&self) -> usize {
        self.free_pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free_pages.is_empty()
    }

    /// Validate that all entries are within `page_count` and unique.
    pub fn validate(&self, page_count: u64) -> std::result::Result<(), String> {
        let mut seen = HashSet::new();
        for &pid in self.free_pages.iter().chain(&self.list_pages) {
            if pid == 0 || pid >= page_count {
                return Err(format!(
                    "freelist entry {} is outside 1..{}",
                    pid, page_count
                ));
            }
            if !seen.insert(pid) {
                return Err(format!("duplicate freelist entry: page {}", pid));
            }
        }
        Ok(())
    }
}
