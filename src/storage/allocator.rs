/// Lock-free page-number allocator shared by all open transactions.
///
/// Freed page numbers live in an immutable singly linked list of blocks
/// published through an `ArcSwapOption`. Popping one number replaces the
/// head with a shorter view over the same id slice, so neither push nor pop
/// ever mutates a published block. When the list is empty a fresh number is
/// taken from a monotonic counter.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::storage::PageId;

struct FreeBlock {
    pages: Arc<[PageId]>,
    /// Number of ids still available in `pages` (taken from the back).
    len: usize,
    next: Option<Arc<FreeBlock>>,
}

impl FreeBlock {
    fn top(&self) -> PageId {
        self.pages[self.len - 1]
    }

    /// List head after taking `top()`.
    fn rest(&self) -> Option<Arc<FreeBlock>> {
        if self.len > 1 {
            Some(Arc::new(FreeBlock {
                pages: Arc::clone(&self.pages),
                len: self.len - 1,
                next: self.next.clone(),
            }))
        } else {
            self.next.clone()
        }
    }
}

pub struct PageAllocator {
    head: ArcSwapOption<FreeBlock>,
    next_page: AtomicU64,
}

impl PageAllocator {
    /// `next_page` is the first never-used page number.
    pub fn new(next_page: PageId) -> Self {
        PageAllocator {
            head: ArcSwapOption::empty(),
            next_page: AtomicU64::new(next_page),
        }
    }

    /// Take a page number: a recycled one if any, else a fresh one.
    pub fn get(&self) -> PageId {
        let prev = self
            .head
            .rcu(|head| head.as_ref().and_then(|block| block.rest()));
        match prev {
            Some(block) => block.top(),
            None => self.next_page.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Return page numbers for reuse. The slice is copied into a new block.
    pub fn free(&self, pages: &[PageId]) {
        if pages.is_empty() {
            return;
        }
        let pages: Arc<[PageId]> = Arc::from(pages);
        self.head.rcu(|head| {
            Some(Arc::new(FreeBlock {
                pages: Arc::clone(&pages),
                len: pages.len(),
                next: head.clone(),
            }))
        });
    }

    /// First page number never handed out; the store spans `0..next_page()`.
    pub fn next_page(&self) -> PageId {
        self.next_page.load(Ordering::SeqCst)
    }

    /// Number of recycled page numbers waiting in the list.
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head.load_full();
        while let Some(block) = cur {
            count += block.len;
            cur = block.next.clone();
        }
        count
    }

    /// Copy of every recycled page number currently in the list.
    pub fn snapshot(&self) -> Vec<PageId> {
        let mut pages = Vec::new();
        let mut cur = self.head.load_full();
        while let Some(block) = cur {
            pages.extend_from_slice(&block.pages[..block.len]);
            cur = block.next.clone();
        }
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_counter_then_recycled() {
        let alloc = PageAllocator::new(5);
        assert_eq!(alloc.get(), 5);
        assert_eq!(alloc.get(), 6);

        alloc.free(&[2, 3]);
        assert_eq!(alloc.free_count(), 2);
        assert_eq!(alloc.get(), 3);
        assert_eq!(alloc.get(), 2);
        assert_eq!(alloc.get(), 7);
        assert_eq!(alloc.next_page(), 8);
    }

    #[test]
    fn test_snapshot_leaves_pool_untouched() {
        let alloc = PageAllocator::new(50);
        alloc.free(&[4, 5, 6]);
        alloc.get();
        alloc.free(&[9]);
        let mut pages = alloc.snapshot();
        pages.sort_unstable();
        assert_eq!(pages, vec![4, 5, 9]);
        assert_eq!(alloc.free_count(), 3);
    }

    #[test]
    fn test_free_copies_input() {
        let alloc = PageAllocator::new(100);
        let mut pages = vec![10, 11];
        alloc.free(&pages);
        pages[0] = 99;
        pages[1] = 98;
        let got: HashSet<_> = [alloc.get(), alloc.get()].into_iter().collect();
        assert_eq!(got, HashSet::from([10, 11]));
    }

    #[test]
    fn test_concurrent_get_and_free_never_duplicates() {
        let alloc = Arc::new(PageAllocator::new(1));
        alloc.free(&(1000..1500).collect::<Vec<_>>());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    for i in 0..200 {
                        mine.push(alloc.get());
                        if i % 50 == 49 {
                            // Give some back and take them again.
                            let back: Vec<_> = mine.drain(mine.len() - 10..).collect();
                            alloc.free(&back);
                        }
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for page in h.join().unwrap() {
                assert!(seen.insert(page), "page {} handed out twice", page);
            }
        }
    }
}
