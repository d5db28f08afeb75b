pub mod allocator;
pub mod backend;
pub mod freelist;
pub mod meta;
pub mod page_manager;
pub mod page_store;

/// Page number; byte offset in the store is `page_id * page_size`.
/// Page 0 is the master page, so 0 doubles as the "no page" pointer.
pub type PageId = u64;
