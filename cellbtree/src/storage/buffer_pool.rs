//! Buffer pool for pre-allocated page buffers.
//!
//! Every page a store hands to the tree is leased from this pool, so the
//! number of leased buffers is the number of pinned pages. A page is
//! unpinned when the `Page` value is dropped, on every exit path.
//!
//! # Invariants
//!
//! - Pool capacity is fixed after construction
//! - Free list size + leased count == capacity

use std::sync::{Arc, Mutex};

use crate::storage::page::{PAGE_SIZE, Page};

/// Default buffer pool capacity in pages (1,024 pages = 8MB).
///
/// Tree operations pin a handful of pages at a time, so the pool only has
/// to cover the working set of concurrent operations and cursor refills.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// A buffer pool that pre-allocates page buffers.
///
/// # Invariants
/// - `free_list.len() + leased_count == capacity`
pub struct BufferPool {
    /// Free buffers available for leasing.
    free_list: Mutex<Vec<Box<[u8; PAGE_SIZE]>>>,
    /// Total capacity (for assertions).
    capacity: usize,
}

impl BufferPool {
    /// Create a new buffer pool with the given capacity.
    ///
    /// # Panics
    /// Panics if capacity is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "Buffer pool capacity must be positive");

        let mut free_list = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free_list.push(Box::new([0u8; PAGE_SIZE]));
        }

        Arc::new(Self {
            free_list: Mutex::new(free_list),
            capacity,
        })
    }

    /// Lease a buffer from the pool.
    ///
    /// Returns `None` if the pool is exhausted. Buffer contents are stale.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn lease(&self) -> Option<Box<[u8; PAGE_SIZE]>> {
        self.free_list.lock().expect("lock poisoned").pop()
    }

    /// Lease a zeroed buffer from the pool.
    pub fn lease_zeroed(&self) -> Option<Box<[u8; PAGE_SIZE]>> {
        let mut buffer = self.lease()?;
        buffer.fill(0);
        Some(buffer)
    }

    /// Lease a page from the pool. Page contents are stale.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn lease_page(self: &Arc<Self>) -> Option<Page> {
        let buffer = self.lease()?;
        Some(Page::from_pool(buffer, Arc::clone(self)))
    }

    /// Lease a zeroed page from the pool.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn lease_page_zeroed(self: &Arc<Self>) -> Option<Page> {
        let buffer = self.lease_zeroed()?;
        Some(Page::from_pool(buffer, Arc::clone(self)))
    }

    /// Return a buffer to the pool.
    ///
    /// # Panics
    /// Panics if returning would exceed capacity (indicates a bug).
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn return_buffer(&self, buffer: Box<[u8; PAGE_SIZE]>) {
        let mut free_list = self.free_list.lock().expect("lock poisoned");
        assert!(
            free_list.len() < self.capacity,
            "Buffer pool overflow: returning buffer to full pool"
        );
        free_list.push(buffer);
    }

    /// Get the number of available buffers.
    #[must_use]
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn available(&self) -> usize {
        self.free_list.lock().expect("lock poisoned").len()
    }

    /// Number of buffers currently leased, i.e. pinned pages.
    #[must_use]
    pub fn pinned(&self) -> usize {
        self.capacity - self.available()
    }

    /// Get the total capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_and_return() {
        let pool = BufferPool::new(2);

        let buf1 = pool.lease().expect("first lease");
        let buf2 = pool.lease().expect("second lease");
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.pinned(), 2);

        // Pool exhausted
        assert!(pool.lease().is_none());

        pool.return_buffer(buf1);
        pool.return_buffer(buf2);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.pinned(), 0);
    }

    #[test]
    fn test_dropping_page_unpins_buffer() {
        let pool = BufferPool::new(2);

        {
            let _page1 = pool.lease_page().expect("should lease");
            let _page2 = pool.lease_page().expect("should lease");
            assert_eq!(pool.pinned(), 2);
            assert!(pool.lease_page().is_none());
        }

        assert_eq!(pool.pinned(), 0);
    }

    #[test]
    fn test_lease_page_zeroed() {
        let pool = BufferPool::new(1);

        {
            let mut page = pool.lease_page_zeroed().expect("should lease");
            page.write_u8(0, 0xFF);
            page.write_u8(100, 0xAB);
        }

        let page = pool.lease_page_zeroed().expect("should lease");
        assert_eq!(page.read_u8(0), 0);
        assert_eq!(page.read_u8(100), 0);
    }

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn test_zero_capacity_panics() {
        let _ = BufferPool::new(0);
    }

    #[test]
    #[should_panic(expected = "Buffer pool overflow")]
    fn test_return_to_full_pool_panics() {
        let pool = BufferPool::new(1);
        pool.return_buffer(Box::new([0u8; PAGE_SIZE]));
    }
}
