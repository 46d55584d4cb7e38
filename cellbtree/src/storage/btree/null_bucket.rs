//! Pages of the null-key file.
//!
//! Page 0 is the null entry point:
//! - `size`: u32 at offset 8, number of null buckets ever allocated
//! - `first_page`: offset 12, head of the bucket chain (-1 if none)
//! - `last_page`: offset 16, tail of the bucket chain (-1 if none)
//! - `free_list_header`: offset 20, first bucket with free room (-1 if none)
//!
//! Every other page is a null bucket:
//! - `count`: u32 at offset 8
//! - `next`: offset 12, next bucket of the chain
//! - `next_free_list`: offset 16, next bucket of the free list
//! - values: `count` RIDs from offset 20

#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{PAGE_SIZE, Page, PageHeader, PageIndex, PageType};
use crate::types::rid::{RID_SIZE, Rid};

const SIZE_OFFSET: usize = PageHeader::SIZE;
const FIRST_PAGE_OFFSET: usize = SIZE_OFFSET + 4;
const LAST_PAGE_OFFSET: usize = FIRST_PAGE_OFFSET + 4;
const FREE_LIST_HEADER_OFFSET: usize = LAST_PAGE_OFFSET + 4;

const COUNT_OFFSET: usize = PageHeader::SIZE;
const NEXT_OFFSET: usize = COUNT_OFFSET + 4;
const NEXT_FREE_LIST_OFFSET: usize = NEXT_OFFSET + 4;
const VALUES_OFFSET: usize = NEXT_FREE_LIST_OFFSET + 4;

/// Number of values one null bucket holds.
pub const NULL_BUCKET_CAPACITY: usize = (PAGE_SIZE - VALUES_OFFSET) / RID_SIZE;

/// Decoded null entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NullEntryPoint {
    pub size: u32,
    pub first_page: Option<PageIndex>,
    pub last_page: Option<PageIndex>,
    pub free_list_header: Option<PageIndex>,
}

impl NullEntryPoint {
    /// State of an empty null list.
    #[must_use]
    pub const fn init() -> Self {
        Self {
            size: 0,
            first_page: None,
            last_page: None,
            free_list_header: None,
        }
    }

    /// Read the null entry point, `None` if the page has another type.
    #[must_use]
    pub fn from_page(page: &Page) -> Option<Self> {
        if page.page_type().ok()? != PageType::NullEntryPoint {
            return None;
        }
        Some(Self {
            size: page.read_u32(SIZE_OFFSET),
            first_page: page.read_link(FIRST_PAGE_OFFSET),
            last_page: page.read_link(LAST_PAGE_OFFSET),
            free_list_header: page.read_link(FREE_LIST_HEADER_OFFSET),
        })
    }

    pub fn write_to_page(&self, page: &mut Page) {
        PageHeader::init(page, PageType::NullEntryPoint);
        page.write_u32(SIZE_OFFSET, self.size);
        page.write_link(FIRST_PAGE_OFFSET, self.first_page);
        page.write_link(LAST_PAGE_OFFSET, self.last_page);
        page.write_link(FREE_LIST_HEADER_OFFSET, self.free_list_header);
    }
}

/// Decoded null bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NullBucket {
    pub next: Option<PageIndex>,
    pub next_free_list: Option<PageIndex>,
    pub values: Vec<Rid>,
}

impl NullBucket {
    /// Read a null bucket, `None` if the page has another type or a bad count.
    #[must_use]
    pub fn from_page(page: &Page) -> Option<Self> {
        if page.page_type().ok()? != PageType::NullBucket {
            return None;
        }
        let count = page.read_u32(COUNT_OFFSET) as usize;
        if count > NULL_BUCKET_CAPACITY {
            return None;
        }
        let values = page
            .read_bytes(VALUES_OFFSET, count * RID_SIZE)
            .chunks_exact(RID_SIZE)
            .filter_map(Rid::from_bytes)
            .collect();
        Some(Self {
            next: page.read_link(NEXT_OFFSET),
            next_free_list: page.read_link(NEXT_FREE_LIST_OFFSET),
            values,
        })
    }

    pub fn write_to_page(&self, page: &mut Page) {
        page.as_bytes_mut().fill(0);
        PageHeader::init(page, PageType::NullBucket);
        page.write_u32(COUNT_OFFSET, self.values.len() as u32);
        page.write_link(NEXT_OFFSET, self.next);
        page.write_link(NEXT_FREE_LIST_OFFSET, self.next_free_list);
        for (i, value) in self.values.iter().enumerate() {
            page.write_bytes(VALUES_OFFSET + i * RID_SIZE, &value.to_bytes());
        }
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.values.len() >= NULL_BUCKET_CAPACITY
    }

    /// Add a value. Returns false if the bucket is full.
    pub fn add_value(&mut self, value: Rid) -> bool {
        if self.is_full() {
            return false;
        }
        self.values.push(value);
        true
    }

    /// Remove one occurrence of `value`. Returns whether it was present.
    pub fn remove_value(&mut self, value: Rid) -> bool {
        match self.values.iter().position(|v| *v == value) {
            Some(position) => {
                self.values.remove(position);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_entry_point_layout() {
        let entry = NullEntryPoint {
            size: 3,
            first_page: Some(1),
            last_page: Some(3),
            free_list_header: None,
        };
        let mut page = Page::new();
        entry.write_to_page(&mut page);

        assert_eq!(page.read_u32(8), 3);
        assert_eq!(page.read_u32(12), 1);
        assert_eq!(page.read_u32(16), 3);
        assert_eq!(page.read_bytes(20, 4), (-1i32).to_le_bytes());
        assert_eq!(NullEntryPoint::from_page(&page), Some(entry));
    }

    #[test]
    fn test_null_bucket_capacity() {
        let mut bucket = NullBucket::default();
        let mut added = 0;
        while bucket.add_value(Rid::new(0, added)) {
            added += 1;
        }
        assert_eq!(added as usize, NULL_BUCKET_CAPACITY);
        assert!(bucket.is_full());

        let mut page = Page::new();
        bucket.next = Some(9);
        bucket.write_to_page(&mut page);
        let restored = NullBucket::from_page(&page).expect("decode");
        assert_eq!(restored.values.len(), NULL_BUCKET_CAPACITY);
        assert_eq!(restored.next, Some(9));
        assert_eq!(restored.next_free_list, None);
    }

    #[test]
    fn test_null_bucket_remove() {
        let mut bucket = NullBucket::default();
        bucket.add_value(Rid::new(1, 1));
        bucket.add_value(Rid::new(1, 2));
        assert!(!bucket.remove_value(Rid::new(1, 3)));
        assert!(bucket.remove_value(Rid::new(1, 1)));
        assert_eq!(bucket.values, vec![Rid::new(1, 2)]);
    }

    #[test]
    fn test_rejects_other_pages() {
        let mut page = Page::new();
        NullEntryPoint::init().write_to_page(&mut page);
        assert_eq!(NullBucket::from_page(&page), None);
        assert_eq!(NullEntryPoint::from_page(&Page::new()), None);
    }
}
