//! Entry point page of the main tree file (page 0).
//!
//! Layout after the page header:
//! - `tree_size`: i64 at offset 8, number of key/value pairs
//! - `pages_size`: u32 at offset 16, highest page index handed out to a bucket

use crate::storage::page::{Page, PageHeader, PageType};

const TREE_SIZE_OFFSET: usize = PageHeader::SIZE;
const PAGES_SIZE_OFFSET: usize = TREE_SIZE_OFFSET + 8;

/// Decoded main entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub tree_size: i64,
    pub pages_size: u32,
}

impl EntryPoint {
    /// State of a freshly created tree: empty, with the root on page 1.
    #[must_use]
    pub const fn init() -> Self {
        Self {
            tree_size: 0,
            pages_size: 1,
        }
    }

    /// Read the entry point from a page, `None` if it is not an entry point page.
    #[must_use]
    pub fn from_page(page: &Page) -> Option<Self> {
        if page.page_type().ok()? != PageType::EntryPoint {
            return None;
        }
        Some(Self {
            tree_size: page.read_i64(TREE_SIZE_OFFSET),
            pages_size: page.read_u32(PAGES_SIZE_OFFSET),
        })
    }

    /// Write the entry point to a page.
    pub fn write_to_page(&self, page: &mut Page) {
        PageHeader::init(page, PageType::EntryPoint);
        page.write_i64(TREE_SIZE_OFFSET, self.tree_size);
        page.write_u32(PAGES_SIZE_OFFSET, self.pages_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_point_layout() {
        let mut page = Page::new();
        EntryPoint {
            tree_size: 1_000_000,
            pages_size: 42,
        }
        .write_to_page(&mut page);

        assert_eq!(page.read_i64(8), 1_000_000);
        assert_eq!(page.read_u32(16), 42);
        assert_eq!(
            EntryPoint::from_page(&page),
            Some(EntryPoint {
                tree_size: 1_000_000,
                pages_size: 42
            })
        );
    }

    #[test]
    fn test_wrong_page_type() {
        assert_eq!(EntryPoint::from_page(&Page::new()), None);
        let mut page = Page::new();
        PageHeader::init(&mut page, PageType::LeafBucket);
        assert_eq!(EntryPoint::from_page(&page), None);
    }
}
