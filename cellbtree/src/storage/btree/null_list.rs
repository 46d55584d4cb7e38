//! Values stored under the null key.
//!
//! The null key cannot be ordered, so its values live in a second file as
//! a chain of [`NullBucket`]s starting at `first_page`. Buckets that are
//! not full also form a free list starting at `free_list_header`; new
//! values go to the head of the free list. A bucket emptied by a removal
//! leaves the chain but stays on the free list, so its page is reused by
//! the next put instead of growing the file.

use std::sync::Arc;

use crate::storage::atomic::AtomicOperation;
use crate::storage::btree::error::TreeError;
use crate::storage::btree::null_bucket::{NullBucket, NullEntryPoint};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::io::{FileId, PageReader, StorageError};
use crate::storage::page::{Page, PageIndex};
use crate::types::rid::Rid;

const ENTRY_POINT_INDEX: PageIndex = 0;

/// Operations on the null-key file of one tree.
pub struct NullList<'a> {
    tree: &'a str,
    file_id: FileId,
    pool: &'a Arc<BufferPool>,
}

impl<'a> NullList<'a> {
    pub const fn new(tree: &'a str, file_id: FileId, pool: &'a Arc<BufferPool>) -> Self {
        Self {
            tree,
            file_id,
            pool,
        }
    }

    pub fn entry_point<R: PageReader + ?Sized>(
        &self,
        reader: &R,
    ) -> Result<NullEntryPoint, TreeError> {
        let page = reader
            .read_page(self.file_id, ENTRY_POINT_INDEX)
            .map_err(TreeError::storage(self.tree))?;
        NullEntryPoint::from_page(&page).ok_or_else(|| {
            TreeError::corrupted(self.tree, "page 0 of the null file is not its entry point")
        })
    }

    /// Every null-key value, in chain order.
    pub fn get<R: PageReader + ?Sized>(&self, reader: &R) -> Result<Vec<Rid>, TreeError> {
        let entry = self.entry_point(reader)?;
        let mut values = Vec::new();
        let mut next = entry.first_page;
        let mut hops = 0u32;
        while let Some(page) = next {
            hops += 1;
            if hops > entry.size {
                return Err(TreeError::corrupted(
                    self.tree,
                    format!("null bucket chain through page {page} loops"),
                ));
            }
            let bucket = self.read_bucket(reader, page)?;
            values.extend_from_slice(&bucket.values);
            next = bucket.next;
        }
        Ok(values)
    }

    pub fn put(&self, op: &mut AtomicOperation, value: Rid) -> Result<(), TreeError> {
        let mut entry = self.entry_point(&*op)?;
        if let Some(page) = entry.free_list_header {
            let mut bucket = self.read_bucket(&*op, page)?;
            let was_empty = bucket.values.is_empty();
            if !bucket.add_value(value) {
                return Err(TreeError::corrupted(
                    self.tree,
                    format!("null bucket {page} is on the free list but full"),
                ));
            }
            if was_empty {
                bucket.next = None;
                self.append_to_chain(op, &mut entry, page)?;
            }
            if bucket.is_full() {
                entry.free_list_header = bucket.next_free_list;
                bucket.next_free_list = None;
            }
            self.write_bucket(op, page, &bucket)?;
        } else {
            let page = entry.size + 1;
            let file_pages = op
                .filled_up_to(self.file_id)
                .map_err(TreeError::storage(self.tree))?;
            if page < file_pages {
                tracing::debug!("Index {} reuses null page {page}", self.tree);
            } else {
                let added = op
                    .add_page(self.file_id)
                    .map_err(TreeError::storage(self.tree))?;
                if added != page {
                    return Err(TreeError::corrupted(
                        self.tree,
                        format!("expected to append null page {page}, file appended {added}"),
                    ));
                }
                tracing::debug!("Index {} allocated null page {page}", self.tree);
            }
            let bucket = NullBucket {
                next: None,
                next_free_list: None,
                values: vec![value],
            };
            entry.size = page;
            entry.free_list_header = Some(page);
            self.append_to_chain(op, &mut entry, page)?;
            self.write_bucket(op, page, &bucket)?;
        }
        self.write_entry_point(op, &entry)
    }

    /// Remove one occurrence of `value`. Returns whether it was found.
    pub fn remove(&self, op: &mut AtomicOperation, value: Rid) -> Result<bool, TreeError> {
        let mut entry = self.entry_point(&*op)?;
        let mut previous: Option<PageIndex> = None;
        let mut next = entry.first_page;
        let mut hops = 0u32;
        while let Some(page) = next {
            hops += 1;
            if hops > entry.size {
                return Err(TreeError::corrupted(
                    self.tree,
                    format!("null bucket chain through page {page} loops"),
                ));
            }
            let mut bucket = self.read_bucket(&*op, page)?;
            let was_full = bucket.is_full();
            if !bucket.remove_value(value) {
                previous = Some(page);
                next = bucket.next;
                continue;
            }

            if was_full {
                bucket.next_free_list = entry.free_list_header;
                entry.free_list_header = Some(page);
            }
            if bucket.values.is_empty() {
                match previous {
                    Some(previous_page) => {
                        let mut before = self.read_bucket(&*op, previous_page)?;
                        before.next = bucket.next;
                        self.write_bucket(op, previous_page, &before)?;
                    }
                    None => entry.first_page = bucket.next,
                }
                if entry.last_page == Some(page) {
                    entry.last_page = previous;
                }
                bucket.next = None;
            }
            self.write_bucket(op, page, &bucket)?;
            self.write_entry_point(op, &entry)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Link `page` after the current tail of the chain.
    fn append_to_chain(
        &self,
        op: &mut AtomicOperation,
        entry: &mut NullEntryPoint,
        page: PageIndex,
    ) -> Result<(), TreeError> {
        match entry.last_page {
            Some(last) => {
                let mut tail = self.read_bucket(&*op, last)?;
                tail.next = Some(page);
                self.write_bucket(op, last, &tail)?;
            }
            None => entry.first_page = Some(page),
        }
        entry.last_page = Some(page);
        Ok(())
    }

    fn read_bucket<R: PageReader + ?Sized>(
        &self,
        reader: &R,
        page_index: PageIndex,
    ) -> Result<NullBucket, TreeError> {
        let page = reader
            .read_page(self.file_id, page_index)
            .map_err(TreeError::storage(self.tree))?;
        NullBucket::from_page(&page).ok_or_else(|| {
            TreeError::corrupted(self.tree, format!("page {page_index} is not a null bucket"))
        })
    }

    fn blank_page(&self) -> Result<Page, TreeError> {
        self.pool
            .lease_page_zeroed()
            .ok_or(StorageError::BufferPoolExhausted)
            .map_err(TreeError::storage(self.tree))
    }

    fn write_bucket(
        &self,
        op: &mut AtomicOperation,
        page_index: PageIndex,
        bucket: &NullBucket,
    ) -> Result<(), TreeError> {
        let mut page = self.blank_page()?;
        bucket.write_to_page(&mut page);
        op.write_page(self.file_id, page_index, &page)
            .map_err(TreeError::storage(self.tree))
    }

    fn write_entry_point(
        &self,
        op: &mut AtomicOperation,
        entry: &NullEntryPoint,
    ) -> Result<(), TreeError> {
        let mut page = self.blank_page()?;
        entry.write_to_page(&mut page);
        op.write_page(self.file_id, ENTRY_POINT_INDEX, &page)
            .map_err(TreeError::storage(self.tree))
    }
}
