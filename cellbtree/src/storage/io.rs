//! Page store abstraction.
//!
//! The tree never touches files directly. It reads and writes whole pages
//! of named logical files through a [`PageStore`], which lets production
//! code run on real files and tests run on a fault-injecting in-memory
//! store.
//!
//! # Implementation Notes
//!
//! Implementations must ensure:
//! - `read_page` returns the last written content for a page
//! - `allocate_page` appends exactly one zeroed page and returns its index
//! - `filled_up_to` is the number of pages in the file
//! - pages returned by `read_page` are leased from `buffer_pool()`

use std::sync::Arc;

use crate::storage::buffer_pool::BufferPool;
use crate::storage::page::{Page, PageError, PageIndex};

/// Identifier of an open logical file inside a page store.
pub type FileId = u64;

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Page out of bounds.
    PageOutOfBounds {
        file_id: FileId,
        page_index: PageIndex,
        total_pages: u32,
    },
    /// No file with this name exists.
    FileNotFound(String),
    /// A file with this name already exists.
    FileAlreadyExists(String),
    /// The file id does not name an open file.
    UnknownFile(FileId),
    /// Injected fault for simulation.
    InjectedFault(String),
    /// Corruption detected.
    Corruption(String),
    /// Buffer pool exhausted - no buffers available.
    BufferPoolExhausted,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::PageOutOfBounds {
                file_id,
                page_index,
                total_pages,
            } => write!(
                f,
                "page {page_index} of file {file_id} out of bounds (total pages: {total_pages})"
            ),
            Self::FileNotFound(name) => write!(f, "file not found: {name}"),
            Self::FileAlreadyExists(name) => write!(f, "file already exists: {name}"),
            Self::UnknownFile(id) => write!(f, "unknown file id: {id}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::BufferPoolExhausted => write!(f, "buffer pool exhausted"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<PageError> for StorageError {
    fn from(e: PageError) -> Self {
        Self::Corruption(e.to_string())
    }
}

/// Read access to pages.
///
/// Implemented by every [`PageStore`] (committed state) and by an atomic
/// operation (committed state overlaid with the operation's own writes).
pub trait PageReader {
    /// Read a page. The returned page stays pinned until it is dropped.
    fn read_page(&self, file_id: FileId, page_index: PageIndex) -> Result<Page, StorageError>;

    /// Number of pages in the file.
    fn filled_up_to(&self, file_id: FileId) -> Result<u32, StorageError>;
}

/// Durable store of fixed-size pages grouped into named files.
pub trait PageStore: PageReader + Send + Sync {
    /// Get a reference to the buffer pool pages are leased from.
    fn buffer_pool(&self) -> &Arc<BufferPool>;

    /// Create a new empty file.
    fn add_file(&self, name: &str) -> Result<FileId, StorageError>;

    /// Open an existing file.
    fn open_file(&self, name: &str) -> Result<FileId, StorageError>;

    /// Whether a file with this name exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Flush and close a file. The id is invalid afterwards.
    fn close_file(&self, file_id: FileId) -> Result<(), StorageError>;

    /// Delete a file and its contents.
    fn delete_file(&self, file_id: FileId) -> Result<(), StorageError>;

    /// Write a page that already exists in the file.
    fn write_page(
        &self,
        file_id: FileId,
        page_index: PageIndex,
        page: &Page,
    ) -> Result<(), StorageError>;

    /// Append one zeroed page and return its index.
    fn allocate_page(&self, file_id: FileId) -> Result<PageIndex, StorageError>;

    /// Make previous writes to the file durable.
    fn sync(&self, file_id: FileId) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::PageOutOfBounds {
            file_id: 3,
            page_index: 10,
            total_pages: 4,
        };
        assert_eq!(
            err.to_string(),
            "page 10 of file 3 out of bounds (total pages: 4)"
        );

        let err = StorageError::from(PageError::InvalidPageType(0x7f));
        assert!(matches!(err, StorageError::Corruption(_)));
    }
}
