//! File-backed page store.
//!
//! Each logical file is one OS file inside the store's directory. Pages are
//! sealed with a CRC32 checksum on write and verified on read.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::storage::buffer_pool::BufferPool;
use crate::storage::io::{FileId, PageReader, PageStore, StorageError};
use crate::storage::page::{PAGE_SIZE_U64, Page, PageIndex};

struct OpenFile {
    name: String,
    file: File,
    pages: u32,
}

impl OpenFile {
    const fn check_bounds(&self, file_id: FileId, page_index: PageIndex) -> Result<(), StorageError> {
        if page_index >= self.pages {
            return Err(StorageError::PageOutOfBounds {
                file_id,
                page_index,
                total_pages: self.pages,
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct FileTable {
    open: HashMap<FileId, OpenFile>,
    next_id: FileId,
}

impl FileTable {
    fn get_mut(&mut self, file_id: FileId) -> Result<&mut OpenFile, StorageError> {
        self.open
            .get_mut(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))
    }

    fn id_of(&self, name: &str) -> Option<FileId> {
        self.open
            .iter()
            .find_map(|(id, file)| (file.name == name).then_some(*id))
    }

    fn register(&mut self, name: &str, file: File, pages: u32) -> FileId {
        self.next_id += 1;
        let id = self.next_id;
        self.open.insert(
            id,
            OpenFile {
                name: name.to_string(),
                file,
                pages,
            },
        );
        id
    }
}

/// A page store over a directory of files.
pub struct FilePageStore {
    directory: PathBuf,
    buffer_pool: Arc<BufferPool>,
    files: Mutex<FileTable>,
}

impl FilePageStore {
    /// Open a store rooted at `directory`, creating the directory if needed.
    pub fn open(directory: &Path, buffer_pool: Arc<BufferPool>) -> Result<Self, StorageError> {
        std::fs::create_dir_all(directory)?;
        Ok(Self {
            directory: directory.to_path_buf(),
            buffer_pool,
            files: Mutex::new(FileTable::default()),
        })
    }

    /// Directory holding the store's files.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn table(&self) -> MutexGuard<'_, FileTable> {
        self.files.lock().expect("lock poisoned")
    }
}

impl PageReader for FilePageStore {
    fn read_page(&self, file_id: FileId, page_index: PageIndex) -> Result<Page, StorageError> {
        let mut page = self
            .buffer_pool
            .lease_page()
            .ok_or(StorageError::BufferPoolExhausted)?;

        let mut table = self.table();
        let open = table.get_mut(file_id)?;
        open.check_bounds(file_id, page_index)?;
        open.file
            .seek(SeekFrom::Start(u64::from(page_index) * PAGE_SIZE_U64))?;
        open.file.read_exact(page.as_bytes_mut())?;
        let verified = page.verify_checksum().map_err(|e| {
            StorageError::Corruption(format!("page {page_index} of {}: {e}", open.name))
        });
        drop(table);

        verified?;
        Ok(page)
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<u32, StorageError> {
        let mut table = self.table();
        Ok(table.get_mut(file_id)?.pages)
    }
}

impl PageStore for FilePageStore {
    fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    fn add_file(&self, name: &str) -> Result<FileId, StorageError> {
        let mut table = self.table();
        let path = self.path_of(name);
        if table.id_of(name).is_some() || path.exists() {
            return Err(StorageError::FileAlreadyExists(name.to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let id = table.register(name, file, 0);
        drop(table);
        tracing::debug!("Created file {} as {id}", path.display());
        Ok(id)
    }

    fn open_file(&self, name: &str) -> Result<FileId, StorageError> {
        let mut table = self.table();
        if let Some(id) = table.id_of(name) {
            return Ok(id);
        }

        let path = self.path_of(name);
        if !path.exists() {
            return Err(StorageError::FileNotFound(name.to_string()));
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len % PAGE_SIZE_U64 != 0 {
            return Err(StorageError::Corruption(format!(
                "{name} has length {len}, not a multiple of the page size"
            )));
        }
        let pages = u32::try_from(len / PAGE_SIZE_U64).map_err(|_| {
            StorageError::Corruption(format!("{name} has too many pages ({len} bytes)"))
        })?;
        Ok(table.register(name, file, pages))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.table().id_of(name).is_some() || self.path_of(name).exists()
    }

    fn close_file(&self, file_id: FileId) -> Result<(), StorageError> {
        let open = self
            .table()
            .open
            .remove(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))?;
        open.file.sync_all()?;
        Ok(())
    }

    fn delete_file(&self, file_id: FileId) -> Result<(), StorageError> {
        let open = self
            .table()
            .open
            .remove(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))?;
        drop(open.file);
        std::fs::remove_file(self.path_of(&open.name))?;
        tracing::debug!("Deleted file {}", open.name);
        Ok(())
    }

    fn write_page(
        &self,
        file_id: FileId,
        page_index: PageIndex,
        page: &Page,
    ) -> Result<(), StorageError> {
        let mut sealed = self
            .buffer_pool
            .lease_page()
            .ok_or(StorageError::BufferPoolExhausted)?;
        sealed.as_bytes_mut().copy_from_slice(page.as_bytes());
        sealed.seal();

        let mut table = self.table();
        let open = table.get_mut(file_id)?;
        open.check_bounds(file_id, page_index)?;
        open.file
            .seek(SeekFrom::Start(u64::from(page_index) * PAGE_SIZE_U64))?;
        open.file.write_all(sealed.as_bytes())?;
        drop(table);
        Ok(())
    }

    fn allocate_page(&self, file_id: FileId) -> Result<PageIndex, StorageError> {
        let mut table = self.table();
        let open = table.get_mut(file_id)?;
        let index = open.pages;
        open.file
            .set_len((u64::from(index) + 1) * PAGE_SIZE_U64)?;
        open.pages += 1;
        drop(table);
        Ok(index)
    }

    fn sync(&self, file_id: FileId) -> Result<(), StorageError> {
        self.table().get_mut(file_id)?.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{PageHeader, PageType};
    use tempfile::tempdir;

    fn create_store() -> (tempfile::TempDir, FilePageStore) {
        let dir = tempdir().expect("create temp dir");
        let store = FilePageStore::open(dir.path(), BufferPool::new(16)).expect("open store");
        (dir, store)
    }

    #[test]
    fn test_allocate_write_read() {
        let (_dir, store) = create_store();
        let file = store.add_file("tree.cbt").expect("add file");

        assert_eq!(store.allocate_page(file).expect("allocate"), 0);
        assert_eq!(store.allocate_page(file).expect("allocate"), 1);
        assert_eq!(store.filled_up_to(file).expect("length"), 2);

        let mut page = Page::new();
        PageHeader::init(&mut page, PageType::LeafBucket);
        page.write_u32(100, 0xABCD);
        store.write_page(file, 1, &page).expect("write");

        let read = store.read_page(file, 1).expect("read");
        assert_eq!(read.read_u32(100), 0xABCD);
        assert_eq!(read.page_type().expect("type"), PageType::LeafBucket);
    }

    #[test]
    fn test_out_of_bounds() {
        let (_dir, store) = create_store();
        let file = store.add_file("tree.cbt").expect("add file");

        let result = store.read_page(file, 0);
        assert!(matches!(
            result,
            Err(StorageError::PageOutOfBounds { page_index: 0, .. })
        ));
        assert!(store.write_page(file, 3, &Page::new()).is_err());
        assert!(store.read_page(file + 1, 0).is_err());
        assert_eq!(store.buffer_pool().pinned(), 0);

        // The file table is usable after every failure
        assert_eq!(store.allocate_page(file).expect("allocate"), 0);
        store.sync(file).expect("sync");
    }

    #[test]
    fn test_reopen_preserves_pages() {
        let (dir, store) = create_store();
        let file = store.add_file("tree.cbt").expect("add file");
        store.allocate_page(file).expect("allocate");
        let mut page = Page::new();
        PageHeader::init(&mut page, PageType::EntryPoint);
        page.write_i64(8, 1234);
        store.write_page(file, 0, &page).expect("write");
        store.close_file(file).expect("close");

        let store = FilePageStore::open(dir.path(), BufferPool::new(4)).expect("reopen");
        assert!(store.file_exists("tree.cbt"));
        let file = store.open_file("tree.cbt").expect("open file");
        assert_eq!(store.filled_up_to(file).expect("length"), 1);
        assert_eq!(store.read_page(file, 0).expect("read").read_i64(8), 1234);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let (dir, store) = create_store();
        let file = store.add_file("tree.cbt").expect("add file");
        store.allocate_page(file).expect("allocate");
        let mut page = Page::new();
        PageHeader::init(&mut page, PageType::LeafBucket);
        store.write_page(file, 0, &page).expect("write");
        store.close_file(file).expect("close");

        // Flip a byte in the body behind the store's back
        let path = dir.path().join("tree.cbt");
        let mut raw = std::fs::read(&path).expect("read raw");
        raw[4000] ^= 0xFF;
        std::fs::write(&path, raw).expect("write raw");

        let file = store.open_file("tree.cbt").expect("open file");
        assert!(matches!(
            store.read_page(file, 0),
            Err(StorageError::Corruption(_))
        ));
        assert_eq!(store.buffer_pool().pinned(), 0);
    }

    #[test]
    fn test_add_existing_and_delete() {
        let (dir, store) = create_store();
        let file = store.add_file("tree.nbt").expect("add file");
        assert!(matches!(
            store.add_file("tree.nbt"),
            Err(StorageError::FileAlreadyExists(_))
        ));

        store.delete_file(file).expect("delete");
        assert!(!store.file_exists("tree.nbt"));
        assert!(!dir.path().join("tree.nbt").exists());
        assert!(matches!(
            store.open_file("tree.nbt"),
            Err(StorageError::FileNotFound(_))
        ));
    }
}
