//! Atomic operations.
//!
//! An atomic operation groups the page changes of one or more index
//! mutations so they become visible together or not at all:
//! - page writes go to a private overlay and reach the store on commit
//! - appended pages are counted and allocated in the store on commit
//! - files created inside the operation are deleted again on rollback
//! - redo records are appended to the redo log, followed by a commit
//!   marker, before any page reaches the store
//!
//! The manager also provides the resource locks index code relies on. An
//! exclusive lock taken inside an operation is held until the operation
//! ends. Locks are owned by the acquiring thread, so a thread holding the
//! exclusive lock on a resource can still take read locks on it.
//!
//! An operation that is dropped without [`AtomicOperationsManager::end`]
//! is rolled back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::storage::io::{FileId, PageReader, PageStore, StorageError};
use crate::storage::page::{Page, PageIndex};
use crate::storage::wal::{LogRecord, LogRecordPayload, OperationId, RedoLog, RedoRecord, WalError};

#[derive(Default)]
struct ResourceLock {
    exclusive: Option<(OperationId, ThreadId)>,
    readers: HashMap<ThreadId, usize>,
}

impl ResourceLock {
    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.readers.is_empty()
    }
}

/// Named resource locks shared by all operations of a manager.
#[derive(Default)]
struct LockTable {
    resources: Mutex<HashMap<String, ResourceLock>>,
    released: Condvar,
}

impl LockTable {
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn table(&self) -> MutexGuard<'_, HashMap<String, ResourceLock>> {
        self.resources.lock().expect("lock poisoned")
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, HashMap<String, ResourceLock>>,
    ) -> MutexGuard<'a, HashMap<String, ResourceLock>> {
        self.released.wait(guard).expect("lock poisoned")
    }

    /// Take the exclusive lock for `op_id`. Returns false if it already held it.
    fn lock_exclusive(&self, op_id: OperationId, resource: &str) -> bool {
        let thread = thread::current().id();
        let mut table = self.table();
        loop {
            let entry = table.entry(resource.to_string()).or_default();
            match entry.exclusive {
                Some((owner, _)) if owner == op_id => return false,
                Some(_) => {}
                None => {
                    if entry.readers.keys().all(|reader| *reader == thread) {
                        entry.exclusive = Some((op_id, thread));
                        return true;
                    }
                }
            }
            table = self.wait(table);
        }
    }

    fn unlock_exclusive(&self, op_id: OperationId, resource: &str) {
        let mut table = self.table();
        if let Some(entry) = table.get_mut(resource) {
            if matches!(entry.exclusive, Some((owner, _)) if owner == op_id) {
                entry.exclusive = None;
            }
            if entry.is_free() {
                table.remove(resource);
            }
        }
        drop(table);
        self.released.notify_all();
    }

    fn lock_shared(&self, resource: &str) {
        let thread = thread::current().id();
        let mut table = self.table();
        loop {
            let entry = table.entry(resource.to_string()).or_default();
            let blocked = matches!(entry.exclusive, Some((_, owner)) if owner != thread);
            if !blocked {
                *entry.readers.entry(thread).or_insert(0) += 1;
                return;
            }
            table = self.wait(table);
        }
    }

    fn unlock_shared(&self, resource: &str) {
        let thread = thread::current().id();
        let mut table = self.table();
        if let Some(entry) = table.get_mut(resource) {
            if let Some(count) = entry.readers.get_mut(&thread) {
                *count -= 1;
                if *count == 0 {
                    entry.readers.remove(&thread);
                }
            }
            if entry.is_free() {
                table.remove(resource);
            }
        }
        drop(table);
        self.released.notify_all();
    }
}

/// Shared lock on a resource, released on drop.
///
/// The guard must be dropped on the thread that acquired it.
pub struct ReadLockGuard {
    locks: Arc<LockTable>,
    resource: String,
}

impl Drop for ReadLockGuard {
    fn drop(&mut self) {
        self.locks.unlock_shared(&self.resource);
    }
}

/// Pages appended to one file inside an operation.
#[derive(Debug, Clone, Copy)]
struct Appended {
    /// File length when the first page was appended.
    base: u32,
    count: u32,
}

/// One unit of atomic change.
pub struct AtomicOperation {
    id: OperationId,
    durable: bool,
    store: Arc<dyn PageStore>,
    locks: Arc<LockTable>,
    pages: HashMap<(FileId, PageIndex), Page>,
    appended: HashMap<FileId, Appended>,
    created_files: Vec<FileId>,
    deleted_files: Vec<FileId>,
    records: Vec<RedoRecord>,
    held_locks: Vec<String>,
    ended: bool,
}

impl AtomicOperation {
    #[must_use]
    pub const fn id(&self) -> OperationId {
        self.id
    }

    /// Whether commit writes the redo records to the log.
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        self.durable
    }

    /// Redo records collected so far.
    #[must_use]
    pub fn redo_records(&self) -> &[RedoRecord] {
        &self.records
    }

    /// Create a file. It is deleted again if the operation rolls back.
    pub fn add_file(&mut self, name: &str) -> Result<FileId, StorageError> {
        let file_id = self.store.add_file(name)?;
        self.created_files.push(file_id);
        Ok(file_id)
    }

    /// Delete a file when the operation commits.
    pub fn delete_file(&mut self, file_id: FileId) {
        self.pages.retain(|(file, _), _| *file != file_id);
        self.appended.remove(&file_id);
        self.deleted_files.push(file_id);
    }

    /// Append a zeroed page to a file and return its index.
    pub fn add_page(&mut self, file_id: FileId) -> Result<PageIndex, StorageError> {
        let base = self.store.filled_up_to(file_id)?;
        let appended = self
            .appended
            .entry(file_id)
            .or_insert(Appended { base, count: 0 });
        let index = appended.base + appended.count;
        appended.count += 1;
        self.pages.insert((file_id, index), Page::new());
        Ok(index)
    }

    /// Stage a page write. The page must already exist in the store or
    /// have been appended by this operation.
    pub fn write_page(
        &mut self,
        file_id: FileId,
        page_index: PageIndex,
        page: &Page,
    ) -> Result<(), StorageError> {
        let total_pages = self.filled_up_to(file_id)?;
        if page_index >= total_pages {
            return Err(StorageError::PageOutOfBounds {
                file_id,
                page_index,
                total_pages,
            });
        }
        self.pages
            .entry((file_id, page_index))
            .and_modify(|staged| staged.as_bytes_mut().copy_from_slice(page.as_bytes()))
            .or_insert_with(|| page.detached_copy());
        Ok(())
    }

    /// Record a logical change for the redo log.
    pub fn add_redo_record(&mut self, record: RedoRecord) {
        self.records.push(record);
    }

    fn touched_files(&self) -> Vec<FileId> {
        let mut files: Vec<FileId> = self.pages.keys().map(|(file, _)| *file).collect();
        files.sort_unstable();
        files.dedup();
        files
    }

    fn release_locks(&mut self) {
        for resource in self.held_locks.drain(..) {
            self.locks.unlock_exclusive(self.id, &resource);
        }
    }

    /// Drop staged changes and delete the files this operation created.
    fn discard(&mut self) {
        self.pages.clear();
        self.appended.clear();
        self.records.clear();
        self.deleted_files.clear();
        for file_id in self.created_files.drain(..) {
            if let Err(e) = self.store.delete_file(file_id) {
                tracing::warn!(
                    "Failed to delete file {file_id} created by rolled back operation {}: {e}",
                    self.id
                );
            }
        }
    }
}

impl PageReader for AtomicOperation {
    fn read_page(&self, file_id: FileId, page_index: PageIndex) -> Result<Page, StorageError> {
        match self.pages.get(&(file_id, page_index)) {
            Some(staged) => {
                let mut page = self
                    .store
                    .buffer_pool()
                    .lease_page()
                    .ok_or(StorageError::BufferPoolExhausted)?;
                page.as_bytes_mut().copy_from_slice(staged.as_bytes());
                Ok(page)
            }
            None => self.store.read_page(file_id, page_index),
        }
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<u32, StorageError> {
        self.appended.get(&file_id).map_or_else(
            || self.store.filled_up_to(file_id),
            |appended| Ok(appended.base + appended.count),
        )
    }
}

impl Drop for AtomicOperation {
    fn drop(&mut self) {
        if !self.ended {
            tracing::warn!("Atomic operation {} dropped without end, rolling back", self.id);
            self.discard();
            self.release_locks();
        }
    }
}

/// Errors that can occur while ending an atomic operation.
#[derive(Debug)]
pub enum AtomicError {
    /// Page store error.
    Storage(StorageError),
    /// Redo log error.
    Wal(WalError),
    /// The store appended a page at an unexpected index.
    AllocationMismatch {
        file_id: FileId,
        expected: PageIndex,
        actual: PageIndex,
    },
}

impl std::fmt::Display for AtomicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Wal(e) => write!(f, "redo log error: {e}"),
            Self::AllocationMismatch {
                file_id,
                expected,
                actual,
            } => write!(
                f,
                "file {file_id}: expected to append page {expected}, store appended {actual}"
            ),
        }
    }
}

impl std::error::Error for AtomicError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Wal(e) => Some(e),
            Self::AllocationMismatch { .. } => None,
        }
    }
}

impl From<StorageError> for AtomicError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<WalError> for AtomicError {
    fn from(e: WalError) -> Self {
        Self::Wal(e)
    }
}

/// Starts and ends atomic operations over one page store.
pub struct AtomicOperationsManager {
    store: Arc<dyn PageStore>,
    redo_log: Mutex<RedoLog>,
    locks: Arc<LockTable>,
    next_id: AtomicU64,
}

impl AtomicOperationsManager {
    /// Create a manager with an in-memory redo log.
    #[must_use]
    pub fn new(store: Arc<dyn PageStore>) -> Self {
        Self {
            store,
            redo_log: Mutex::new(RedoLog::in_memory()),
            locks: Arc::new(LockTable::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Create a manager that appends to an existing redo log.
    ///
    /// Operation ids continue after the highest id found in the log.
    pub fn with_redo_log(store: Arc<dyn PageStore>, mut redo_log: RedoLog) -> Result<Self, AtomicError> {
        let last_id = redo_log
            .read_all()?
            .iter()
            .map(|record| record.op_id)
            .max()
            .unwrap_or(0);
        Ok(Self {
            store,
            redo_log: Mutex::new(redo_log),
            locks: Arc::new(LockTable::default()),
            next_id: AtomicU64::new(last_id),
        })
    }

    /// The page store operations apply to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn log(&self) -> MutexGuard<'_, RedoLog> {
        self.redo_log.lock().expect("lock poisoned")
    }

    /// Start an operation.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn begin(&self, durable: bool) -> AtomicOperation {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        AtomicOperation {
            id,
            durable,
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
            pages: HashMap::new(),
            appended: HashMap::new(),
            created_files: Vec::new(),
            deleted_files: Vec::new(),
            records: Vec::new(),
            held_locks: Vec::new(),
            ended: false,
        }
    }

    /// Commit or roll back an operation. Its locks are released either way.
    pub fn end(&self, mut op: AtomicOperation, rollback: bool) -> Result<(), AtomicError> {
        op.ended = true;
        let result = if rollback {
            tracing::warn!("Rolling back atomic operation {}", op.id);
            op.discard();
            Ok(())
        } else {
            self.commit(&mut op)
        };
        if let Err(e) = &result {
            tracing::error!("Failed to commit atomic operation {}: {e}", op.id);
        }
        op.release_locks();
        result
    }

    fn commit(&self, op: &mut AtomicOperation) -> Result<(), AtomicError> {
        if op.durable && !op.records.is_empty() {
            let mut log = self.log();
            for record in op.records.drain(..) {
                log.append(op.id, LogRecordPayload::change(record))?;
            }
            log.append(op.id, LogRecordPayload::Commit)?;
            log.sync()?;
        }

        let mut appended: Vec<(FileId, Appended)> = op.appended.drain().collect();
        appended.sort_unstable_by_key(|(file, _)| *file);
        for (file_id, pages) in appended {
            for offset in 0..pages.count {
                let expected = pages.base + offset;
                let actual = self.store.allocate_page(file_id)?;
                if actual != expected {
                    return Err(AtomicError::AllocationMismatch {
                        file_id,
                        expected,
                        actual,
                    });
                }
            }
        }

        let touched = op.touched_files();
        let mut pages: Vec<((FileId, PageIndex), Page)> = op.pages.drain().collect();
        pages.sort_unstable_by_key(|(key, _)| *key);
        for ((file_id, page_index), page) in &pages {
            self.store.write_page(*file_id, *page_index, page)?;
        }
        if op.durable {
            for file_id in touched {
                self.store.sync(file_id)?;
            }
        }

        for file_id in op.deleted_files.drain(..) {
            self.store.delete_file(file_id)?;
        }
        op.created_files.clear();
        Ok(())
    }

    /// Take the exclusive lock on `resource` for the rest of `op`.
    ///
    /// Blocks while another operation holds it or another thread reads it.
    pub fn acquire_exclusive_lock_until_commit(&self, op: &mut AtomicOperation, resource: &str) {
        if self.locks.lock_exclusive(op.id, resource) {
            op.held_locks.push(resource.to_string());
        }
    }

    /// Take a shared lock on `resource`.
    ///
    /// Blocks while another thread holds the exclusive lock.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn acquire_read_lock(&self, resource: &str) -> ReadLockGuard {
        self.locks.lock_shared(resource);
        ReadLockGuard {
            locks: Arc::clone(&self.locks),
            resource: resource.to_string(),
        }
    }

    /// Every readable record in the redo log.
    pub fn redo_records(&self) -> Result<Vec<LogRecord>, AtomicError> {
        Ok(self.log().read_all()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer_pool::BufferPool;
    use crate::storage::memory::MemoryPageStore;
    use crate::storage::wal::RedoOperation;
    use crate::types::rid::Rid;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn manager() -> (Arc<MemoryPageStore>, AtomicOperationsManager) {
        let store = Arc::new(MemoryPageStore::new(1, BufferPool::new(32)));
        let manager = AtomicOperationsManager::new(store.clone());
        (store, manager)
    }

    fn page_with(value: u32) -> Page {
        let mut page = Page::new();
        page.write_u32(100, value);
        page
    }

    fn redo(position: i64) -> RedoRecord {
        RedoRecord {
            operation: RedoOperation::Put,
            index_id: 1,
            key_serializer_id: 10,
            encryption_name: None,
            serialized_key: Some(vec![1, 2, 3]),
            value: Rid::new(1, position),
        }
    }

    #[test]
    fn test_commit_applies_staged_pages() {
        let (store, manager) = manager();
        let file = store.add_file("t.cbt").expect("add file");
        store.allocate_page(file).expect("allocate");

        let mut op = manager.begin(false);
        op.write_page(file, 0, &page_with(1)).expect("write");
        assert_eq!(op.add_page(file).expect("add page"), 1);
        assert_eq!(op.add_page(file).expect("add page"), 2);
        op.write_page(file, 2, &page_with(3)).expect("write");

        // Visible inside the operation only
        assert_eq!(op.filled_up_to(file).expect("length"), 3);
        assert_eq!(op.read_page(file, 2).expect("read").read_u32(100), 3);
        assert_eq!(store.filled_up_to(file).expect("length"), 1);
        assert_eq!(store.read_page(file, 0).expect("read").read_u32(100), 0);

        manager.end(op, false).expect("commit");
        assert_eq!(store.filled_up_to(file).expect("length"), 3);
        assert_eq!(store.read_page(file, 0).expect("read").read_u32(100), 1);
        assert_eq!(store.read_page(file, 1).expect("read").read_u32(100), 0);
        assert_eq!(store.read_page(file, 2).expect("read").read_u32(100), 3);
        assert_eq!(store.buffer_pool().pinned(), 0);
    }

    #[test]
    fn test_write_past_end_is_rejected() {
        let (store, manager) = manager();
        let file = store.add_file("t.cbt").expect("add file");
        let mut op = manager.begin(false);
        assert!(matches!(
            op.write_page(file, 0, &Page::new()),
            Err(StorageError::PageOutOfBounds { .. })
        ));
        manager.end(op, true).expect("rollback");
    }

    #[test]
    fn test_rollback_discards_changes_and_created_files() {
        let (store, manager) = manager();
        let existing = store.add_file("a.cbt").expect("add file");
        store.allocate_page(existing).expect("allocate");

        let mut op = manager.begin(true);
        let created = op.add_file("b.cbt").expect("add file");
        op.add_page(created).expect("add page");
        op.write_page(existing, 0, &page_with(9)).expect("write");
        op.add_redo_record(redo(1));
        manager.end(op, true).expect("rollback");

        assert!(!store.file_exists("b.cbt"));
        assert_eq!(store.read_page(existing, 0).expect("read").read_u32(100), 0);
        assert!(manager.redo_records().expect("records").is_empty());
    }

    #[test]
    fn test_drop_without_end_rolls_back() {
        let (store, manager) = manager();
        {
            let mut op = manager.begin(false);
            op.add_file("c.cbt").expect("add file");
            manager.acquire_exclusive_lock_until_commit(&mut op, "c");
        }
        assert!(!store.file_exists("c.cbt"));

        // The lock was released with the dropped operation
        let mut op = manager.begin(false);
        manager.acquire_exclusive_lock_until_commit(&mut op, "c");
        manager.end(op, false).expect("commit");
    }

    #[test]
    fn test_durable_commit_logs_records_then_marker() {
        let (store, manager) = manager();
        let file = store.add_file("t.cbt").expect("add file");

        let mut op = manager.begin(true);
        let id = op.id();
        op.add_page(file).expect("add page");
        op.add_redo_record(redo(1));
        op.add_redo_record(redo(2));
        manager.end(op, false).expect("commit");

        let mut silent = manager.begin(false);
        silent.add_redo_record(redo(3));
        manager.end(silent, false).expect("commit");

        let records = manager.redo_records().expect("records");
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.op_id == id));
        assert_eq!(records[1].payload.redo(), Some(&redo(2)));
        assert_eq!(records[2].payload, LogRecordPayload::Commit);
    }

    #[test]
    fn test_deleted_file_removed_on_commit() {
        let (store, manager) = manager();
        let file = store.add_file("d.cbt").expect("add file");

        let mut op = manager.begin(false);
        op.delete_file(file);
        assert!(store.file_exists("d.cbt"));
        manager.end(op, false).expect("commit");
        assert!(!store.file_exists("d.cbt"));
    }

    #[test]
    fn test_exclusive_lock_blocks_other_threads_until_end() {
        let (_store, manager) = manager();
        let mut op = manager.begin(false);
        manager.acquire_exclusive_lock_until_commit(&mut op, "idx");

        // Same thread may still read
        drop(manager.acquire_read_lock("idx"));

        let reader_done = AtomicBool::new(false);
        thread::scope(|scope| {
            let handle = scope.spawn(|| {
                let _guard = manager.acquire_read_lock("idx");
                reader_done.store(true, Ordering::SeqCst);
            });

            thread::sleep(Duration::from_millis(50));
            assert!(!reader_done.load(Ordering::SeqCst));

            manager.end(op, false).expect("commit");
            handle.join().expect("reader thread");
        });
        assert!(reader_done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_exclusive_lock_is_reentrant_within_operation() {
        let (_store, manager) = manager();
        let mut op = manager.begin(false);
        manager.acquire_exclusive_lock_until_commit(&mut op, "idx");
        manager.acquire_exclusive_lock_until_commit(&mut op, "idx");
        assert_eq!(op.held_locks.len(), 1);
        manager.end(op, false).expect("commit");
    }

    #[test]
    fn test_with_redo_log_continues_operation_ids() {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(1, BufferPool::new(4)));
        let mut log = RedoLog::in_memory();
        log.append(41, LogRecordPayload::Commit).expect("append");

        let manager = AtomicOperationsManager::with_redo_log(store, log).expect("manager");
        let op = manager.begin(false);
        assert_eq!(op.id(), 42);
        manager.end(op, false).expect("commit");
    }
}
