//! In-memory page store for deterministic testing.
//!
//! This store keeps every file in memory and supports fault injection:
//! - Page-level read/write errors
//! - Sync failures
//!
//! Faults are drawn from a seeded RNG, so the same seed and the same
//! sequence of calls produce the same faults.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::buffer_pool::BufferPool;
use crate::storage::io::{FileId, PageReader, PageStore, StorageError};
use crate::storage::page::{PAGE_SIZE, Page, PageIndex};

/// Configuration for fault injection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Fail a fraction of page reads only.
    ///
    /// Read faults abort an operation before anything reaches the store,
    /// which makes them the right tool for rollback tests.
    #[must_use]
    pub const fn read_faults(rate: f64) -> Self {
        Self {
            read_error_rate: rate,
            write_error_rate: 0.0,
            sync_error_rate: 0.0,
        }
    }
}

/// Statistics about store operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStoreStats {
    /// Number of page reads.
    pub reads: u64,
    /// Number of page writes.
    pub writes: u64,
    /// Number of pages appended.
    pub allocations: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
    /// Number of injected sync errors.
    pub injected_sync_errors: u64,
}

struct MemoryFile {
    name: String,
    pages: Vec<Box<[u8; PAGE_SIZE]>>,
}

struct MemoryState {
    files: HashMap<FileId, MemoryFile>,
    next_id: FileId,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: MemoryStoreStats,
}

impl MemoryState {
    fn file(&self, file_id: FileId) -> Result<&MemoryFile, StorageError> {
        self.files
            .get(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))
    }

    fn file_mut(&mut self, file_id: FileId) -> Result<&mut MemoryFile, StorageError> {
        self.files
            .get_mut(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))
    }

    fn id_of(&self, name: &str) -> Option<FileId> {
        self.files
            .iter()
            .find_map(|(id, file)| (file.name == name).then_some(*id))
    }

    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }
}

/// In-memory page store.
///
/// Files stay addressable by name after `close_file`, so a tree can be
/// closed and loaded again within one store.
pub struct MemoryPageStore {
    buffer_pool: Arc<BufferPool>,
    state: Mutex<MemoryState>,
}

impl MemoryPageStore {
    /// Create a new store with the given seed and no faults.
    #[must_use]
    pub fn new(seed: u64, buffer_pool: Arc<BufferPool>) -> Self {
        Self::with_config(seed, buffer_pool, FaultConfig::default())
    }

    /// Create a new store with custom fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, buffer_pool: Arc<BufferPool>, fault_config: FaultConfig) -> Self {
        Self {
            buffer_pool,
            state: Mutex::new(MemoryState {
                files: HashMap::new(),
                next_id: 0,
                fault_config,
                rng: StdRng::seed_from_u64(seed),
                stats: MemoryStoreStats::default(),
            }),
        }
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Get the current statistics.
    #[must_use]
    pub fn stats(&self) -> MemoryStoreStats {
        self.state().stats
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) {
        self.state().fault_config = config;
    }

    /// Deep copy of every file, sharing the buffer pool and fault-free.
    ///
    /// File ids and names are preserved, so a copy taken before a crash can
    /// be reopened by name.
    #[must_use]
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn snapshot(&self, seed: u64) -> Self {
        let state = self.state();
        let files = state
            .files
            .iter()
            .map(|(id, file)| {
                (
                    *id,
                    MemoryFile {
                        name: file.name.clone(),
                        pages: file.pages.clone(),
                    },
                )
            })
            .collect();
        Self {
            buffer_pool: Arc::clone(&self.buffer_pool),
            state: Mutex::new(MemoryState {
                files,
                next_id: state.next_id,
                fault_config: FaultConfig::default(),
                rng: StdRng::seed_from_u64(seed),
                stats: MemoryStoreStats::default(),
            }),
        }
    }
}

impl PageReader for MemoryPageStore {
    fn read_page(&self, file_id: FileId, page_index: PageIndex) -> Result<Page, StorageError> {
        let mut page = self
            .buffer_pool
            .lease_page()
            .ok_or(StorageError::BufferPoolExhausted)?;

        let mut state = self.state();
        state.stats.reads += 1;

        let read_error_rate = state.fault_config.read_error_rate;
        if state.should_inject_fault(read_error_rate) {
            state.stats.injected_read_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated read error".to_string(),
            ));
        }

        let file = state.file(file_id)?;
        let total_pages = page_count(file);
        let data = file
            .pages
            .get(page_index as usize)
            .ok_or(StorageError::PageOutOfBounds {
                file_id,
                page_index,
                total_pages,
            })?;
        page.as_bytes_mut().copy_from_slice(&data[..]);
        drop(state);
        Ok(page)
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<u32, StorageError> {
        Ok(page_count(self.state().file(file_id)?))
    }
}

impl PageStore for MemoryPageStore {
    fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    fn add_file(&self, name: &str) -> Result<FileId, StorageError> {
        let mut state = self.state();
        if state.id_of(name).is_some() {
            return Err(StorageError::FileAlreadyExists(name.to_string()));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.files.insert(
            id,
            MemoryFile {
                name: name.to_string(),
                pages: Vec::new(),
            },
        );
        drop(state);
        Ok(id)
    }

    fn open_file(&self, name: &str) -> Result<FileId, StorageError> {
        self.state()
            .id_of(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.state().id_of(name).is_some()
    }

    fn close_file(&self, file_id: FileId) -> Result<(), StorageError> {
        self.state().file(file_id).map(|_| ())
    }

    fn delete_file(&self, file_id: FileId) -> Result<(), StorageError> {
        self.state()
            .files
            .remove(&file_id)
            .map(|_| ())
            .ok_or(StorageError::UnknownFile(file_id))
    }

    fn write_page(
        &self,
        file_id: FileId,
        page_index: PageIndex,
        page: &Page,
    ) -> Result<(), StorageError> {
        let mut state = self.state();
        state.stats.writes += 1;

        let write_error_rate = state.fault_config.write_error_rate;
        if state.should_inject_fault(write_error_rate) {
            state.stats.injected_write_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated write error".to_string(),
            ));
        }

        let file = state.file_mut(file_id)?;
        let total_pages = page_count(file);
        let slot = file
            .pages
            .get_mut(page_index as usize)
            .ok_or(StorageError::PageOutOfBounds {
                file_id,
                page_index,
                total_pages,
            })?;
        slot.copy_from_slice(page.as_bytes());
        drop(state);
        Ok(())
    }

    fn allocate_page(&self, file_id: FileId) -> Result<PageIndex, StorageError> {
        let mut state = self.state();
        state.stats.allocations += 1;
        let file = state.file_mut(file_id)?;
        let index = page_count(file);
        file.pages.push(Box::new([0u8; PAGE_SIZE]));
        drop(state);
        Ok(index)
    }

    fn sync(&self, file_id: FileId) -> Result<(), StorageError> {
        let mut state = self.state();
        state.stats.syncs += 1;
        state.file(file_id)?;

        let sync_error_rate = state.fault_config.sync_error_rate;
        if state.should_inject_fault(sync_error_rate) {
            state.stats.injected_sync_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }
        drop(state);
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)] // files never exceed u32::MAX pages
const fn page_count(file: &MemoryFile) -> u32 {
    file.pages.len() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryPageStore {
        MemoryPageStore::new(42, BufferPool::new(8))
    }

    #[test]
    fn test_write_and_read_back() {
        let store = store();
        let file = store.add_file("a.cbt").expect("add file");
        assert_eq!(store.allocate_page(file).expect("allocate"), 0);

        let mut page = Page::new();
        page.write_u32(20, 77);
        store.write_page(file, 0, &page).expect("write");

        let read = store.read_page(file, 0).expect("read");
        assert_eq!(read.read_u32(20), 77);
        assert_eq!(store.buffer_pool().pinned(), 1);
        drop(read);
        assert_eq!(store.buffer_pool().pinned(), 0);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let store = store();
        let file = store.add_file("a.cbt").expect("add file");
        store.allocate_page(file).expect("allocate");

        let copy = store.snapshot(1);
        let mut page = Page::new();
        page.write_u32(20, 5);
        store.write_page(file, 0, &page).expect("write");
        store.allocate_page(file).expect("allocate");

        let copy_file = copy.open_file("a.cbt").expect("open in copy");
        assert_eq!(copy_file, file);
        assert_eq!(copy.filled_up_to(copy_file).expect("length"), 1);
        assert_eq!(copy.read_page(copy_file, 0).expect("read").read_u32(20), 0);
    }

    #[test]
    fn test_fault_injection_is_deterministic() {
        let run = |seed| {
            let store = MemoryPageStore::with_config(
                seed,
                BufferPool::new(4),
                FaultConfig::read_faults(0.5),
            );
            let file = store.add_file("a.cbt").expect("add file");
            store.allocate_page(file).expect("allocate");
            (0..32)
                .map(|_| store.read_page(file, 0).is_ok())
                .collect::<Vec<_>>()
        };

        let first = run(7);
        assert_eq!(first, run(7));
        assert!(first.iter().any(|ok| *ok));
        assert!(first.iter().any(|ok| !*ok));
    }

    #[test]
    fn test_failed_reads_release_buffers() {
        let store = MemoryPageStore::with_config(
            3,
            BufferPool::new(4),
            FaultConfig::read_faults(0.5),
        );
        let file = store.add_file("a.cbt").expect("add file");
        store.allocate_page(file).expect("allocate");

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..64 {
                        let _ = store.read_page(file, 0);
                        assert!(store.read_page(file, 9).is_err());
                    }
                });
            }
        });
        assert_eq!(store.buffer_pool().pinned(), 0);
        assert!(store.stats().injected_read_errors > 0);
        store.sync(file).expect("sync");
    }

    #[test]
    fn test_delete_file_forgets_name() {
        let store = store();
        let file = store.add_file("a.nbt").expect("add file");
        assert!(store.file_exists("a.nbt"));
        store.delete_file(file).expect("delete");
        assert!(!store.file_exists("a.nbt"));
        assert!(store.read_page(file, 0).is_err());
    }
}
