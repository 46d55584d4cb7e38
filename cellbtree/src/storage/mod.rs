//! Page storage for the index.
//!
//! Every index lives in named files of 8KB pages behind a [`PageStore`].
//! Trees never write to the store directly: changes go through an
//! [`AtomicOperation`], which buffers them until it commits and logs redo
//! records for durable operations.
//!
//! # Layers
//!
//! - [`page`] and [`buffer_pool`]: page buffers and their checksummed header
//! - [`io`], [`file`] and [`memory`]: the store trait and its two implementations
//! - [`wal`] and [`atomic`]: the redo log and atomic operations over a store
//! - [`btree`]: the cell tree built on top

pub mod atomic;
pub mod btree;
pub mod buffer_pool;
pub mod file;
pub mod io;
pub mod memory;
pub mod page;
pub mod wal;

pub use atomic::{AtomicError, AtomicOperation, AtomicOperationsManager, ReadLockGuard};
pub use buffer_pool::BufferPool;
pub use file::FilePageStore;
pub use io::{FileId, PageReader, PageStore, StorageError};
pub use memory::{FaultConfig, MemoryPageStore};
pub use page::{PAGE_SIZE, Page, PageIndex};
pub use wal::{LogRecord, LogRecordPayload, RedoLog, RedoOperation, RedoRecord, WalError};
