//! Multi-value cell tree.
//!
//! A B+-tree mapping a key to any number of [`Rid`]s. All leaves form one
//! doubly linked chain ordered by key, which cursors walk in batches.
//!
//! # Files
//!
//! - `<name>.cbt`: page 0 is the [`EntryPoint`], page 1 the root bucket,
//!   every other page a leaf or non-leaf bucket
//! - `<name>.nbt`: the null-key side list (see [`NullList`])
//!
//! # Splitting
//!
//! A value that does not fit its leaf splits the leaf, pushing a separator
//! into the parent. A parent without room for the separator is split
//! first, so splits run bottom-up from the highest level that has room.
//! Splitting the root rewrites page 1 in place and is the only way the
//! tree grows taller.
//!
//! A leaf holding a single key whose value list fills the page is split
//! by halving the value list. The key then lives in two adjacent leaves,
//! so lookups and removals also consult the boundary cells of the
//! neighbouring leaves.
//!
//! Buckets are never merged. Emptied leaves stay in the chain.

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::TreeConfig;
use crate::storage::atomic::{AtomicOperation, AtomicOperationsManager};
use crate::storage::btree::bucket::{
    self, Bucket, LeafBucket, LeafCell, NonLeafBucket, NonLeafCell,
};
use crate::storage::btree::cursor::Boundary;
use crate::storage::btree::entry_point::EntryPoint;
use crate::storage::btree::error::TreeError;
use crate::storage::btree::null_bucket::NullEntryPoint;
use crate::storage::btree::null_list::NullList;
use crate::storage::io::{FileId, PageReader, PageStore, StorageError};
use crate::storage::page::{Page, PageIndex};
use crate::storage::wal::{RedoOperation, RedoRecord};
use crate::types::encryption::{Encryption, open_key, seal_key};
use crate::types::key::{IndexKey, KeyType};
use crate::types::rid::Rid;
use crate::types::serializer::{KeyError, KeySerializer};

/// Extension of the main tree file.
pub const DATA_FILE_EXTENSION: &str = ".cbt";

/// Extension of the null-key file.
pub const NULL_FILE_EXTENSION: &str = ".nbt";

/// Page of the main file holding the entry point.
pub const ENTRY_POINT_INDEX: PageIndex = 0;

/// Page of the main file holding the root bucket.
pub const ROOT_INDEX: PageIndex = 1;

#[must_use]
pub fn data_file_name(name: &str) -> String {
    format!("{name}{DATA_FILE_EXTENSION}")
}

#[must_use]
pub fn null_file_name(name: &str) -> String {
    format!("{name}{NULL_FILE_EXTENSION}")
}

/// How keys of a tree are typed, encoded and protected.
pub struct KeyDefinition<S> {
    pub serializer: S,
    /// Declared type of each key component. Empty means no coercion.
    pub key_types: Vec<KeyType>,
    /// Number of components of a full key.
    pub key_size: usize,
    pub encryption: Option<Arc<dyn Encryption>>,
}

impl<S> KeyDefinition<S> {
    #[must_use]
    pub const fn new(serializer: S, key_size: usize) -> Self {
        Self {
            serializer,
            key_types: Vec::new(),
            key_size,
            encryption: None,
        }
    }

    #[must_use]
    pub fn with_key_types(mut self, key_types: Vec<KeyType>) -> Self {
        self.key_types = key_types;
        self
    }

    #[must_use]
    pub fn with_encryption(mut self, encryption: Arc<dyn Encryption>) -> Self {
        self.encryption = Some(encryption);
        self
    }
}

/// Size and shape of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of key/value pairs, null keys included.
    pub size: u64,
    /// Number of bucket levels, 1 for a tree whose root is a leaf.
    pub depth: usize,
    /// Pages in the main file.
    pub file_pages: u32,
    /// Highest page index handed out to a bucket.
    pub pages_size: u32,
    /// Buckets ever allocated in the null file.
    pub null_pages: u32,
}

/// One level of a root-to-leaf path.
///
/// `index` is the cell position in a leaf, and the position a separator
/// coming from the child would take in a non-leaf bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct PathItem {
    pub(super) page: PageIndex,
    pub(super) index: usize,
}

/// Result of descending to the leaf responsible for a key.
pub(super) struct LeafSearch {
    pub(super) path: Vec<PathItem>,
    pub(super) leaf: LeafBucket,
    pub(super) found: Result<usize, usize>,
}

impl LeafSearch {
    pub(super) fn page(&self) -> PageIndex {
        self.path.last().map_or(ROOT_INDEX, |item| item.page)
    }
}

/// Direction along the leaf chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Direction {
    Left,
    Right,
}

impl Direction {
    pub(super) const fn next(self, leaf: &LeafBucket) -> Option<PageIndex> {
        match self {
            Self::Left => leaf.left_sibling,
            Self::Right => leaf.right_sibling,
        }
    }

    /// Cell of `leaf` adjacent to the bucket we came from.
    fn boundary(self, leaf: &LeafBucket) -> Option<usize> {
        match self {
            Self::Left => leaf.cells.len().checked_sub(1),
            Self::Right => (!leaf.cells.is_empty()).then_some(0),
        }
    }
}

/// Neighbours that may hold the rest of a key split across leaves.
pub(super) fn scan_directions(
    leaf: &LeafBucket,
    found: Result<usize, usize>,
) -> impl Iterator<Item = Direction> + use<> {
    let len = leaf.cells.len();
    let (at_start, at_end) = match found {
        Ok(index) => (index == 0, index + 1 == len),
        Err(index) => (index == 0, index == len),
    };
    [(at_start, Direction::Left), (at_end, Direction::Right)]
        .into_iter()
        .filter_map(|(hit, direction)| hit.then_some(direction))
}

struct EncodedKey<K> {
    key: K,
    /// Serializer output, recorded in redo records.
    serialized: Vec<u8>,
    /// Form stored in buckets, encrypted if the tree encrypts keys.
    stored: Vec<u8>,
}

/// Run `f` inside an atomic operation, committing on success and rolling
/// back on error.
pub(super) fn atomic<T>(
    manager: &AtomicOperationsManager,
    durable: bool,
    f: impl FnOnce(&mut AtomicOperation) -> Result<T, TreeError>,
) -> Result<T, TreeError> {
    let mut op = manager.begin(durable);
    match f(&mut op) {
        Ok(value) => {
            manager.end(op, false)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(end_error) = manager.end(op, true) {
                tracing::error!("Failed to roll back atomic operation: {end_error}");
            }
            Err(e)
        }
    }
}

/// A multi-value index stored as a cell tree.
pub struct CellBTree<K, S> {
    pub(super) name: String,
    index_id: u32,
    file_id: FileId,
    null_file_id: FileId,
    pub(super) key_def: KeyDefinition<S>,
    pub(super) config: TreeConfig,
    pub(super) manager: Arc<AtomicOperationsManager>,
    lock: RwLock<()>,
    _key: PhantomData<fn() -> K>,
}

impl<K: IndexKey, S: KeySerializer<K>> CellBTree<K, S> {
    /// Create the files of a new, empty tree.
    pub fn create(
        manager: Arc<AtomicOperationsManager>,
        name: &str,
        index_id: u32,
        key_def: KeyDefinition<S>,
        config: TreeConfig,
    ) -> Result<Self, TreeError> {
        config.validate()?;
        let (file_id, null_file_id) = atomic(&manager, false, |op| {
            let file_id = op.add_file(&data_file_name(name)).map_err(TreeError::storage(name))?;
            let null_file_id = op.add_file(&null_file_name(name)).map_err(TreeError::storage(name))?;

            let mut page = manager
                .store()
                .buffer_pool()
                .lease_page_zeroed()
                .ok_or(StorageError::BufferPoolExhausted)
                .map_err(TreeError::storage(name))?;

            let entry_index = op.add_page(file_id).map_err(TreeError::storage(name))?;
            EntryPoint::init().write_to_page(&mut page);
            op.write_page(file_id, entry_index, &page).map_err(TreeError::storage(name))?;

            let root_index = op.add_page(file_id).map_err(TreeError::storage(name))?;
            Bucket::Leaf(LeafBucket::new()).write_to_page(&mut page);
            op.write_page(file_id, root_index, &page).map_err(TreeError::storage(name))?;

            let null_entry_index = op.add_page(null_file_id).map_err(TreeError::storage(name))?;
            page.as_bytes_mut().fill(0);
            NullEntryPoint::init().write_to_page(&mut page);
            op.write_page(null_file_id, null_entry_index, &page)
                .map_err(TreeError::storage(name))?;

            if (entry_index, root_index, null_entry_index) != (ENTRY_POINT_INDEX, ROOT_INDEX, 0) {
                return Err(TreeError::corrupted(name, "new index files are not empty"));
            }
            Ok((file_id, null_file_id))
        })?;

        tracing::info!("Created index {name} (id {index_id})");
        Ok(Self::new(
            manager,
            name,
            index_id,
            file_id,
            null_file_id,
            key_def,
            config,
        ))
    }

    /// Open the files of an existing tree.
    pub fn load(
        manager: Arc<AtomicOperationsManager>,
        name: &str,
        index_id: u32,
        key_def: KeyDefinition<S>,
        config: TreeConfig,
    ) -> Result<Self, TreeError> {
        config.validate()?;
        let store = manager.store();
        let file_id = store
            .open_file(&data_file_name(name))
            .map_err(TreeError::storage(name))?;
        let null_file_id = store
            .open_file(&null_file_name(name))
            .map_err(TreeError::storage(name))?;

        let tree = Self::new(
            manager,
            name,
            index_id,
            file_id,
            null_file_id,
            key_def,
            config,
        );
        let entry = tree.read_entry_point(tree.store())?;
        tree.null_list().entry_point(tree.store())?;
        tracing::info!(
            "Loaded index {name} (id {index_id}): {} entries, {} bucket pages",
            entry.tree_size,
            entry.pages_size
        );
        Ok(tree)
    }

    fn new(
        manager: Arc<AtomicOperationsManager>,
        name: &str,
        index_id: u32,
        file_id: FileId,
        null_file_id: FileId,
        key_def: KeyDefinition<S>,
        config: TreeConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            index_id,
            file_id,
            null_file_id,
            key_def,
            config,
            manager,
            lock: RwLock::new(()),
            _key: PhantomData,
        }
    }

    /// Close both files. The tree can be loaded again afterwards.
    pub fn close(self) -> Result<(), TreeError> {
        let store = self.store();
        store
            .close_file(self.file_id)
            .map_err(TreeError::storage(&self.name))?;
        store
            .close_file(self.null_file_id)
            .map_err(TreeError::storage(&self.name))?;
        tracing::info!("Closed index {}", self.name);
        Ok(())
    }

    /// Delete both files of the tree.
    pub fn delete(self) -> Result<(), TreeError> {
        atomic(&self.manager, false, |op| {
            self.manager
                .acquire_exclusive_lock_until_commit(op, &self.name);
            op.delete_file(self.file_id);
            op.delete_file(self.null_file_id);
            Ok(())
        })?;
        tracing::info!("Deleted index {}", self.name);
        Ok(())
    }

    /// Delete the files of a tree that was never loaded. Missing files are skipped.
    pub fn delete_without_load(
        manager: &AtomicOperationsManager,
        name: &str,
    ) -> Result<(), TreeError> {
        atomic(manager, false, |op| {
            manager.acquire_exclusive_lock_until_commit(op, name);
            let store = manager.store();
            for file_name in [data_file_name(name), null_file_name(name)] {
                if store.file_exists(&file_name) {
                    let file_id = store
                        .open_file(&file_name)
                        .map_err(TreeError::storage(name))?;
                    op.delete_file(file_id);
                }
            }
            Ok(())
        })?;
        tracing::info!("Deleted index {name} without loading it");
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn index_id(&self) -> u32 {
        self.index_id
    }

    /// Number of components of a full key.
    #[must_use]
    pub const fn key_size(&self) -> usize {
        self.key_def.key_size
    }

    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Manager the tree runs its atomic operations through.
    #[must_use]
    pub const fn manager(&self) -> &Arc<AtomicOperationsManager> {
        &self.manager
    }

    /// Every value stored under `key`. `None` is the null key.
    pub fn get(&self, key: Option<K>) -> Result<Vec<Rid>, TreeError> {
        let _lock = self.manager.acquire_read_lock(&self.name);
        let _guard = self.read_guard();
        match key {
            None => self.null_list().get(self.store()),
            Some(key) => {
                let key = self.preprocess(key)?;
                self.get_values(self.store(), &key)
            }
        }
    }

    /// Whether any value is stored under `key`.
    pub fn contains(&self, key: Option<K>) -> Result<bool, TreeError> {
        Ok(!self.get(key)?.is_empty())
    }

    /// Number of key/value pairs, null keys included.
    pub fn size(&self) -> Result<u64, TreeError> {
        let _lock = self.manager.acquire_read_lock(&self.name);
        let _guard = self.read_guard();
        let entry = self.read_entry_point(self.store())?;
        self.tree_size(&entry)
    }

    /// Smallest non-null key, `None` if the tree holds no such key.
    pub fn first_key(&self) -> Result<Option<K>, TreeError> {
        let _lock = self.manager.acquire_read_lock(&self.name);
        let _guard = self.read_guard();
        self.edge_key(self.store(), Direction::Left)
    }

    /// Largest non-null key, `None` if the tree holds no such key.
    pub fn last_key(&self) -> Result<Option<K>, TreeError> {
        let _lock = self.manager.acquire_read_lock(&self.name);
        let _guard = self.read_guard();
        self.edge_key(self.store(), Direction::Right)
    }

    /// Add `value` under `key` in its own durable atomic operation.
    ///
    /// An oversized key, or one holding a range boundary sentinel, is
    /// rejected before the operation starts.
    pub fn put(&self, key: Option<K>, value: Rid) -> Result<(), TreeError> {
        let key = self.encode_for_put(key)?;
        atomic(&self.manager, true, |op| self.put_encoded(op, key, value))
    }

    /// Add `value` under `key` inside a caller-owned atomic operation.
    pub fn put_in(
        &self,
        op: &mut AtomicOperation,
        key: Option<K>,
        value: Rid,
    ) -> Result<(), TreeError> {
        let key = self.encode_for_put(key)?;
        self.put_encoded(op, key, value)
    }

    /// Remove one occurrence of `value` under `key`. Returns whether it was found.
    pub fn remove(&self, key: Option<K>, value: Rid) -> Result<bool, TreeError> {
        let key = key.map(|key| self.encode(key)).transpose()?;
        atomic(&self.manager, true, |op| self.remove_encoded(op, key, value))
    }

    /// Remove inside a caller-owned atomic operation.
    pub fn remove_in(
        &self,
        op: &mut AtomicOperation,
        key: Option<K>,
        value: Rid,
    ) -> Result<bool, TreeError> {
        let key = key.map(|key| self.encode(key)).transpose()?;
        self.remove_encoded(op, key, value)
    }

    /// Hold the tree's exclusive lock until `op` ends.
    pub fn acquire_atomic_exclusive_lock(&self, op: &mut AtomicOperation) {
        self.manager
            .acquire_exclusive_lock_until_commit(op, &self.name);
    }

    /// Remove every value, null keys included.
    pub fn clear(&self) -> Result<(), TreeError> {
        atomic(&self.manager, true, |op| {
            self.acquire_atomic_exclusive_lock(op);
            loop {
                let first = self.edge_key(&*op, Direction::Left)?;
                let last = self.edge_key(&*op, Direction::Right)?;
                let (Some(first), Some(last)) = (first, last) else {
                    break;
                };
                let batch = self.collect_ascending(
                    &*op,
                    Some(&Boundary::inclusive(first)),
                    Some(&Boundary::inclusive(last)),
                    usize::MAX,
                    true,
                )?;
                let mut removed = 0usize;
                for (key, values) in batch.groups {
                    for value in values {
                        if self.remove_in(op, Some(key.clone()), value)? {
                            removed += 1;
                        }
                    }
                }
                if removed == 0 {
                    return Err(self.corrupted("clear found entries it could not remove"));
                }
            }
            for value in self.null_list().get(&*op)? {
                self.remove_in(op, None, value)?;
            }
            Ok(())
        })
    }

    /// Re-apply a logged change inside `op`.
    pub fn apply_redo(
        &self,
        op: &mut AtomicOperation,
        record: &RedoRecord,
    ) -> Result<(), TreeError> {
        if record.index_id != self.index_id {
            return Err(self.redo_mismatch(format!(
                "record belongs to index {}, not {}",
                record.index_id, self.index_id
            )));
        }
        let serializer_id = self.key_def.serializer.id();
        if record.key_serializer_id != serializer_id {
            return Err(self.redo_mismatch(format!(
                "record uses key serializer {}, index uses {serializer_id}",
                record.key_serializer_id
            )));
        }
        if record.encryption_name.as_deref() != self.encryption_name() {
            return Err(self.redo_mismatch(format!(
                "record encryption {:?} does not match index encryption {:?}",
                record.encryption_name,
                self.encryption_name()
            )));
        }

        let key = record
            .serialized_key
            .as_deref()
            .map(|bytes| self.key_def.serializer.deserialize(bytes))
            .transpose()
            .map_err(TreeError::key(&self.name))?;
        match record.operation {
            RedoOperation::Put => self.put_in(op, key, record.value),
            RedoOperation::Remove => self.remove_in(op, key, record.value).map(|_| ()),
        }
    }

    /// Number of bucket levels.
    pub fn depth(&self) -> Result<usize, TreeError> {
        let _lock = self.manager.acquire_read_lock(&self.name);
        let _guard = self.read_guard();
        self.depth_in(self.store())
    }

    pub fn stats(&self) -> Result<TreeStats, TreeError> {
        let _lock = self.manager.acquire_read_lock(&self.name);
        let _guard = self.read_guard();
        let store = self.store();
        let entry = self.read_entry_point(store)?;
        let null_entry = self.null_list().entry_point(store)?;
        Ok(TreeStats {
            size: self.tree_size(&entry)?,
            depth: self.depth_in(store)?,
            file_pages: store
                .filled_up_to(self.file_id)
                .map_err(TreeError::storage(&self.name))?,
            pages_size: entry.pages_size,
            null_pages: null_entry.size,
        })
    }

    // Locking and plumbing

    pub(super) fn store(&self) -> &dyn PageStore {
        self.manager.store().as_ref()
    }

    #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
    pub(super) fn read_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().expect("lock poisoned")
    }

    #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
    fn write_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().expect("lock poisoned")
    }

    pub(super) fn null_list(&self) -> NullList<'_> {
        NullList::new(
            &self.name,
            self.null_file_id,
            self.manager.store().buffer_pool(),
        )
    }

    pub(super) fn corrupted(&self, message: impl Into<String>) -> TreeError {
        TreeError::corrupted(&self.name, message)
    }

    fn redo_mismatch(&self, message: String) -> TreeError {
        TreeError::RedoMismatch {
            tree: self.name.clone(),
            message,
        }
    }

    fn encryption_name(&self) -> Option<&str> {
        self.key_def.encryption.as_ref().map(|e| e.name())
    }

    fn tree_size(&self, entry: &EntryPoint) -> Result<u64, TreeError> {
        u64::try_from(entry.tree_size)
            .map_err(|_| self.corrupted(format!("negative tree size {}", entry.tree_size)))
    }

    // Keys

    pub(super) fn preprocess(&self, key: K) -> Result<K, TreeError> {
        self.key_def
            .serializer
            .preprocess(key, &self.key_def.key_types)
            .map_err(TreeError::key(&self.name))
    }

    fn encode(&self, key: K) -> Result<EncodedKey<K>, TreeError> {
        let key = self.preprocess(key)?;
        let serialized = self
            .key_def
            .serializer
            .serialize(&key)
            .map_err(TreeError::key(&self.name))?;
        let stored = match &self.key_def.encryption {
            Some(encryption) => seal_key(encryption.as_ref(), &serialized)
                .map_err(TreeError::encryption(&self.name))?,
            None => serialized.clone(),
        };
        Ok(EncodedKey {
            key,
            serialized,
            stored,
        })
    }

    fn encode_for_put(&self, key: Option<K>) -> Result<Option<EncodedKey<K>>, TreeError> {
        let Some(key) = key else {
            return Ok(None);
        };
        if key.holds_sentinel() {
            return Err(TreeError::key(&self.name)(KeyError::BoundarySentinel));
        }
        let encoded = self.encode(key)?;
        if encoded.stored.len() > self.config.max_key_size {
            return Err(TreeError::KeyTooLarge {
                tree: self.name.clone(),
                size: encoded.stored.len(),
                max: self.config.max_key_size,
            });
        }
        Ok(Some(encoded))
    }

    /// Decode a key as stored in a bucket.
    pub(super) fn decode_key(&self, stored: &[u8]) -> Result<K, TreeError> {
        let serializer = &self.key_def.serializer;
        match &self.key_def.encryption {
            Some(encryption) => {
                let plain = open_key(encryption.as_ref(), stored)
                    .map_err(TreeError::encryption(&self.name))?;
                serializer.deserialize(&plain)
            }
            None => serializer.deserialize(stored),
        }
        .map_err(TreeError::key(&self.name))
    }

    pub(super) fn compare(&self, stored: &[u8], key: &K) -> Result<Ordering, TreeError> {
        Ok(self.decode_key(stored)?.cmp(key))
    }

    fn find(&self, bucket: &Bucket, key: &K) -> Result<Result<usize, usize>, TreeError> {
        bucket::search(bucket.len(), |i| self.compare(bucket.key(i), key))
    }

    pub(super) fn find_in_leaf(
        &self,
        leaf: &LeafBucket,
        key: &K,
    ) -> Result<Result<usize, usize>, TreeError> {
        bucket::search(leaf.cells.len(), |i| self.compare(&leaf.cells[i].key, key))
    }

    fn redo_record(
        &self,
        operation: RedoOperation,
        serialized_key: Option<Vec<u8>>,
        value: Rid,
    ) -> RedoRecord {
        RedoRecord {
            operation,
            index_id: self.index_id,
            key_serializer_id: self.key_def.serializer.id(),
            encryption_name: self.encryption_name().map(str::to_string),
            serialized_key,
            value,
        }
    }

    // Pages

    pub(super) fn read_bucket<R: PageReader + ?Sized>(
        &self,
        reader: &R,
        page_index: PageIndex,
    ) -> Result<Bucket, TreeError> {
        let page = reader
            .read_page(self.file_id, page_index)
            .map_err(TreeError::storage(&self.name))?;
        Bucket::from_page(&page).map_err(|e| self.corrupted(format!("bucket {page_index}: {e}")))
    }

    pub(super) fn read_leaf<R: PageReader + ?Sized>(
        &self,
        reader: &R,
        page_index: PageIndex,
    ) -> Result<LeafBucket, TreeError> {
        match self.read_bucket(reader, page_index)? {
            Bucket::Leaf(leaf) => Ok(leaf),
            Bucket::NonLeaf(_) => Err(self.corrupted(format!(
                "page {page_index} is linked as a leaf but holds a non-leaf bucket"
            ))),
        }
    }

    fn read_non_leaf<R: PageReader + ?Sized>(
        &self,
        reader: &R,
        page_index: PageIndex,
    ) -> Result<NonLeafBucket, TreeError> {
        match self.read_bucket(reader, page_index)? {
            Bucket::NonLeaf(node) => Ok(node),
            Bucket::Leaf(_) => Err(self.corrupted(format!(
                "page {page_index} is on a path as a parent but holds a leaf bucket"
            ))),
        }
    }

    fn blank_page(&self) -> Result<Page, TreeError> {
        self.manager
            .store()
            .buffer_pool()
            .lease_page_zeroed()
            .ok_or(StorageError::BufferPoolExhausted)
            .map_err(TreeError::storage(&self.name))
    }

    fn write_bucket(
        &self,
        op: &mut AtomicOperation,
        page_index: PageIndex,
        bucket: &Bucket,
    ) -> Result<(), TreeError> {
        let mut page = self.blank_page()?;
        bucket.write_to_page(&mut page);
        op.write_page(self.file_id, page_index, &page)
            .map_err(TreeError::storage(&self.name))
    }

    fn read_entry_point<R: PageReader + ?Sized>(&self, reader: &R) -> Result<EntryPoint, TreeError> {
        let page = reader
            .read_page(self.file_id, ENTRY_POINT_INDEX)
            .map_err(TreeError::storage(&self.name))?;
        EntryPoint::from_page(&page)
            .ok_or_else(|| self.corrupted("page 0 does not hold the entry point"))
    }

    fn write_entry_point(&self, op: &mut AtomicOperation, entry: &EntryPoint) -> Result<(), TreeError> {
        let mut page = self.blank_page()?;
        entry.write_to_page(&mut page);
        op.write_page(self.file_id, ENTRY_POINT_INDEX, &page)
            .map_err(TreeError::storage(&self.name))
    }

    fn update_size(&self, op: &mut AtomicOperation, delta: i64) -> Result<(), TreeError> {
        let mut entry = self.read_entry_point(&*op)?;
        entry.tree_size += delta;
        self.write_entry_point(op, &entry)
    }

    /// Hand out the page after the reuse watermark, appending it to the
    /// file unless an earlier allocation already did.
    fn allocate_page(&self, op: &mut AtomicOperation) -> Result<PageIndex, TreeError> {
        let mut entry = self.read_entry_point(&*op)?;
        let next = entry.pages_size + 1;
        let file_pages = op
            .filled_up_to(self.file_id)
            .map_err(TreeError::storage(&self.name))?;
        if next < file_pages {
            tracing::debug!("Index {} reuses page {next}", self.name);
        } else {
            let added = op
                .add_page(self.file_id)
                .map_err(TreeError::storage(&self.name))?;
            if added != next {
                return Err(self.corrupted(format!(
                    "expected to append page {next}, file appended page {added}"
                )));
            }
        }
        entry.pages_size = next;
        self.write_entry_point(op, &entry)?;
        Ok(next)
    }

    // Search

    /// Descend from the root to the leaf responsible for `key`.
    pub(super) fn find_leaf<R: PageReader + ?Sized>(
        &self,
        reader: &R,
        key: &K,
    ) -> Result<LeafSearch, TreeError> {
        let mut path = Vec::new();
        let mut page = ROOT_INDEX;
        loop {
            if path.len() >= self.config.max_path_length {
                return Err(self.corrupted(format!(
                    "search path exceeds {} levels",
                    self.config.max_path_length
                )));
            }
            let bucket = self.read_bucket(reader, page)?;
            let found = self.find(&bucket, key)?;
            match bucket {
                Bucket::Leaf(leaf) => {
                    let (Ok(index) | Err(index)) = found;
                    path.push(PathItem { page, index });
                    return Ok(LeafSearch { path, leaf, found });
                }
                Bucket::NonLeaf(node) => {
                    let index = match found {
                        Ok(i) => i + 1,
                        Err(i) => i,
                    };
                    path.push(PathItem { page, index });
                    let Some(child) = node.child_for(found) else {
                        return Err(self.corrupted(format!("non-leaf bucket {page} has no cells")));
                    };
                    page = child;
                }
            }
        }
    }

    /// Leaves next to `from` in `direction` whose boundary cell holds `key`.
    ///
    /// Empty leaves are skipped. The scan stops after the first matching
    /// leaf that holds other keys too.
    pub(super) fn boundary_siblings<R: PageReader + ?Sized>(
        &self,
        reader: &R,
        from: &LeafBucket,
        direction: Direction,
        key: &K,
    ) -> Result<Vec<(PageIndex, LeafBucket, usize)>, TreeError> {
        let limit = self.chain_limit(reader)?;
        let mut matches = Vec::new();
        let mut next = direction.next(from);
        let mut hops = 0u32;
        while let Some(page) = next {
            hops += 1;
            if hops > limit {
                return Err(self.corrupted(format!("leaf chain through page {page} loops")));
            }
            let leaf = self.read_leaf(reader, page)?;
            next = direction.next(&leaf);
            let Some(index) = direction.boundary(&leaf) else {
                continue;
            };
            if self.compare(&leaf.cells[index].key, key)? != Ordering::Equal {
                break;
            }
            let single = leaf.cells.len() == 1;
            matches.push((page, leaf, index));
            if !single {
                break;
            }
        }
        Ok(matches)
    }

    /// Upper bound on the length of any walk along the leaf chain.
    pub(super) fn chain_limit<R: PageReader + ?Sized>(&self, reader: &R) -> Result<u32, TreeError> {
        reader
            .filled_up_to(self.file_id)
            .map_err(TreeError::storage(&self.name))
    }

    fn get_values<R: PageReader + ?Sized>(&self, reader: &R, key: &K) -> Result<Vec<Rid>, TreeError> {
        let search = self.find_leaf(reader, key)?;
        let mut values = match search.found {
            Ok(index) => search.leaf.cells[index].values.clone(),
            Err(_) => Vec::new(),
        };
        for direction in scan_directions(&search.leaf, search.found) {
            for (_, leaf, index) in self.boundary_siblings(reader, &search.leaf, direction, key)? {
                values.extend_from_slice(&leaf.cells[index].values);
            }
        }
        Ok(values)
    }

    /// Leftmost or rightmost non-empty leaf, backtracking over empty ones.
    pub(super) fn edge_leaf<R: PageReader + ?Sized>(
        &self,
        reader: &R,
        direction: Direction,
    ) -> Result<Option<(PageIndex, LeafBucket)>, TreeError> {
        // Non-leaf buckets on the current path and how many of their
        // children were visited
        let mut stack: Vec<(NonLeafBucket, usize)> = Vec::new();
        let mut page = ROOT_INDEX;
        loop {
            if stack.len() >= self.config.max_path_length {
                return Err(self.corrupted(format!(
                    "search path exceeds {} levels",
                    self.config.max_path_length
                )));
            }
            match self.read_bucket(reader, page)? {
                Bucket::Leaf(leaf) if !leaf.cells.is_empty() => return Ok(Some((page, leaf))),
                Bucket::Leaf(_) => {}
                Bucket::NonLeaf(node) => stack.push((node, 0)),
            }

            loop {
                let Some((node, visited)) = stack.last_mut() else {
                    return Ok(None);
                };
                let children = node.cells.len() + 1;
                if *visited < children {
                    let j = match direction {
                        Direction::Left => *visited,
                        Direction::Right => children - 1 - *visited,
                    };
                    *visited += 1;
                    let Some(child) = node.child(j) else {
                        return Err(self.corrupted("non-leaf bucket without cells"));
                    };
                    page = child;
                    break;
                }
                stack.pop();
            }
        }
    }

    pub(super) fn edge_key<R: PageReader + ?Sized>(
        &self,
        reader: &R,
        direction: Direction,
    ) -> Result<Option<K>, TreeError> {
        let Some((_, leaf)) = self.edge_leaf(reader, direction)? else {
            return Ok(None);
        };
        let cell = match direction {
            Direction::Left => leaf.cells.first(),
            Direction::Right => leaf.cells.last(),
        };
        cell.map(|cell| self.decode_key(&cell.key)).transpose()
    }

    fn depth_in<R: PageReader + ?Sized>(&self, reader: &R) -> Result<usize, TreeError> {
        let mut page = ROOT_INDEX;
        let mut depth = 1;
        loop {
            match self.read_bucket(reader, page)? {
                Bucket::Leaf(_) => return Ok(depth),
                Bucket::NonLeaf(node) => {
                    let Some(child) = node.child(0) else {
                        return Err(self.corrupted(format!("non-leaf bucket {page} has no cells")));
                    };
                    page = child;
                    depth += 1;
                    if depth > self.config.max_path_length {
                        return Err(self.corrupted(format!(
                            "tree depth exceeds {} levels",
                            self.config.max_path_length
                        )));
                    }
                }
            }
        }
    }

    // Mutation

    fn put_encoded(
        &self,
        op: &mut AtomicOperation,
        key: Option<EncodedKey<K>>,
        value: Rid,
    ) -> Result<(), TreeError> {
        self.acquire_atomic_exclusive_lock(op);
        let _guard = self.write_guard();
        let serialized_key = if let Some(EncodedKey {
            key,
            serialized,
            stored,
        }) = key
        {
            self.insert_value(op, &key, stored, value)?;
            Some(serialized)
        } else {
            self.null_list().put(op, value)?;
            None
        };
        self.update_size(op, 1)?;
        op.add_redo_record(self.redo_record(RedoOperation::Put, serialized_key, value));
        Ok(())
    }

    fn remove_encoded(
        &self,
        op: &mut AtomicOperation,
        key: Option<EncodedKey<K>>,
        value: Rid,
    ) -> Result<bool, TreeError> {
        self.acquire_atomic_exclusive_lock(op);
        let _guard = self.write_guard();
        let (removed, serialized_key) = if let Some(EncodedKey {
            key, serialized, ..
        }) = key
        {
            (self.remove_value(op, &key, value)?, Some(serialized))
        } else {
            (self.null_list().remove(op, value)?, None)
        };
        if removed {
            self.update_size(op, -1)?;
            op.add_redo_record(self.redo_record(RedoOperation::Remove, serialized_key, value));
        }
        Ok(removed)
    }

    fn insert_value(
        &self,
        op: &mut AtomicOperation,
        key: &K,
        stored: Vec<u8>,
        value: Rid,
    ) -> Result<(), TreeError> {
        let LeafSearch {
            mut path,
            mut leaf,
            mut found,
        } = self.find_leaf(&*op, key)?;
        loop {
            let Some(&PathItem { page, index }) = path.last() else {
                return Err(self.corrupted("empty search path"));
            };
            let added = match found {
                Ok(_) => leaf.append_value(index, value),
                Err(_) => leaf.add_new_entry(index, stored.clone(), value),
            };
            if added {
                return self.write_bucket(op, page, &Bucket::Leaf(leaf));
            }

            self.split_bucket(op, &mut path, key)?;
            let Some(target) = path.last_mut() else {
                return Err(self.corrupted("empty search path"));
            };
            leaf = self.read_leaf(&*op, target.page)?;
            found = self.find_in_leaf(&leaf, key)?;
            let (Ok(index) | Err(index)) = found;
            target.index = index;
        }
    }

    fn remove_value(&self, op: &mut AtomicOperation, key: &K, value: Rid) -> Result<bool, TreeError> {
        let search = self.find_leaf(&*op, key)?;
        let page = search.page();
        let LeafSearch {
            mut leaf, found, ..
        } = search;

        // A failed removal leaves the bucket untouched for the sibling scan
        if let Ok(index) = found {
            if leaf.remove_value(index, value) {
                self.write_bucket(op, page, &Bucket::Leaf(leaf))?;
                return Ok(true);
            }
        }

        for direction in scan_directions(&leaf, found) {
            for (sibling_page, mut sibling, index) in
                self.boundary_siblings(&*op, &leaf, direction, key)?
            {
                if sibling.remove_value(index, value) {
                    self.write_bucket(op, sibling_page, &Bucket::Leaf(sibling))?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Split the leaf at the end of `path`, first splitting every ancestor
    /// that has no room for the separator.
    ///
    /// On return `path` leads to the leaf and cell position where `key`
    /// belongs.
    fn split_bucket(
        &self,
        op: &mut AtomicOperation,
        path: &mut Vec<PathItem>,
        key: &K,
    ) -> Result<(), TreeError> {
        let Some(leaf_level) = path.len().checked_sub(1) else {
            return Err(self.corrupted("empty search path"));
        };
        let mut pending = vec![leaf_level];
        while let Some(&level) = pending.last() {
            if level > 0 {
                let parent = self.read_non_leaf(&*op, path[level - 1].page)?;
                let child = self.read_bucket(&*op, path[level].page)?;
                if child.is_empty() {
                    return Err(self.corrupted(format!(
                        "bucket {} is full without cells",
                        path[level].page
                    )));
                }
                let separator_len = child.key(child.len() / 2).len();
                if !parent.can_fit(separator_len) {
                    pending.push(level - 1);
                    continue;
                }
            } else if path.len() >= self.config.max_path_length {
                return Err(self.corrupted(format!(
                    "tree depth would exceed {} levels",
                    self.config.max_path_length
                )));
            }

            pending.pop();
            self.split_at(op, path, level, key)?;
            if level == 0 {
                for pending_level in &mut pending {
                    *pending_level += 1;
                }
            }
        }
        Ok(())
    }

    fn split_at(
        &self,
        op: &mut AtomicOperation,
        path: &mut Vec<PathItem>,
        level: usize,
        key: &K,
    ) -> Result<(), TreeError> {
        match self.read_bucket(&*op, path[level].page)? {
            Bucket::Leaf(leaf) => self.split_leaf(op, path, level, leaf, key),
            Bucket::NonLeaf(node) => self.split_non_leaf(op, path, level, node),
        }
    }

    fn split_leaf(
        &self,
        op: &mut AtomicOperation,
        path: &mut Vec<PathItem>,
        level: usize,
        mut leaf: LeafBucket,
        key: &K,
    ) -> Result<(), TreeError> {
        let PathItem {
            page,
            index: key_index,
        } = path[level];
        let mid = leaf.cells.len() / 2;
        let (left_cells, right_cells) = match leaf.cells.len() {
            0 => return Err(self.corrupted(format!("cannot split empty leaf bucket {page}"))),
            1 => {
                // One key fills the page: halve its value list
                let mut cell = leaf.cells.remove(0);
                if cell.values.len() < 2 {
                    return Err(self.corrupted(format!(
                        "leaf bucket {page} is full with a single value"
                    )));
                }
                let upper = cell.values.split_off(cell.values.len() / 2);
                let right = LeafCell {
                    key: cell.key.clone(),
                    values: upper,
                };
                (vec![cell], vec![right])
            }
            _ => {
                let right = leaf.cells.split_off(mid);
                (std::mem::take(&mut leaf.cells), right)
            }
        };
        let separator = right_cells[0].key.clone();
        let go_right = key_index > mid
            || (key_index == mid && self.compare(&separator, key)? == Ordering::Equal);
        let new_index = if go_right { key_index - mid } else { key_index };

        if level == 0 {
            let left_page = self.allocate_page(op)?;
            let right_page = self.allocate_page(op)?;
            let left = LeafBucket {
                left_sibling: None,
                right_sibling: Some(right_page),
                cells: left_cells,
            };
            let right = LeafBucket {
                left_sibling: Some(left_page),
                right_sibling: None,
                cells: right_cells,
            };
            self.write_bucket(op, left_page, &Bucket::Leaf(left))?;
            self.write_bucket(op, right_page, &Bucket::Leaf(right))?;
            self.write_root(op, separator, left_page, right_page)?;
            descend_after_root_split(path, go_right, left_page, right_page, new_index);
            tracing::debug!(
                "Index {} split its root leaf into pages {left_page} and {right_page}",
                self.name
            );
        } else {
            let right_page = self.allocate_page(op)?;
            if let Some(neighbour) = leaf.right_sibling {
                let mut next = self.read_leaf(&*op, neighbour)?;
                next.left_sibling = Some(right_page);
                self.write_bucket(op, neighbour, &Bucket::Leaf(next))?;
            }
            let right = LeafBucket {
                left_sibling: Some(page),
                right_sibling: leaf.right_sibling,
                cells: right_cells,
            };
            let left = LeafBucket {
                left_sibling: leaf.left_sibling,
                right_sibling: Some(right_page),
                cells: left_cells,
            };
            self.write_bucket(op, page, &Bucket::Leaf(left))?;
            self.write_bucket(op, right_page, &Bucket::Leaf(right))?;
            self.insert_separator(op, path, level, separator, page, right_page)?;
            descend_after_split(path, level, go_right, right_page, new_index);
            tracing::debug!(
                "Index {} split leaf {page}, new right sibling {right_page}",
                self.name
            );
        }
        Ok(())
    }

    fn split_non_leaf(
        &self,
        op: &mut AtomicOperation,
        path: &mut Vec<PathItem>,
        level: usize,
        mut node: NonLeafBucket,
    ) -> Result<(), TreeError> {
        let PathItem {
            page,
            index: key_index,
        } = path[level];
        let size = node.cells.len();
        if size < 3 {
            return Err(self.corrupted(format!(
                "non-leaf bucket {page} is full with {size} cells"
            )));
        }
        let mid = size / 2;
        let right_cells = node.cells.split_off(mid + 1);
        let Some(NonLeafCell { key: separator, .. }) = node.cells.pop() else {
            return Err(self.corrupted(format!("non-leaf bucket {page} lost its separator")));
        };
        let left = Bucket::NonLeaf(node);
        let right = Bucket::NonLeaf(NonLeafBucket { cells: right_cells });
        let go_right = key_index > mid;
        let new_index = if go_right {
            key_index - mid - 1
        } else {
            key_index
        };

        if level == 0 {
            let left_page = self.allocate_page(op)?;
            let right_page = self.allocate_page(op)?;
            self.write_bucket(op, left_page, &left)?;
            self.write_bucket(op, right_page, &right)?;
            self.write_root(op, separator, left_page, right_page)?;
            descend_after_root_split(path, go_right, left_page, right_page, new_index);
            tracing::debug!(
                "Index {} split its root into pages {left_page} and {right_page}, depth {}",
                self.name,
                path.len()
            );
        } else {
            let right_page = self.allocate_page(op)?;
            self.write_bucket(op, page, &left)?;
            self.write_bucket(op, right_page, &right)?;
            self.insert_separator(op, path, level, separator, page, right_page)?;
            descend_after_split(path, level, go_right, right_page, new_index);
            tracing::debug!(
                "Index {} split non-leaf bucket {page}, new right bucket {right_page}",
                self.name
            );
        }
        Ok(())
    }

    fn insert_separator(
        &self,
        op: &mut AtomicOperation,
        path: &[PathItem],
        level: usize,
        separator: Vec<u8>,
        left: PageIndex,
        right: PageIndex,
    ) -> Result<(), TreeError> {
        let parent = path[level - 1];
        let mut node = self.read_non_leaf(&*op, parent.page)?;
        if parent.index > node.cells.len() || !node.add_entry(parent.index, separator, left, right)
        {
            return Err(self.corrupted(format!(
                "cannot insert a separator at {} of bucket {}",
                parent.index, parent.page
            )));
        }
        self.write_bucket(op, parent.page, &Bucket::NonLeaf(node))
    }

    fn write_root(
        &self,
        op: &mut AtomicOperation,
        separator: Vec<u8>,
        left: PageIndex,
        right: PageIndex,
    ) -> Result<(), TreeError> {
        let root = NonLeafBucket {
            cells: vec![NonLeafCell {
                key: separator,
                left,
                right,
            }],
        };
        self.write_bucket(op, ROOT_INDEX, &Bucket::NonLeaf(root))
    }
}

/// Point `path` at the half of a split bucket that receives the key.
fn descend_after_split(
    path: &mut [PathItem],
    level: usize,
    go_right: bool,
    right_page: PageIndex,
    new_index: usize,
) {
    if go_right {
        path[level - 1].index += 1;
        path[level] = PathItem {
            page: right_page,
            index: new_index,
        };
    } else {
        path[level].index = new_index;
    }
}

/// The root kept its page and gained a level below it.
fn descend_after_root_split(
    path: &mut Vec<PathItem>,
    go_right: bool,
    left_page: PageIndex,
    right_page: PageIndex,
    new_index: usize,
) {
    path[0] = PathItem {
        page: ROOT_INDEX,
        index: usize::from(go_right),
    };
    path.insert(
        1,
        PathItem {
            page: if go_right { right_page } else { left_page },
            index: new_index,
        },
    );
}
