//! Index engine over a cell tree.
//!
//! [`MultiValueIndexEngine`] is what the database layer talks to. It owns
//! one [`CellBTree`] and forwards to it, adding distinct key counting and
//! whole-index cursors.

use std::sync::Arc;

use crate::config::TreeConfig;
use crate::storage::atomic::{AtomicOperation, AtomicOperationsManager};
use crate::storage::btree::{CellBTree, CellBTreeCursor, KeyCursor, KeyDefinition, TreeError};
use crate::types::key::IndexKey;
use crate::types::rid::Rid;
use crate::types::serializer::KeySerializer;

/// Version of the on-disk format written by this engine.
pub const ENGINE_VERSION: u32 = 1;

/// Multi-value index engine.
pub struct MultiValueIndexEngine<K: IndexKey, S: KeySerializer<K>> {
    id: u32,
    tree: CellBTree<K, S>,
}

impl<K: IndexKey, S: KeySerializer<K>> MultiValueIndexEngine<K, S> {
    /// Create a new, empty index.
    pub fn create(
        manager: Arc<AtomicOperationsManager>,
        id: u32,
        name: &str,
        key_def: KeyDefinition<S>,
        config: TreeConfig,
    ) -> Result<Self, TreeError> {
        let tree = CellBTree::create(manager, name, id, key_def, config)?;
        Ok(Self { id, tree })
    }

    /// Open an existing index.
    pub fn load(
        manager: Arc<AtomicOperationsManager>,
        id: u32,
        name: &str,
        key_def: KeyDefinition<S>,
        config: TreeConfig,
    ) -> Result<Self, TreeError> {
        let tree = CellBTree::load(manager, name, id, key_def, config)?;
        Ok(Self { id, tree })
    }

    pub fn close(self) -> Result<(), TreeError> {
        self.tree.close()
    }

    pub fn delete(self) -> Result<(), TreeError> {
        self.tree.delete()
    }

    /// Delete the files of an index that is not loaded.
    pub fn delete_without_load(
        manager: &AtomicOperationsManager,
        name: &str,
    ) -> Result<(), TreeError> {
        CellBTree::<K, S>::delete_without_load(manager, name)
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.tree.name()
    }

    #[must_use]
    pub const fn version(&self) -> u32 {
        ENGINE_VERSION
    }

    /// The underlying tree.
    #[must_use]
    pub const fn tree(&self) -> &CellBTree<K, S> {
        &self.tree
    }

    #[must_use]
    pub const fn has_range_query_support(&self) -> bool {
        true
    }

    pub fn get(&self, key: Option<K>) -> Result<Vec<Rid>, TreeError> {
        self.tree.get(key)
    }

    pub fn contains(&self, key: Option<K>) -> Result<bool, TreeError> {
        self.tree.contains(key)
    }

    pub fn put(&self, key: Option<K>, value: Rid) -> Result<(), TreeError> {
        self.tree.put(key, value)
    }

    pub fn remove(&self, key: Option<K>, value: Rid) -> Result<bool, TreeError> {
        self.tree.remove(key, value)
    }

    pub fn clear(&self) -> Result<(), TreeError> {
        self.tree.clear()
    }

    /// Number of key/value pairs, null keys included.
    pub fn size(&self) -> Result<u64, TreeError> {
        self.tree.size()
    }

    /// Number of distinct keys, counting the null key once if it holds values.
    pub fn distinct_key_count(&self) -> Result<u64, TreeError> {
        let mut count = u64::from(self.tree.contains(None)?);
        for key in self.tree.key_cursor() {
            key?;
            count += 1;
        }
        Ok(count)
    }

    pub fn first_key(&self) -> Result<Option<K>, TreeError> {
        self.tree.first_key()
    }

    pub fn last_key(&self) -> Result<Option<K>, TreeError> {
        self.tree.last_key()
    }

    /// Every non-null entry in ascending key order.
    #[must_use]
    pub fn cursor(&self) -> CellBTreeCursor<'_, K, S> {
        self.tree.iterate_all(true)
    }

    /// Every non-null entry in descending key order.
    #[must_use]
    pub fn desc_cursor(&self) -> CellBTreeCursor<'_, K, S> {
        self.tree.iterate_all(false)
    }

    #[must_use]
    pub fn key_cursor(&self) -> KeyCursor<'_, K, S> {
        self.tree.key_cursor()
    }

    pub fn iterate_entries_between(
        &self,
        from: K,
        from_inclusive: bool,
        to: K,
        to_inclusive: bool,
        ascending: bool,
    ) -> Result<CellBTreeCursor<'_, K, S>, TreeError> {
        self.tree
            .iterate_entries_between(from, from_inclusive, to, to_inclusive, ascending)
    }

    pub fn iterate_entries_major(
        &self,
        key: K,
        inclusive: bool,
        ascending: bool,
    ) -> Result<CellBTreeCursor<'_, K, S>, TreeError> {
        self.tree.iterate_entries_major(key, inclusive, ascending)
    }

    pub fn iterate_entries_minor(
        &self,
        key: K,
        inclusive: bool,
        ascending: bool,
    ) -> Result<CellBTreeCursor<'_, K, S>, TreeError> {
        self.tree.iterate_entries_minor(key, inclusive, ascending)
    }

    /// Hold the index's exclusive lock until `op` ends.
    pub fn acquire_atomic_exclusive_lock(&self, op: &mut AtomicOperation) {
        self.tree.acquire_atomic_exclusive_lock(op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::memory_manager;
    use crate::types::serializer::LongSerializer;

    fn engine() -> MultiValueIndexEngine<i64, LongSerializer> {
        let (_store, manager) = memory_manager();
        MultiValueIndexEngine::create(
            manager,
            3,
            "by_age",
            KeyDefinition::new(LongSerializer, 1),
            TreeConfig::default(),
        )
        .expect("create engine")
    }

    #[test]
    fn test_identity() {
        let engine = engine();
        assert_eq!(engine.id(), 3);
        assert_eq!(engine.name(), "by_age");
        assert_eq!(engine.version(), ENGINE_VERSION);
        assert!(engine.has_range_query_support());
    }

    #[test]
    fn test_distinct_key_count() {
        let engine = engine();
        assert_eq!(engine.distinct_key_count().expect("count"), 0);

        for position in 0..5 {
            engine.put(Some(1), Rid::new(1, position)).expect("put");
        }
        engine.put(Some(2), Rid::new(1, 10)).expect("put");
        assert_eq!(engine.distinct_key_count().expect("count"), 2);

        engine.put(None, Rid::new(2, 0)).expect("put null");
        engine.put(None, Rid::new(2, 1)).expect("put null");
        assert_eq!(engine.distinct_key_count().expect("count"), 3);
        assert_eq!(engine.size().expect("size"), 8);
    }

    #[test]
    fn test_cursors_cover_whole_index() {
        let engine = engine();
        for key in [5, 1, 3] {
            engine.put(Some(key), Rid::new(1, key)).expect("put");
        }
        engine.put(None, Rid::new(9, 9)).expect("put null");

        let ascending: Vec<i64> = engine
            .cursor()
            .map(|entry| entry.expect("entry").key)
            .collect();
        assert_eq!(ascending, vec![1, 3, 5]);

        let descending: Vec<i64> = engine
            .desc_cursor()
            .map(|entry| entry.expect("entry").key)
            .collect();
        assert_eq!(descending, vec![5, 3, 1]);
    }

    #[test]
    fn test_empty_index_cursors() {
        let engine = engine();
        assert_eq!(engine.cursor().count(), 0);
        assert_eq!(engine.desc_cursor().count(), 0);
        assert_eq!(engine.key_cursor().count(), 0);
        assert_eq!(engine.first_key().expect("first"), None);
    }
}
