use std::sync::Arc;

use crate::config::TreeConfig;
use crate::storage::atomic::AtomicOperationsManager;
use crate::storage::btree::{CellBTree, KeyDefinition};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::memory::MemoryPageStore;
use crate::types::encryption::{Encryption, EncryptionError};
use crate::types::key::Key;
use crate::types::serializer::{CompositeKeySerializer, LongSerializer};

/// Buffers in the pool of a test store.
pub const TEST_POOL_CAPACITY: usize = 64;

/// Reversible XOR "encryption" for tests.
pub struct XorCipher {
    mask: u8,
}

impl XorCipher {
    pub const fn new(mask: u8) -> Self {
        Self { mask }
    }
}

impl Encryption for XorCipher {
    fn name(&self) -> &str {
        "xor"
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        Ok(plaintext.iter().map(|b| b ^ self.mask).collect())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        Ok(ciphertext.iter().map(|b| b ^ self.mask).collect())
    }
}

/// In-memory store and a manager over it.
pub fn memory_manager() -> (Arc<MemoryPageStore>, Arc<AtomicOperationsManager>) {
    let store = Arc::new(MemoryPageStore::new(42, BufferPool::new(TEST_POOL_CAPACITY)));
    let manager = Arc::new(AtomicOperationsManager::new(store.clone()));
    (store, manager)
}

/// Create an `i64`-keyed tree.
pub fn long_tree(
    manager: &Arc<AtomicOperationsManager>,
    name: &str,
    index_id: u32,
) -> CellBTree<i64, LongSerializer> {
    CellBTree::create(
        Arc::clone(manager),
        name,
        index_id,
        KeyDefinition::new(LongSerializer, 1),
        TreeConfig::default(),
    )
    .expect("create i64 tree")
}

/// Create a tree over [`Key`]s with `key_size` components.
pub fn key_tree(
    manager: &Arc<AtomicOperationsManager>,
    name: &str,
    key_size: usize,
    config: TreeConfig,
) -> CellBTree<Key, CompositeKeySerializer> {
    CellBTree::create(
        Arc::clone(manager),
        name,
        1,
        KeyDefinition::new(CompositeKeySerializer, key_size),
        config,
    )
    .expect("create key tree")
}
