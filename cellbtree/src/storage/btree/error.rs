//! Errors surfaced by tree operations.

use crate::config::ConfigError;
use crate::storage::atomic::AtomicError;
use crate::storage::io::StorageError;
use crate::types::encryption::EncryptionError;
use crate::types::serializer::KeyError;

/// Errors that can occur during tree operations.
///
/// A miss is never an error: lookups return an empty list and removals
/// return `false`.
#[derive(Debug)]
pub enum TreeError {
    /// The tree structure is inconsistent. Fatal; the index must be rebuilt.
    Corrupted { tree: String, message: String },
    /// The stored form of a key exceeds the configured maximum.
    KeyTooLarge {
        tree: String,
        size: usize,
        max: usize,
    },
    /// Page access failed.
    Storage { tree: String, source: StorageError },
    /// A key could not be preprocessed, serialized or decoded.
    Key { tree: String, source: KeyError },
    /// A key could not be encrypted or decrypted.
    Encryption {
        tree: String,
        source: EncryptionError,
    },
    /// Committing or rolling back the atomic operation failed.
    Atomic(AtomicError),
    /// The tree configuration is invalid.
    Config(ConfigError),
    /// A redo record does not belong to this tree.
    RedoMismatch { tree: String, message: String },
}

impl TreeError {
    /// Build a corruption error and log it.
    pub fn corrupted(tree: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("Index {tree} is corrupted: {message}");
        Self::Corrupted {
            tree: tree.to_string(),
            message,
        }
    }

    pub(crate) fn storage(tree: &str) -> impl FnOnce(StorageError) -> Self + '_ {
        move |source| Self::Storage {
            tree: tree.to_string(),
            source,
        }
    }

    pub(crate) fn key(tree: &str) -> impl FnOnce(KeyError) -> Self + '_ {
        move |source| Self::Key {
            tree: tree.to_string(),
            source,
        }
    }

    pub(crate) fn encryption(tree: &str) -> impl FnOnce(EncryptionError) -> Self + '_ {
        move |source| Self::Encryption {
            tree: tree.to_string(),
            source,
        }
    }

    /// Whether the index has to be rebuilt.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Corrupted { tree, message } => write!(
                f,
                "index {tree} is corrupted and has to be rebuilt: {message}"
            ),
            Self::KeyTooLarge { tree, size, max } => write!(
                f,
                "key of {size} bytes exceeds the maximum of {max} bytes of index {tree}"
            ),
            Self::Storage { tree, source } => {
                write!(f, "storage error in index {tree}: {source}")
            }
            Self::Key { tree, source } => write!(f, "key error in index {tree}: {source}"),
            Self::Encryption { tree, source } => {
                write!(f, "encryption error in index {tree}: {source}")
            }
            Self::Atomic(e) => write!(f, "atomic operation error: {e}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::RedoMismatch { tree, message } => {
                write!(f, "redo record rejected by index {tree}: {message}")
            }
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage { source, .. } => Some(source),
            Self::Key { source, .. } => Some(source),
            Self::Encryption { source, .. } => Some(source),
            Self::Atomic(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Corrupted { .. } | Self::KeyTooLarge { .. } | Self::RedoMismatch { .. } => None,
        }
    }
}

impl From<AtomicError> for TreeError {
    fn from(e: AtomicError) -> Self {
        Self::Atomic(e)
    }
}

impl From<ConfigError> for TreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
