//! Multi-value cell tree.
//!
//! # Structure
//!
//! The tree consists of:
//! - Non-leaf buckets: separator keys and child page pointers
//! - Leaf buckets: one cell per key holding all of its values, doubly
//!   linked for range scans
//! - A null list in a second file holding the values of the null key
//!
//! Keys are stored as serializer output (encrypted if the tree encrypts
//! keys) and compared after decoding.

pub mod bucket;
pub mod entry_point;
pub mod null_bucket;

mod cursor;
mod error;
mod null_list;
mod tree;


pub use bucket::{Bucket, BucketError, LeafBucket, MAX_KEY_SIZE_LIMIT, NonLeafBucket};
pub use cursor::{CellBTreeCursor, CursorEntry, KeyCursor};
pub use error::TreeError;
pub use tree::{
    CellBTree, DATA_FILE_EXTENSION, KeyDefinition, NULL_FILE_EXTENSION, TreeStats,
    data_file_name, null_file_name,
};
