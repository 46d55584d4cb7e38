#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

//! Multi-value secondary index stored as a cell tree.
//!
//! Each key maps to a list of record ids. Pages live in a [`storage`]
//! page store and every change runs inside an atomic operation.
//!
//! Layers, bottom-up:
//!  - `types`: keys, record ids, key serializers and encryption
//!  - `storage`: pages, page stores, the redo log and atomic operations
//!  - `storage::btree`: the tree itself and its cursors
//!  - `engine` and `recovery`: the index engine and redo replay

pub mod config;
pub mod engine;
pub mod recovery;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;

pub use engine::MultiValueIndexEngine;
pub use storage::btree::{CellBTree, CursorEntry, KeyDefinition, TreeError};
