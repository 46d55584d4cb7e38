//! Redo replay for a tree.
//!
//! Rebuilds the effect of committed atomic operations on a tree whose
//! pages predate them, for example a snapshot taken before a crash.
//!
//! # Replay Process
//!
//! 1. Group log records by atomic operation id
//! 2. Keep operations that reached their commit marker, in commit order
//! 3. Re-apply each operation's changes for this tree inside one
//!    non-durable atomic operation
//!
//! Operations without a commit marker (including a torn tail) are skipped.

use std::collections::HashMap;

use crate::storage::btree::{CellBTree, TreeError};
use crate::storage::wal::{LogRecord, LogRecordPayload, Lsn, OperationId, RedoRecord};
use crate::types::key::IndexKey;
use crate::types::serializer::KeySerializer;

/// Result of a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayResult {
    /// Number of log records scanned.
    pub records_scanned: usize,

    /// Number of committed operations that touched the tree.
    pub operations_replayed: usize,

    /// Number of operations discarded for lack of a commit marker.
    pub operations_discarded: usize,

    /// Number of puts and removes applied.
    pub changes_applied: usize,

    /// Highest LSN seen.
    pub recovered_lsn: Lsn,
}

#[derive(Debug, Default)]
struct PendingOperation {
    changes: Vec<RedoRecord>,
    commit_lsn: Option<Lsn>,
}

/// Re-apply the committed changes in `records` that belong to `tree`.
pub fn replay<K: IndexKey, S: KeySerializer<K>>(
    tree: &CellBTree<K, S>,
    records: &[LogRecord],
) -> Result<ReplayResult, RecoveryError> {
    let mut pending: HashMap<OperationId, PendingOperation> = HashMap::new();
    let mut recovered_lsn: Lsn = 0;
    for record in records {
        recovered_lsn = recovered_lsn.max(record.lsn);
        let operation = pending.entry(record.op_id).or_default();
        match &record.payload {
            LogRecordPayload::Put(change) | LogRecordPayload::Remove(change) => {
                if operation.commit_lsn.is_some() {
                    return Err(RecoveryError::ChangeAfterCommit(record.op_id));
                }
                if change.index_id == tree.index_id() {
                    operation.changes.push(change.clone());
                }
            }
            LogRecordPayload::Commit => operation.commit_lsn = Some(record.lsn),
        }
    }

    let mut committed: Vec<(Lsn, Vec<RedoRecord>)> = Vec::new();
    let mut operations_discarded = 0;
    for (op_id, operation) in pending {
        let Some(lsn) = operation.commit_lsn else {
            tracing::warn!("Discarding atomic operation {op_id} without commit marker");
            operations_discarded += 1;
            continue;
        };
        if !operation.changes.is_empty() {
            committed.push((lsn, operation.changes));
        }
    }
    committed.sort_unstable_by_key(|(lsn, _)| *lsn);

    let mut changes_applied = 0;
    for (_, changes) in &committed {
        let mut op = tree.manager().begin(false);
        let applied = changes
            .iter()
            .try_for_each(|change| tree.apply_redo(&mut op, change));
        match applied {
            Ok(()) => tree.manager().end(op, false).map_err(TreeError::from)?,
            Err(e) => {
                if let Err(end_error) = tree.manager().end(op, true) {
                    tracing::error!("Failed to roll back replayed operation: {end_error}");
                }
                return Err(e.into());
            }
        }
        changes_applied += changes.len();
    }

    tracing::info!(
        "Replayed {} operations ({changes_applied} changes) into index {}",
        committed.len(),
        tree.name()
    );
    Ok(ReplayResult {
        records_scanned: records.len(),
        operations_replayed: committed.len(),
        operations_discarded,
        changes_applied,
        recovered_lsn,
    })
}

/// Errors that can occur during replay.
#[derive(Debug)]
pub enum RecoveryError {
    /// Applying a change failed.
    Tree(TreeError),
    /// The log holds a change after the commit marker of its operation.
    ChangeAfterCommit(OperationId),
}

impl std::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tree(e) => write!(f, "replay failed: {e}"),
            Self::ChangeAfterCommit(op_id) => {
                write!(f, "atomic operation {op_id} logged a change after its commit")
            }
        }
    }
}

impl std::error::Error for RecoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tree(e) => Some(e),
            Self::ChangeAfterCommit(_) => None,
        }
    }
}

impl From<TreeError> for RecoveryError {
    fn from(e: TreeError) -> Self {
        Self::Tree(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::RedoOperation;
    use crate::testing::{long_tree, memory_manager};
    use crate::types::rid::Rid;

    fn change(operation: RedoOperation, key: i64, position: i64) -> RedoRecord {
        RedoRecord {
            operation,
            index_id: 7,
            key_serializer_id: crate::types::serializer::LongSerializer::ID,
            encryption_name: None,
            serialized_key: Some(key.to_le_bytes().to_vec()),
            value: Rid::new(1, position),
        }
    }

    #[test]
    fn test_replay_applies_committed_operations_only() {
        let (_store, manager) = memory_manager();
        let tree = long_tree(&manager, "replay", 7);

        let records = vec![
            LogRecord::new(1, 1, LogRecordPayload::change(change(RedoOperation::Put, 10, 1))),
            LogRecord::new(2, 2, LogRecordPayload::change(change(RedoOperation::Put, 20, 2))),
            LogRecord::new(1, 3, LogRecordPayload::change(change(RedoOperation::Put, 10, 3))),
            LogRecord::new(1, 4, LogRecordPayload::Commit),
        ];
        let result = replay(&tree, &records).expect("replay");

        assert_eq!(result.records_scanned, 4);
        assert_eq!(result.operations_replayed, 1);
        assert_eq!(result.operations_discarded, 1);
        assert_eq!(result.changes_applied, 2);
        assert_eq!(result.recovered_lsn, 4);
        assert_eq!(
            tree.get(Some(10)).expect("get"),
            vec![Rid::new(1, 1), Rid::new(1, 3)]
        );
        assert!(tree.get(Some(20)).expect("get").is_empty());
        assert_eq!(tree.size().expect("size"), 2);
    }

    #[test]
    fn test_replay_skips_other_indexes() {
        let (_store, manager) = memory_manager();
        let tree = long_tree(&manager, "replay", 7);

        let mut foreign = change(RedoOperation::Put, 5, 5);
        foreign.index_id = 8;
        let records = vec![
            LogRecord::new(1, 1, LogRecordPayload::change(foreign)),
            LogRecord::new(1, 2, LogRecordPayload::change(change(RedoOperation::Put, 6, 6))),
            LogRecord::new(1, 3, LogRecordPayload::Commit),
        ];
        let result = replay(&tree, &records).expect("replay");

        assert_eq!(result.changes_applied, 1);
        assert!(tree.get(Some(5)).expect("get").is_empty());
        assert_eq!(tree.get(Some(6)).expect("get"), vec![Rid::new(1, 6)]);
    }

    #[test]
    fn test_replay_orders_operations_by_commit() {
        let (_store, manager) = memory_manager();
        let tree = long_tree(&manager, "replay", 7);

        // Operation 2 commits first even though operation 1 started first
        let records = vec![
            LogRecord::new(1, 1, LogRecordPayload::change(change(RedoOperation::Remove, 1, 1))),
            LogRecord::new(2, 2, LogRecordPayload::change(change(RedoOperation::Put, 1, 1))),
            LogRecord::new(2, 3, LogRecordPayload::Commit),
            LogRecord::new(1, 4, LogRecordPayload::Commit),
        ];
        replay(&tree, &records).expect("replay");

        assert!(tree.get(Some(1)).expect("get").is_empty());
        assert_eq!(tree.size().expect("size"), 0);
    }

    #[test]
    fn test_change_after_commit_is_rejected() {
        let (_store, manager) = memory_manager();
        let tree = long_tree(&manager, "replay", 7);

        let records = vec![
            LogRecord::new(1, 1, LogRecordPayload::Commit),
            LogRecord::new(1, 2, LogRecordPayload::change(change(RedoOperation::Put, 1, 1))),
        ];
        let err = replay(&tree, &records).expect_err("change after commit");
        assert!(matches!(err, RecoveryError::ChangeAfterCommit(1)));
    }

    #[test]
    fn test_mismatched_serializer_rolls_back() {
        let (_store, manager) = memory_manager();
        let tree = long_tree(&manager, "replay", 7);

        let mut wrong = change(RedoOperation::Put, 2, 2);
        wrong.key_serializer_id = 99;
        let records = vec![
            LogRecord::new(1, 1, LogRecordPayload::change(change(RedoOperation::Put, 1, 1))),
            LogRecord::new(1, 2, LogRecordPayload::change(wrong)),
            LogRecord::new(1, 3, LogRecordPayload::Commit),
        ];
        let err = replay(&tree, &records).expect_err("serializer mismatch");
        assert!(matches!(
            err,
            RecoveryError::Tree(TreeError::RedoMismatch { .. })
        ));
        assert!(tree.get(Some(1)).expect("get").is_empty());
    }
}
