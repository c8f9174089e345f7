//! Failed-op store
//!
//! Frozen snapshots of operations that exceeded their attempts or
//! failed permanently. Entries are immutable except for the archival
//! flag. The store is bounded: when over the limit, the oldest archived
//! entries evict first; unarchived entries are never silently dropped.

use chrono::Utc;
use vital_core::{FailedOp, Operation};
use vital_journal::JournalOp;
use vital_storage::TypedBox;

use crate::boxes::FAILED_OPS_BOX;
use crate::error::Result;

/// Bounded store of failed operations.
pub struct FailedOpStore {
    entries: TypedBox<FailedOp>,
    limit: usize,
}

impl FailedOpStore {
    /// Wrap the failed-ops box.
    pub fn new(entries: TypedBox<FailedOp>, limit: usize) -> Self {
        FailedOpStore { entries, limit }
    }

    /// Build the journal write that freezes `op` into this store.
    ///
    /// The dispatcher combines it with the op-store and index deletes so
    /// the move is atomic.
    pub fn freeze_op(
        &self,
        op: Operation,
        error_code: &str,
        error_message: &str,
    ) -> Result<JournalOp> {
        let failed = FailedOp::freeze(op, error_code, error_message, Utc::now());
        let key = failed.op.id.clone();
        let value = self.entries.encode_value(&failed)?;
        Ok(JournalOp::Write {
            box_name: FAILED_OPS_BOX.to_string(),
            key,
            value,
        })
    }

    /// A failed op by id.
    pub fn get(&self, op_id: &str) -> Result<Option<FailedOp>> {
        Ok(self.entries.get(op_id)?)
    }

    /// Every failed op, oldest first.
    pub fn list(&self) -> Vec<FailedOp> {
        let mut out: Vec<FailedOp> = self
            .entries
            .keys()
            .iter()
            .filter_map(|k| self.entries.get(k).ok().flatten())
            .collect();
        out.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then(a.op.id.cmp(&b.op.id)));
        out
    }

    /// Mark an entry archived.
    pub fn archive(&self, op_id: &str) -> Result<bool> {
        match self.entries.get(op_id)? {
            Some(mut failed) => {
                failed.archived = true;
                self.entries.put(op_id, &failed)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete an entry (after a successful retry re-enqueue).
    pub fn remove(&self, op_id: &str) -> Result<()> {
        Ok(self.entries.delete(op_id)?)
    }

    /// Evict oldest archived entries while over the limit.
    pub fn enforce_limit(&self) -> Result<usize> {
        let over = self.entries.len().saturating_sub(self.limit);
        if over == 0 {
            return Ok(0);
        }
        let mut evicted = 0;
        for failed in self.list() {
            if evicted == over {
                break;
            }
            if failed.archived {
                self.entries.delete(&failed.op.id)?;
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::info!(evicted, "evicted archived failed ops over store limit");
        }
        Ok(evicted)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::queue_descriptors;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use vital_core::{NoopTelemetry, Priority};
    use vital_journal::{TransactionJournal, JOURNAL_BOX};
    use vital_storage::{BoxDescriptor, BoxRegistry, EncryptionPolicy, StorageEngine};

    fn store_at(dir: &std::path::Path, limit: usize) -> (FailedOpStore, TransactionJournal) {
        let registry = Arc::new(BoxRegistry::new());
        for d in queue_descriptors() {
            registry.register(d).unwrap();
        }
        registry
            .register(BoxDescriptor::new(
                JOURNAL_BOX,
                EncryptionPolicy::Forbidden,
                20,
                1,
            ))
            .unwrap();
        let engine =
            Arc::new(StorageEngine::new(dir, registry, None, Arc::new(NoopTelemetry)).unwrap());
        engine.open_registered().unwrap();
        let journal = TransactionJournal::new(engine.clone(), Arc::new(NoopTelemetry)).unwrap();
        let store = FailedOpStore::new(engine.typed(FAILED_OPS_BOX).unwrap(), limit);
        (store, journal)
    }

    fn freeze(store: &FailedOpStore, journal: &TransactionJournal, id: &str) {
        let op = Operation::new(id, "create", BTreeMap::new(), Priority::Normal);
        let write = store.freeze_op(op, "POISON_OP", "too many attempts").unwrap();
        journal.execute(vec![write]).unwrap();
    }

    #[test]
    fn test_freeze_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let (store, journal) = store_at(dir.path(), 10);
        freeze(&store, &journal, "op-00000001");

        let listed = store.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].error_code, "POISON_OP");
        assert!(!listed[0].archived);
    }

    #[test]
    fn test_archive_flag_is_the_only_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let (store, journal) = store_at(dir.path(), 10);
        freeze(&store, &journal, "op-00000001");

        assert!(store.archive("op-00000001").unwrap());
        let entry = store.get("op-00000001").unwrap().unwrap();
        assert!(entry.archived);
        assert_eq!(entry.error_code, "POISON_OP");
        assert!(!store.archive("missing-op-01").unwrap());
    }

    #[test]
    fn test_limit_evicts_only_archived_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let (store, journal) = store_at(dir.path(), 2);
        freeze(&store, &journal, "op-00000001");
        freeze(&store, &journal, "op-00000002");
        freeze(&store, &journal, "op-00000003");

        // Nothing archived: nothing evictable.
        assert_eq!(store.enforce_limit().unwrap(), 0);
        assert_eq!(store.len(), 3);

        store.archive("op-00000001").unwrap();
        store.archive("op-00000002").unwrap();
        assert_eq!(store.enforce_limit().unwrap(), 1);
        assert!(store.get("op-00000001").unwrap().is_none(), "oldest archived evicts");
        assert!(store.get("op-00000002").unwrap().is_some());
    }
}
