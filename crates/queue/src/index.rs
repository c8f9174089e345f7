//! Pending index
//!
//! A secondary box mapping a zero-padded monotonic sequence number to an
//! operation id, so listing the oldest N pending ops never scans the
//! whole op store. The index is derived data: it can always be rebuilt
//! from the op store ordered by `created_at`.

use std::sync::atomic::{AtomicU64, Ordering};
use vital_core::Operation;
use vital_journal::JournalOp;
use vital_storage::TypedBox;

use crate::boxes::PENDING_INDEX_BOX;
use crate::error::Result;

/// Oldest-first index over the pending-op store.
pub struct PendingIndex {
    entries: TypedBox<String>,
    next_seq: AtomicU64,
}

impl PendingIndex {
    /// Wrap the index box, recovering the sequence counter from the
    /// highest persisted key.
    pub fn new(entries: TypedBox<String>) -> Self {
        let next_seq = entries
            .keys()
            .iter()
            .filter_map(|k| k.parse::<u64>().ok())
            .max()
            .map_or(1, |max| max + 1);
        PendingIndex {
            entries,
            next_seq: AtomicU64::new(next_seq),
        }
    }

    /// Allocate a sequence slot for `op_id` and return the journal write
    /// that claims it.
    ///
    /// The write joins the op-store write in one transaction, which is
    /// what keeps the store and the index in lockstep across crashes.
    pub fn insert_op(&self, op_id: &str) -> Result<JournalOp> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let key = Self::seq_key(seq);
        let value = self.entries.encode_value(&op_id.to_string())?;
        Ok(JournalOp::Write {
            box_name: PENDING_INDEX_BOX.to_string(),
            key,
            value,
        })
    }

    /// The journal delete that removes `op_id` from the index, if indexed.
    pub fn remove_op(&self, op_id: &str) -> Option<JournalOp> {
        self.seq_key_of(op_id).map(|key| JournalOp::Delete {
            box_name: PENDING_INDEX_BOX.to_string(),
            key,
        })
    }

    /// The oldest `n` operation ids, insertion-ordered.
    pub fn oldest(&self, n: usize) -> Vec<String> {
        let mut out = Vec::with_capacity(n.min(self.entries.len()));
        for key in self.entries.keys() {
            if out.len() == n {
                break;
            }
            if let Ok(Some(op_id)) = self.entries.get(&key) {
                out.push(op_id);
            }
        }
        out
    }

    /// Number of indexed operations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebuild the index from the op store, ordered by `created_at`.
    ///
    /// Idempotent; rebuilding twice yields the same index.
    pub fn rebuild(&self, ops: &TypedBox<Operation>) -> Result<usize> {
        let mut pending: Vec<Operation> = Vec::new();
        for key in ops.keys() {
            if let Ok(Some(op)) = ops.get(&key) {
                pending.push(op);
            }
        }
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        for key in self.entries.keys() {
            self.entries.delete(&key)?;
        }
        let mut seq = 1u64;
        for op in &pending {
            self.entries.put(&Self::seq_key(seq), &op.id)?;
            seq += 1;
        }
        self.next_seq.store(seq, Ordering::SeqCst);
        tracing::info!(entries = pending.len(), "pending index rebuilt");
        Ok(pending.len())
    }

    /// Rebuild when any index entry points at a missing op.
    ///
    /// Returns whether a rebuild ran.
    pub fn integrity_check_and_rebuild(&self, ops: &TypedBox<Operation>) -> Result<bool> {
        let mut broken = false;
        for key in self.entries.keys() {
            match self.entries.get(&key) {
                Ok(Some(op_id)) => {
                    if ops.get(&op_id).ok().flatten().is_none() {
                        broken = true;
                        break;
                    }
                }
                // Undecodable entry: rebuild clears it.
                _ => {
                    broken = true;
                    break;
                }
            }
        }
        if broken {
            tracing::warn!("pending index out of sync with op store; rebuilding");
            self.rebuild(ops)?;
        }
        Ok(broken)
    }

    fn seq_key(seq: u64) -> String {
        format!("{:020}", seq)
    }

    fn seq_key_of(&self, op_id: &str) -> Option<String> {
        self.entries
            .keys()
            .into_iter()
            .find(|key| matches!(self.entries.get(key), Ok(Some(id)) if id == op_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::{queue_descriptors, PENDING_OPS_BOX};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use vital_core::{NoopTelemetry, Priority};
    use vital_journal::{TransactionJournal, JOURNAL_BOX};
    use vital_storage::{BoxDescriptor, BoxRegistry, EncryptionPolicy, StorageEngine};

    struct Fixture {
        engine: Arc<StorageEngine>,
        journal: TransactionJournal,
        index: PendingIndex,
        ops: TypedBox<Operation>,
    }

    fn fixture(dir: &std::path::Path) -> Fixture {
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
        Fixture {
            journal: TransactionJournal::new(engine.clone(), Arc::new(NoopTelemetry)).unwrap(),
            index: PendingIndex::new(engine.typed(PENDING_INDEX_BOX).unwrap()),
            ops: engine.typed(PENDING_OPS_BOX).unwrap(),
            engine,
        }
    }

    fn op(id: &str, offset_secs: i64) -> Operation {
        let mut op = Operation::new(id, "create", BTreeMap::new(), Priority::Normal);
        op.created_at = op.created_at + chrono::Duration::seconds(offset_secs);
        op
    }

    fn enqueue(f: &Fixture, op: &Operation) {
        let write = JournalOp::Write {
            box_name: PENDING_OPS_BOX.to_string(),
            key: op.id.clone(),
            value: f.ops.encode_value(op).unwrap(),
        };
        let index_write = f.index.insert_op(&op.id).unwrap();
        f.journal.execute(vec![write, index_write]).unwrap();
    }

    #[test]
    fn test_oldest_preserves_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        for id in ["op-a", "op-b", "op-c"] {
            enqueue(&f, &op(id, 0));
        }
        assert_eq!(f.index.oldest(2), vec!["op-a", "op-b"]);
        assert_eq!(f.index.oldest(10).len(), 3);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let f = fixture(dir.path());
            enqueue(&f, &op("op-a", 0));
            enqueue(&f, &op("op-b", 0));
        }
        let f = fixture(dir.path());
        enqueue(&f, &op("op-c", 0));
        assert_eq!(f.index.oldest(10), vec!["op-a", "op-b", "op-c"]);
    }

    #[test]
    fn test_remove_op_deletes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        enqueue(&f, &op("op-a", 0));
        enqueue(&f, &op("op-b", 0));

        let delete = f.index.remove_op("op-a").unwrap();
        f.journal.execute(vec![delete]).unwrap();
        assert_eq!(f.index.oldest(10), vec!["op-b"]);
        assert!(f.index.remove_op("op-a").is_none());
    }

    #[test]
    fn test_rebuild_orders_by_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        // Insert out of creation order.
        enqueue(&f, &op("op-late", 100));
        enqueue(&f, &op("op-early", -100));
        enqueue(&f, &op("op-mid", 0));

        f.index.rebuild(&f.ops).unwrap();
        assert_eq!(f.index.oldest(10), vec!["op-early", "op-mid", "op-late"]);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        enqueue(&f, &op("op-a", 0));
        enqueue(&f, &op("op-b", 1));

        f.index.rebuild(&f.ops).unwrap();
        let first = f.index.oldest(10);
        f.index.rebuild(&f.ops).unwrap();
        assert_eq!(f.index.oldest(10), first);
    }

    #[test]
    fn test_integrity_check_detects_dangling_entry() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        enqueue(&f, &op("op-a", 0));
        enqueue(&f, &op("op-b", 1));
        // Drop the op but not its index entry, as a partial bug would.
        f.engine
            .get_box(PENDING_OPS_BOX)
            .unwrap()
            .delete_raw("op-a")
            .unwrap();

        let rebuilt = f.index.integrity_check_and_rebuild(&f.ops).unwrap();
        assert!(rebuilt);
        assert_eq!(f.index.oldest(10), vec!["op-b"]);

        // Clean index passes without rebuilding.
        assert!(!f.index.integrity_check_and_rebuild(&f.ops).unwrap());
    }
}
