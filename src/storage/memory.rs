//! In-memory engine for tests and throwaway nodes

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{BatchOp, Cursor, EngineError, LedgerEngine, Table, WriteBatch};

/// Ordered map keyed by prefixed table keys
#[derive(Debug, Default)]
pub struct MemoryEngine {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries across all tables
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl LedgerEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get_blob(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.data.read().get(&table.prefixed(key)).cloned())
    }

    fn cursor(&self, table: Table) -> Cursor<'_> {
        let start = vec![table.prefix()];
        let end = vec![table.prefix() + 1];
        let snapshot: Vec<_> = self
            .data
            .read()
            .range(start..end)
            .map(|(k, v)| Ok::<_, EngineError>((k[1..].to_vec(), v.clone())))
            .collect();
        Box::new(snapshot.into_iter())
    }

    fn commit_batch(&self, batch: WriteBatch) -> Result<(), EngineError> {
        let mut data = self.data.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { table, key, value } => {
                    data.insert(table.prefixed(&key), value);
                }
                BatchOp::Delete { table, key } => {
                    data.remove(&table.prefixed(&key));
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
