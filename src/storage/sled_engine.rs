//! Sled-backed engine
//!
//! All tables live in one sled tree under a one-byte prefix so a whole
//! ledger batch lands through a single atomic `apply_batch`.

use std::path::Path;

use sled::Db;
use tracing::debug;

use super::{BatchOp, Cursor, EngineError, LedgerEngine, Table, WriteBatch};

#[derive(Debug, Clone)]
pub struct SledEngine {
    db: Db,
    /// Flush to disk after every committed batch
    sync: bool,
}

impl SledEngine {
    /// Open or create the database
    pub fn open<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, EngineError> {
        let db = sled::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), sync, "sled engine opened");
        Ok(Self { db, sync })
    }

    /// Engine backed by a temporary directory that sled removes on drop
    pub fn temporary() -> Result<Self, EngineError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db, sync: false })
    }
}

impl LedgerEngine for SledEngine {
    fn name(&self) -> &'static str {
        "sled"
    }

    fn get_blob(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.db.get(table.prefixed(key))?.map(|v| v.to_vec()))
    }

    fn cursor(&self, table: Table) -> Cursor<'_> {
        Box::new(self.db.scan_prefix([table.prefix()]).map(|item| -> Result<(Vec<u8>, Vec<u8>), EngineError> {
            let (key, value) = item?;
            Ok((key[1..].to_vec(), value.to_vec()))
        }))
    }

    fn commit_batch(&self, batch: WriteBatch) -> Result<(), EngineError> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { table, key, value } => sled_batch.insert(table.prefixed(&key), value),
                BatchOp::Delete { table, key } => sled_batch.remove(table.prefixed(&key)),
            }
        }
        self.db.apply_batch(sled_batch)?;
        if self.sync {
            self.db.flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), EngineError> {
        self.db.flush()?;
        Ok(())
    }
}
