//! Backing engine seam
//!
//! The ledger sees its storage as a set of byte-keyed tables behind the
//! [`LedgerEngine`] trait. Writes are staged in a [`WriteBatch`] and applied
//! atomically by `commit_batch`; dropping a batch without committing it is
//! the abort path. Engines are picked at startup from [`DbType`].

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{MemoryEngine, SledEngine};

/// Engine-level failure
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("{0}")]
    Backend(String),
}

/// Ledger tables. The discriminant is the key prefix in engines that keep
/// everything in one keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Table {
    /// height -> block blob
    Blocks = 1,
    /// block hash -> height
    BlockHeights,
    /// height -> block metadata
    BlockInfo,
    /// tx hash -> tx blob
    Txs,
    /// tx hash -> tx id, height, unlock time
    TxIndices,
    /// tx id -> global output indices
    TxOutputs,
    /// amount ++ index -> output data
    Outputs,
    /// amount -> number of outputs
    OutputCounts,
    /// key image -> height it was spent at
    SpentKeys,
    Properties,
}

impl Table {
    pub const ALL: [Table; 10] = [
        Table::Blocks,
        Table::BlockHeights,
        Table::BlockInfo,
        Table::Txs,
        Table::TxIndices,
        Table::TxOutputs,
        Table::Outputs,
        Table::OutputCounts,
        Table::SpentKeys,
        Table::Properties,
    ];

    pub fn prefix(self) -> u8 {
        self as u8
    }

    /// Key with the table prefix prepended
    pub fn prefixed(self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(key.len() + 1);
        full.push(self.prefix());
        full.extend_from_slice(key);
        full
    }
}

/// One staged write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { table: Table, key: Vec<u8>, value: Vec<u8> },
    Delete { table: Table, key: Vec<u8> },
}

/// Ordered list of writes applied all-or-nothing
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { table, key, value });
    }

    pub fn delete(&mut self, table: Table, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { table, key });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drop every op staged after the first `len`
    pub fn truncate(&mut self, len: usize) {
        self.ops.truncate(len);
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Key/value pairs of one table in key order
pub type Cursor<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), EngineError>> + 'a>;

/// Storage capability the ledger is written against
pub trait LedgerEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn get_blob(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError>;

    /// Iterate a table in key order. Readers see committed data only.
    fn cursor(&self, table: Table) -> Cursor<'_>;

    /// Apply every op of the batch, or none of them
    fn commit_batch(&self, batch: WriteBatch) -> Result<(), EngineError>;

    fn flush(&self) -> Result<(), EngineError>;
}

/// Selectable backing engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    #[default]
    Sled,
    Memory,
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbType::Sled => f.write_str("sled"),
            DbType::Memory => f.write_str("memory"),
        }
    }
}

impl FromStr for DbType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sled" => Ok(DbType::Sled),
            "memory" => Ok(DbType::Memory),
            other => Err(format!("unknown db type '{}'", other)),
        }
    }
}

/// Create the configured engine. `path` is ignored by the memory engine.
pub fn new_engine(db_type: DbType, path: &Path, sync: bool) -> Result<Arc<dyn LedgerEngine>, EngineError> {
    Ok(match db_type {
        DbType::Sled => Arc::new(SledEngine::open(path, sync)?),
        DbType::Memory => Arc::new(MemoryEngine::new()),
    })
}
