//! Ledger store
//!
//! `BlockchainDb` is the writer-of-record for chain state. It maps blocks,
//! transactions, outputs and spent key images onto the tables of a
//! [`LedgerEngine`] and keeps them consistent across tables: every mutation
//! goes through a [`BatchGuard`], which holds the single writer lock and
//! stages writes until `commit`. Dropping a guard without committing discards
//! everything it staged.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{new_engine, DbType, EngineError, LedgerEngine, Table, WriteBatch};
use crate::consensus::{Block, Difficulty, HardFork};
use crate::crypto::{zero_commit, Commitment, Hash, KeyImage, PublicKey};
use crate::validation::{Transaction, TxInput};

/// On-disk layout version
pub const DB_VERSION: u64 = 1;

const PROP_HEIGHT: &[u8] = b"height";
const PROP_TX_COUNT: &[u8] = b"tx_count";
const PROP_VERSION: &[u8] = b"version";

/// Ledger errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database is not open")]
    NotOpen,
    #[error("Database is already open")]
    AlreadyOpen,
    #[error("Database is open read-only")]
    ReadOnly,
    #[error("Block not found: {0}")]
    BlockNotFound(String),
    #[error("Block {0} already exists")]
    BlockExists(Hash),
    #[error("Top block {top} is not the parent {parent} of the new block")]
    ParentMismatch { top: Hash, parent: Hash },
    #[error("Transaction not found: {0}")]
    TxNotFound(Hash),
    #[error("Transaction {0} already exists")]
    TxExists(Hash),
    #[error("Key image {0} already spent")]
    KeyImageSpent(KeyImage),
    #[error("Transaction {0} has an unsupported input type")]
    UnsupportedInput(Hash),
    #[error("Miner transaction {0} must have exactly one coinbase input")]
    BadMinerTx(Hash),
    #[error("Block lists {hashes} transaction hashes but {txs} transactions were supplied")]
    TxCountMismatch { hashes: usize, txs: usize },
    #[error("Output {index} of amount {amount} not found")]
    OutputNotFound { amount: u64, index: u64 },
    #[error("Database version {found} does not match supported version {expected}")]
    VersionMismatch { found: u64, expected: u64 },
    #[error("Database corrupt: {0}")]
    Corrupt(String),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl DbError {
    /// Errors that mean the store itself can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DbError::Corrupt(_) | DbError::Engine(_) | DbError::AlreadyOpen | DbError::VersionMismatch { .. }
        )
    }
}

/// How the store was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    ReadOnly,
}

/// Per-block metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub hash: Hash,
    pub timestamp: u64,
    pub size: u64,
    pub cumulative_difficulty: Difficulty,
    pub coins_generated: u64,
    /// Transactions in the block, miner transaction included
    pub tx_count: u64,
}

/// Where a transaction lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIndex {
    pub tx_id: u64,
    pub block_height: u64,
    pub unlock_time: u64,
}

/// A stored output, addressed by (amount, global index)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputData {
    pub key: PublicKey,
    pub commitment: Option<Commitment>,
    pub unlock_time: u64,
    pub height: u64,
    pub tx_hash: Hash,
    pub local_index: u32,
}

/// One group of key images to restore once the chain is tall enough
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixupEntry {
    pub min_height: u64,
    pub key_images: Vec<KeyImage>,
}

/// Post-open repair: key images that must be in the spent set of a chain
/// with the given genesis
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixupPlan {
    /// Only repair chains starting with this block; `None` applies to any chain
    pub genesis_hash: Option<Hash>,
    pub entries: Vec<FixupEntry>,
}

/// Cumulative time spent in the ledger's hot paths
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbStats {
    pub num_calls: u64,
    pub time_blk_hash: Duration,
    pub time_tx_exists: Duration,
    pub time_add_block: Duration,
    pub time_add_transaction: Duration,
    pub time_commit: Duration,
}

impl fmt::Display for DbStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "calls: {}, block hash: {:?}, tx exists: {:?}, add block: {:?}, add tx: {:?}, commit: {:?}",
            self.num_calls,
            self.time_blk_hash,
            self.time_tx_exists,
            self.time_add_block,
            self.time_add_transaction,
            self.time_commit
        )
    }
}

struct OpenStore {
    engine: Arc<dyn LedgerEngine>,
    mode: OpenMode,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DbError> {
    bincode::serialize(value).map_err(|e| DbError::Corrupt(format!("encode: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T, DbError> {
    bincode::deserialize(bytes).map_err(|e| DbError::Corrupt(format!("{} does not parse: {}", what, e)))
}

fn decode_u64(bytes: &[u8], what: &str) -> Result<u64, DbError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| DbError::Corrupt(format!("{} has {} bytes", what, bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn u64_key(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

fn output_key(amount: u64, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&amount.to_be_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Amount bucket and commitment an output is indexed under
fn output_slot(tx: &Transaction, is_miner: bool, index: usize) -> (u64, Option<Commitment>) {
    let amount = tx.outputs[index].amount;
    if is_miner && tx.version >= 2 {
        (0, Some(zero_commit(amount)))
    } else if tx.version >= 2 {
        (amount, tx.output_commitment(index))
    } else {
        (amount, None)
    }
}

type OverlayKey = (Table, Vec<u8>);

/// Exclusive write scope over an open store.
///
/// Reads through the guard see its own staged writes. `commit` applies them
/// atomically; dropping the guard instead discards them and releases the
/// writer lock.
pub struct BatchGuard<'a> {
    db: &'a BlockchainDb,
    engine: Arc<dyn LedgerEngine>,
    _writer: MutexGuard<'a, ()>,
    ops: WriteBatch,
    overlay: HashMap<OverlayKey, Option<Vec<u8>>>,
    /// Overlay entry each staged op replaced, aligned with `ops`
    undo: Vec<(OverlayKey, Option<Option<Vec<u8>>>)>,
    start_height: u64,
    committed: bool,
}

impl<'a> BatchGuard<'a> {
    pub fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        if let Some(staged) = self.overlay.get(&(table, key.to_vec())) {
            return Ok(staged.clone());
        }
        Ok(self.engine.get_blob(table, key)?)
    }

    pub fn contains(&self, table: Table, key: &[u8]) -> Result<bool, DbError> {
        Ok(self.get(table, key)?.is_some())
    }

    fn stage(&mut self, table: Table, key: Vec<u8>, value: Option<Vec<u8>>) {
        let overlay_key = (table, key.clone());
        let previous = self.overlay.insert(overlay_key.clone(), value.clone());
        self.undo.push((overlay_key, previous));
        match value {
            Some(value) => self.ops.put(table, key, value),
            None => self.ops.delete(table, key),
        }
    }

    pub fn put(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) {
        self.stage(table, key, Some(value));
    }

    pub fn delete(&mut self, table: Table, key: Vec<u8>) {
        self.stage(table, key, None);
    }

    /// Marker to roll back to if a later step fails
    pub fn savepoint(&self) -> usize {
        self.ops.len()
    }

    /// Discard every write staged after `savepoint`
    pub fn rollback_to(&mut self, savepoint: usize) {
        while self.undo.len() > savepoint {
            if let Some((key, previous)) = self.undo.pop() {
                match previous {
                    Some(entry) => self.overlay.insert(key, entry),
                    None => self.overlay.remove(&key),
                };
            }
        }
        self.ops.truncate(savepoint);
    }

    fn get_u64(&self, table: Table, key: &[u8], what: &str) -> Result<Option<u64>, DbError> {
        self.get(table, key)?.map(|b| decode_u64(&b, what)).transpose()
    }

    /// Number of blocks, staged writes included
    pub fn height(&self) -> Result<u64, DbError> {
        Ok(self.get_u64(Table::Properties, PROP_HEIGHT, "height")?.unwrap_or(0))
    }

    fn output_count(&self, amount: u64) -> Result<u64, DbError> {
        Ok(self
            .get_u64(Table::OutputCounts, &u64_key(amount), "output count")?
            .unwrap_or(0))
    }

    /// Apply everything staged
    pub fn commit(mut self) -> Result<(), DbError> {
        let started = Instant::now();
        let final_height = self.height()?;
        let ops = std::mem::take(&mut self.ops);
        let staged = ops.len();
        self.engine.commit_batch(ops)?;
        self.committed = true;
        debug!(ops = staged, height = final_height, "batch committed");
        self.db.after_commit(self.start_height, final_height, started.elapsed());
        Ok(())
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.undo.is_empty() {
            warn!(ops = self.undo.len(), "aborting uncommitted ledger batch");
        }
    }
}

/// Transactional ledger over a pluggable engine
pub struct BlockchainDb {
    state: RwLock<Option<OpenStore>>,
    writer: Mutex<()>,
    hard_fork: RwLock<Option<Arc<HardFork>>>,
    stats: Mutex<DbStats>,
}

impl Default for BlockchainDb {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BlockchainDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("BlockchainDb")
            .field("engine", &state.as_ref().map(|s| s.engine.name()))
            .field("mode", &state.as_ref().map(|s| s.mode))
            .finish()
    }
}

impl BlockchainDb {
    /// A closed store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
            writer: Mutex::new(()),
            hard_fork: RwLock::new(None),
            stats: Mutex::new(DbStats::default()),
        }
    }

    /// Open the configured engine at `path`
    pub fn open(&self, path: &Path, db_type: DbType, mode: OpenMode, sync: bool) -> Result<(), DbError> {
        if self.is_open() {
            return Err(DbError::AlreadyOpen);
        }
        let engine = new_engine(db_type, path, sync)?;
        self.open_with_engine(engine, mode)
    }

    /// Open over an already constructed engine
    pub fn open_with_engine(&self, engine: Arc<dyn LedgerEngine>, mode: OpenMode) -> Result<(), DbError> {
        let mut state = self.state.write();
        if state.is_some() {
            return Err(DbError::AlreadyOpen);
        }

        match engine.get_blob(Table::Properties, PROP_VERSION)? {
            Some(bytes) => {
                let found = decode_u64(&bytes, "version")?;
                if found != DB_VERSION {
                    return Err(DbError::VersionMismatch {
                        found,
                        expected: DB_VERSION,
                    });
                }
            }
            None if mode == OpenMode::ReadWrite => {
                let mut batch = WriteBatch::new();
                batch.put(Table::Properties, PROP_VERSION.to_vec(), u64_key(DB_VERSION));
                engine.commit_batch(batch)?;
            }
            None => {}
        }

        info!(engine = engine.name(), ?mode, "ledger opened");
        *state = Some(OpenStore { engine, mode });
        drop(state);

        self.sync_hard_fork()?;
        Ok(())
    }

    /// Flush and close. Waits for an in-flight batch to finish.
    pub fn close(&self) -> Result<(), DbError> {
        let _writer = self.writer.lock();
        let store = self.state.write().take().ok_or(DbError::NotOpen)?;
        store.engine.flush()?;
        info!(engine = store.engine.name(), "ledger closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state.read().is_some()
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.state.read().as_ref(), Some(OpenStore { mode: OpenMode::ReadOnly, .. }))
    }

    fn engine(&self) -> Result<Arc<dyn LedgerEngine>, DbError> {
        self.state
            .read()
            .as_ref()
            .map(|s| s.engine.clone())
            .ok_or(DbError::NotOpen)
    }

    /// Attach the fork schedule whose cursor follows this store's tip
    pub fn set_hard_fork(&self, hard_fork: Arc<HardFork>) -> Result<(), DbError> {
        *self.hard_fork.write() = Some(hard_fork);
        if self.is_open() {
            self.sync_hard_fork()?;
        }
        Ok(())
    }

    fn sync_hard_fork(&self) -> Result<(), DbError> {
        if let Some(hf) = self.hard_fork.read().as_ref() {
            hf.on_block_popped(self.height()?.checked_sub(1));
        }
        Ok(())
    }

    fn after_commit(&self, start_height: u64, final_height: u64, elapsed: Duration) {
        self.stats.lock().time_commit += elapsed;
        if let Some(hf) = self.hard_fork.read().as_ref() {
            if final_height > start_height {
                for height in start_height..final_height {
                    hf.on_block_added(height);
                }
            } else if final_height < start_height {
                hf.on_block_popped(final_height.checked_sub(1));
            }
        }
    }

    /// Take the writer lock and start staging writes
    pub fn batch_start(&self) -> Result<BatchGuard<'_>, DbError> {
        let writer = self.writer.lock();
        let engine = match self.state.read().as_ref() {
            None => return Err(DbError::NotOpen),
            Some(OpenStore { mode: OpenMode::ReadOnly, .. }) => return Err(DbError::ReadOnly),
            Some(store) => store.engine.clone(),
        };
        let mut guard = BatchGuard {
            db: self,
            engine,
            _writer: writer,
            ops: WriteBatch::new(),
            overlay: HashMap::new(),
            undo: Vec::new(),
            start_height: 0,
            committed: false,
        };
        guard.start_height = guard.height()?;
        Ok(guard)
    }

    // ---- mutation ----

    /// Store a block and its transactions atomically. Returns the height the
    /// chain had before the block, which is the new block's height.
    pub fn add_block(
        &self,
        block: &Block,
        block_size: u64,
        cumulative_difficulty: Difficulty,
        coins_generated: u64,
        txs: &[Transaction],
    ) -> Result<u64, DbError> {
        let mut batch = self.batch_start()?;
        let height = self.add_block_to(&mut batch, block, block_size, cumulative_difficulty, coins_generated, txs)?;
        batch.commit()?;
        Ok(height)
    }

    /// Stage a block inside an existing batch. On error nothing this call
    /// staged remains in the batch.
    pub fn add_block_to(
        &self,
        batch: &mut BatchGuard<'_>,
        block: &Block,
        block_size: u64,
        cumulative_difficulty: Difficulty,
        coins_generated: u64,
        txs: &[Transaction],
    ) -> Result<u64, DbError> {
        let savepoint = batch.savepoint();
        let result = self.stage_block(batch, block, block_size, cumulative_difficulty, coins_generated, txs);
        if result.is_err() {
            batch.rollback_to(savepoint);
        }
        result
    }

    fn stage_block(
        &self,
        batch: &mut BatchGuard<'_>,
        block: &Block,
        block_size: u64,
        cumulative_difficulty: Difficulty,
        coins_generated: u64,
        txs: &[Transaction],
    ) -> Result<u64, DbError> {
        let started = Instant::now();
        if block.tx_hashes.len() != txs.len() {
            return Err(DbError::TxCountMismatch {
                hashes: block.tx_hashes.len(),
                txs: txs.len(),
            });
        }

        let hash_started = Instant::now();
        let block_hash = block.hash();
        let miner_hash = block.miner_tx.hash();
        self.stats.lock().time_blk_hash += hash_started.elapsed();

        let height = batch.height()?;
        if batch.contains(Table::BlockHeights, block_hash.as_bytes())? {
            return Err(DbError::BlockExists(block_hash));
        }
        if height > 0 {
            let top = self.staged_block_info(batch, height - 1)?.hash;
            if top != block.header.prev_hash {
                return Err(DbError::ParentMismatch {
                    top,
                    parent: block.header.prev_hash,
                });
            }
        }

        // a block blob with any other miner shape could never be decoded again
        if !block.miner_tx.is_miner_tx() {
            return Err(DbError::BadMinerTx(miner_hash));
        }
        self.add_transaction(batch, height, &block.miner_tx, &miner_hash, true)?;
        for (tx, tx_hash) in txs.iter().zip(&block.tx_hashes) {
            self.add_transaction(batch, height, tx, tx_hash, false)?;
        }

        let info = BlockInfo {
            hash: block_hash,
            timestamp: block.header.timestamp,
            size: block_size,
            cumulative_difficulty,
            coins_generated,
            tx_count: txs.len() as u64 + 1,
        };
        batch.put(Table::Blocks, u64_key(height), block.to_blob());
        batch.put(Table::BlockHeights, block_hash.as_bytes().to_vec(), u64_key(height));
        batch.put(Table::BlockInfo, u64_key(height), encode(&info)?);
        batch.put(Table::Properties, PROP_HEIGHT.to_vec(), u64_key(height + 1));

        let mut stats = self.stats.lock();
        stats.num_calls += 1;
        stats.time_add_block += started.elapsed();
        drop(stats);

        debug!(height, hash = %block_hash, txs = txs.len(), "block staged");
        Ok(height)
    }

    fn add_transaction(
        &self,
        batch: &mut BatchGuard<'_>,
        height: u64,
        tx: &Transaction,
        tx_hash: &Hash,
        is_miner: bool,
    ) -> Result<u64, DbError> {
        let started = Instant::now();

        let exists_started = Instant::now();
        let exists = batch.contains(Table::TxIndices, tx_hash.as_bytes())?;
        self.stats.lock().time_tx_exists += exists_started.elapsed();
        if exists {
            return Err(DbError::TxExists(*tx_hash));
        }

        for input in &tx.inputs {
            match input {
                TxInput::Gen { .. } if is_miner => {}
                TxInput::Gen { .. } => return Err(DbError::UnsupportedInput(*tx_hash)),
                TxInput::ToKey { key_image, .. } => {
                    if batch.contains(Table::SpentKeys, key_image.as_bytes())? {
                        return Err(DbError::KeyImageSpent(*key_image));
                    }
                    batch.put(Table::SpentKeys, key_image.as_bytes().to_vec(), u64_key(height));
                }
                TxInput::ToScript { .. } | TxInput::ToScriptHash { .. } => {
                    return Err(DbError::UnsupportedInput(*tx_hash));
                }
            }
        }

        let tx_id = batch.get_u64(Table::Properties, PROP_TX_COUNT, "tx count")?.unwrap_or(0);
        batch.put(Table::Properties, PROP_TX_COUNT.to_vec(), u64_key(tx_id + 1));
        batch.put(Table::Txs, tx_hash.as_bytes().to_vec(), tx.to_blob());
        let index = TxIndex {
            tx_id,
            block_height: height,
            unlock_time: tx.unlock_time,
        };
        batch.put(Table::TxIndices, tx_hash.as_bytes().to_vec(), encode(&index)?);

        let mut amount_output_indices = Vec::with_capacity(tx.outputs.len());
        for (i, output) in tx.outputs.iter().enumerate() {
            let (amount, commitment) = output_slot(tx, is_miner, i);
            let global_index = batch.output_count(amount)?;
            let data = OutputData {
                key: output.key,
                commitment,
                unlock_time: tx.unlock_time,
                height,
                tx_hash: *tx_hash,
                local_index: i as u32,
            };
            batch.put(Table::Outputs, output_key(amount, global_index), encode(&data)?);
            batch.put(Table::OutputCounts, u64_key(amount), u64_key(global_index + 1));
            amount_output_indices.push(global_index);
        }
        batch.put(Table::TxOutputs, u64_key(tx_id), encode(&amount_output_indices)?);

        self.stats.lock().time_add_transaction += started.elapsed();
        Ok(tx_id)
    }

    /// Remove the top block, returning it and its ordinary transactions
    pub fn pop_block(&self) -> Result<(Block, Vec<Transaction>), DbError> {
        let mut batch = self.batch_start()?;
        let popped = self.pop_block_from(&mut batch)?;
        batch.commit()?;
        Ok(popped)
    }

    /// Stage removal of the top block inside an existing batch
    pub fn pop_block_from(&self, batch: &mut BatchGuard<'_>) -> Result<(Block, Vec<Transaction>), DbError> {
        let savepoint = batch.savepoint();
        let result = self.stage_pop(batch);
        if result.is_err() {
            batch.rollback_to(savepoint);
        }
        result
    }

    fn stage_pop(&self, batch: &mut BatchGuard<'_>) -> Result<(Block, Vec<Transaction>), DbError> {
        let height = batch.height()?;
        let top = height
            .checked_sub(1)
            .ok_or_else(|| DbError::BlockNotFound("chain is empty".to_string()))?;

        let blob = batch
            .get(Table::Blocks, &u64_key(top))?
            .ok_or_else(|| DbError::Corrupt(format!("block {} missing below tip", top)))?;
        let block = Block::from_blob(&blob).map_err(|e| DbError::Corrupt(format!("block {}: {}", top, e)))?;
        let info = self.staged_block_info(batch, top)?;

        batch.delete(Table::Blocks, u64_key(top));
        batch.delete(Table::BlockHeights, info.hash.as_bytes().to_vec());
        batch.delete(Table::BlockInfo, u64_key(top));
        batch.put(Table::Properties, PROP_HEIGHT.to_vec(), u64_key(top));

        let mut txs = Vec::with_capacity(block.tx_hashes.len());
        for tx_hash in block.tx_hashes.iter().rev() {
            txs.push(self.remove_transaction(batch, tx_hash)?);
        }
        txs.reverse();
        self.remove_transaction(batch, &block.miner_tx.hash())?;

        debug!(height = top, hash = %info.hash, "block popped");
        Ok((block, txs))
    }

    fn remove_transaction(&self, batch: &mut BatchGuard<'_>, tx_hash: &Hash) -> Result<Transaction, DbError> {
        let blob = batch
            .get(Table::Txs, tx_hash.as_bytes())?
            .ok_or_else(|| DbError::Corrupt(format!("transaction {} missing", tx_hash)))?;
        let tx = Transaction::from_blob(&blob).map_err(|e| DbError::Corrupt(format!("transaction {}: {}", tx_hash, e)))?;
        let index: TxIndex = match batch.get(Table::TxIndices, tx_hash.as_bytes())? {
            Some(bytes) => decode(&bytes, "tx index")?,
            None => return Err(DbError::Corrupt(format!("transaction {} has no index", tx_hash))),
        };

        let mut is_miner = false;
        for input in &tx.inputs {
            match input {
                TxInput::Gen { .. } => is_miner = true,
                TxInput::ToKey { key_image, .. } => {
                    if !batch.contains(Table::SpentKeys, key_image.as_bytes())? {
                        return Err(DbError::Corrupt(format!("key image {} was never stored", key_image)));
                    }
                    batch.delete(Table::SpentKeys, key_image.as_bytes().to_vec());
                }
                _ => return Err(DbError::UnsupportedInput(*tx_hash)),
            }
        }

        let indices: Vec<u64> = match batch.get(Table::TxOutputs, &u64_key(index.tx_id))? {
            Some(bytes) => decode(&bytes, "tx outputs")?,
            None => return Err(DbError::Corrupt(format!("transaction {} has no output indices", tx_hash))),
        };
        if indices.len() != tx.outputs.len() {
            return Err(DbError::Corrupt(format!("transaction {} output count changed", tx_hash)));
        }
        for i in (0..tx.outputs.len()).rev() {
            let (amount, _) = output_slot(&tx, is_miner, i);
            let count = batch.output_count(amount)?;
            if count == 0 || indices[i] != count - 1 {
                return Err(DbError::Corrupt(format!(
                    "output {} of amount {} is not the newest ({} stored)",
                    indices[i], amount, count
                )));
            }
            batch.delete(Table::Outputs, output_key(amount, indices[i]));
            if indices[i] == 0 {
                batch.delete(Table::OutputCounts, u64_key(amount));
            } else {
                batch.put(Table::OutputCounts, u64_key(amount), u64_key(indices[i]));
            }
        }

        let tx_count = batch.get_u64(Table::Properties, PROP_TX_COUNT, "tx count")?.unwrap_or(0);
        if tx_count != index.tx_id + 1 {
            return Err(DbError::Corrupt(format!(
                "transaction {} has id {} but {} transactions are stored",
                tx_hash, index.tx_id, tx_count
            )));
        }
        batch.put(Table::Properties, PROP_TX_COUNT.to_vec(), u64_key(index.tx_id));
        batch.delete(Table::TxOutputs, u64_key(index.tx_id));
        batch.delete(Table::TxIndices, tx_hash.as_bytes().to_vec());
        batch.delete(Table::Txs, tx_hash.as_bytes().to_vec());

        Ok(tx)
    }

    fn staged_block_info(&self, batch: &BatchGuard<'_>, height: u64) -> Result<BlockInfo, DbError> {
        match batch.get(Table::BlockInfo, &u64_key(height))? {
            Some(bytes) => decode(&bytes, "block info"),
            None => Err(DbError::Corrupt(format!("block info {} missing", height))),
        }
    }

    /// Restore spent key images that a chain is known to be missing.
    /// Skipped on read-only stores; running it twice changes nothing.
    pub fn fixup(&self, plan: &FixupPlan) -> Result<usize, DbError> {
        if self.is_read_only() {
            info!("ledger is read-only, skipping fixup check");
            return Ok(0);
        }
        if plan.entries.is_empty() {
            return Ok(0);
        }
        if let Some(genesis) = plan.genesis_hash {
            if self.height()? == 0 || self.get_block_hash_from_height(0)? != genesis {
                return Ok(0);
            }
        }

        let mut batch = self.batch_start()?;
        let height = batch.height()?;
        let mut added = 0;
        for entry in plan.entries.iter().filter(|e| height > e.min_height) {
            for key_image in &entry.key_images {
                if !batch.contains(Table::SpentKeys, key_image.as_bytes())? {
                    info!(%key_image, "fixup: adding missing spent key");
                    batch.put(Table::SpentKeys, key_image.as_bytes().to_vec(), u64_key(entry.min_height));
                    added += 1;
                }
            }
        }
        batch.commit()?;
        Ok(added)
    }

    // ---- reads ----

    /// Number of blocks in the chain
    pub fn height(&self) -> Result<u64, DbError> {
        match self.engine()?.get_blob(Table::Properties, PROP_HEIGHT)? {
            Some(bytes) => decode_u64(&bytes, "height"),
            None => Ok(0),
        }
    }

    /// Total transactions stored, miner transactions included
    pub fn get_tx_count(&self) -> Result<u64, DbError> {
        match self.engine()?.get_blob(Table::Properties, PROP_TX_COUNT)? {
            Some(bytes) => decode_u64(&bytes, "tx count"),
            None => Ok(0),
        }
    }

    pub fn top_block_hash(&self) -> Result<Hash, DbError> {
        let height = self.height()?;
        let top = height
            .checked_sub(1)
            .ok_or_else(|| DbError::BlockNotFound("chain is empty".to_string()))?;
        self.get_block_hash_from_height(top)
    }

    pub fn block_exists(&self, hash: &Hash) -> Result<bool, DbError> {
        Ok(self.engine()?.get_blob(Table::BlockHeights, hash.as_bytes())?.is_some())
    }

    pub fn get_block_height(&self, hash: &Hash) -> Result<u64, DbError> {
        match self.engine()?.get_blob(Table::BlockHeights, hash.as_bytes())? {
            Some(bytes) => decode_u64(&bytes, "block height"),
            None => Err(DbError::BlockNotFound(hash.to_hex())),
        }
    }

    /// Decode the block at `height`. A blob that does not parse is corruption.
    pub fn get_block_by_height(&self, height: u64) -> Result<Block, DbError> {
        let blob = self
            .engine()?
            .get_blob(Table::Blocks, &u64_key(height))?
            .ok_or_else(|| DbError::BlockNotFound(format!("height {}", height)))?;
        Block::from_blob(&blob).map_err(|e| DbError::Corrupt(format!("block {}: {}", height, e)))
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Block, DbError> {
        let height = self.get_block_height(hash)?;
        self.get_block_by_height(height)
    }

    pub fn get_block_info(&self, height: u64) -> Result<BlockInfo, DbError> {
        match self.engine()?.get_blob(Table::BlockInfo, &u64_key(height))? {
            Some(bytes) => decode(&bytes, "block info"),
            None => Err(DbError::BlockNotFound(format!("height {}", height))),
        }
    }

    pub fn get_block_hash_from_height(&self, height: u64) -> Result<Hash, DbError> {
        Ok(self.get_block_info(height)?.hash)
    }

    pub fn get_block_timestamp(&self, height: u64) -> Result<u64, DbError> {
        Ok(self.get_block_info(height)?.timestamp)
    }

    pub fn get_block_cumulative_difficulty(&self, height: u64) -> Result<Difficulty, DbError> {
        Ok(self.get_block_info(height)?.cumulative_difficulty)
    }

    pub fn get_block_already_generated_coins(&self, height: u64) -> Result<u64, DbError> {
        Ok(self.get_block_info(height)?.coins_generated)
    }

    pub fn get_block_size(&self, height: u64) -> Result<u64, DbError> {
        Ok(self.get_block_info(height)?.size)
    }

    pub fn tx_exists(&self, hash: &Hash) -> Result<bool, DbError> {
        let started = Instant::now();
        let exists = self.engine()?.get_blob(Table::TxIndices, hash.as_bytes())?.is_some();
        self.stats.lock().time_tx_exists += started.elapsed();
        Ok(exists)
    }

    /// Look up a transaction that may legitimately be absent
    pub fn try_get_tx(&self, hash: &Hash) -> Result<Option<Transaction>, DbError> {
        match self.engine()?.get_blob(Table::Txs, hash.as_bytes())? {
            Some(blob) => Transaction::from_blob(&blob)
                .map(Some)
                .map_err(|e| DbError::Corrupt(format!("transaction {}: {}", hash, e))),
            None => Ok(None),
        }
    }

    /// Look up a transaction the caller knows is stored
    pub fn get_tx(&self, hash: &Hash) -> Result<Transaction, DbError> {
        self.try_get_tx(hash)?.ok_or(DbError::TxNotFound(*hash))
    }

    pub fn get_tx_index(&self, hash: &Hash) -> Result<TxIndex, DbError> {
        match self.engine()?.get_blob(Table::TxIndices, hash.as_bytes())? {
            Some(bytes) => decode(&bytes, "tx index"),
            None => Err(DbError::TxNotFound(*hash)),
        }
    }

    /// Global output indices assigned to each output of a transaction
    pub fn get_tx_amount_output_indices(&self, hash: &Hash) -> Result<Vec<u64>, DbError> {
        let index = self.get_tx_index(hash)?;
        match self.engine()?.get_blob(Table::TxOutputs, &u64_key(index.tx_id))? {
            Some(bytes) => decode(&bytes, "tx outputs"),
            None => Err(DbError::Corrupt(format!("transaction {} has no output indices", hash))),
        }
    }

    pub fn get_num_outputs(&self, amount: u64) -> Result<u64, DbError> {
        match self.engine()?.get_blob(Table::OutputCounts, &u64_key(amount))? {
            Some(bytes) => decode_u64(&bytes, "output count"),
            None => Ok(0),
        }
    }

    pub fn get_output(&self, amount: u64, index: u64) -> Result<OutputData, DbError> {
        match self.engine()?.get_blob(Table::Outputs, &output_key(amount, index))? {
            Some(bytes) => decode(&bytes, "output"),
            None => Err(DbError::OutputNotFound { amount, index }),
        }
    }

    pub fn has_key_image(&self, key_image: &KeyImage) -> Result<bool, DbError> {
        Ok(self.engine()?.get_blob(Table::SpentKeys, key_image.as_bytes())?.is_some())
    }

    /// Visit every spent key image; stops early and returns false when `f` does
    pub fn for_all_key_images<F: FnMut(&KeyImage) -> bool>(&self, mut f: F) -> Result<bool, DbError> {
        let engine = self.engine()?;
        for item in engine.cursor(Table::SpentKeys) {
            let (key, _) = item?;
            let raw: [u8; 32] = key
                .as_slice()
                .try_into()
                .map_err(|_| DbError::Corrupt(format!("key image with {} bytes", key.len())))?;
            if !f(&KeyImage(raw)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ---- statistics ----

    pub fn get_stats(&self) -> DbStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = DbStats::default();
    }

    pub fn show_stats(&self) {
        info!("ledger stats: {}", self.stats.lock());
    }
}
