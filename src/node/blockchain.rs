//! Chain mutator
//!
//! `Blockchain` is the one place blocks enter and leave the ledger. It checks
//! a candidate against the parent, checkpoints, fork schedule, signatures and
//! proof of work, then hands it to the [`BlockchainDb`] as one atomic unit.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::create_genesis_block;
use crate::config::NetworkParams;
use crate::consensus::{
    check_hash, next_difficulty, Block, CheckpointError, Checkpoints, Difficulty, DifficultyAlgorithm, HardFork,
    HardForkError, HardForkState,
};
use crate::crypto::{CryptoVerifier, Hash};
use crate::storage::{BlockchainDb, DbError};
use crate::validation::Transaction;

/// Reasons a chain operation failed
#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    HardFork(#[from] HardForkError),
    #[error("Block {hash} at height {height} contradicts a checkpoint")]
    CheckpointMismatch { height: u64, hash: Hash },
    #[error("Block builds on {got}, expected {expected}")]
    WrongPrevious { expected: Hash, got: Hash },
    #[error("Miner transaction {0} must have exactly one coinbase input")]
    BadMinerTx(Hash),
    #[error("Transaction {index} carries a coinbase input")]
    UnexpectedCoinbase { index: usize },
    #[error("Output amounts overflow at height {height}")]
    AmountOverflow { height: u64 },
    #[error("Miner transaction claims height {got:?}, expected {expected}")]
    BadMinerHeight { expected: u64, got: Option<u64> },
    #[error("Block at height {height} has version {got}, expected {expected}")]
    BadVersion { height: u64, expected: u8, got: u8 },
    #[error("Transaction {index} does not match its listed hash")]
    TxHashMismatch { index: usize },
    #[error("Difficulty computation overflowed at height {height}")]
    DifficultyOverflow { height: u64 },
    #[error("Block at height {height} does not meet difficulty {difficulty}")]
    InsufficientWork { height: u64, difficulty: Difficulty },
    #[error("Cannot pop the genesis block")]
    CannotPopGenesis,
    #[error("Invalid signature on transaction {0}")]
    InvalidSignature(Hash),
}

impl ChainError {
    pub fn is_fatal(&self) -> bool {
        match self {
            ChainError::Db(e) => e.is_fatal(),
            ChainError::HardFork(_) => true,
            _ => false,
        }
    }
}

/// Block selector for lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Height(u64),
    Hash(Hash),
}

/// Snapshot of the chain tip
#[derive(Debug, Clone)]
pub struct ChainStatus {
    pub height: u64,
    pub top_hash: Hash,
    pub hard_fork_version: u8,
    pub next_difficulty: Difficulty,
    pub cumulative_difficulty: Difficulty,
    pub already_generated_coins: u64,
    pub hard_fork_state: HardForkState,
}

/// Chain mutator over one ledger, checkpoint registry and fork schedule
pub struct Blockchain {
    db: Arc<BlockchainDb>,
    checkpoints: Arc<RwLock<Checkpoints>>,
    hard_fork: Arc<HardFork>,
    params: Arc<NetworkParams>,
    verifier: Arc<dyn CryptoVerifier>,
    /// Serializes check-then-write sequences
    accept: Mutex<()>,
}

impl Blockchain {
    /// Wire the mutator to an open ledger. The fork schedule is built from
    /// `params` and attached to the ledger.
    pub fn new(
        db: Arc<BlockchainDb>,
        checkpoints: Checkpoints,
        params: Arc<NetworkParams>,
        verifier: Arc<dyn CryptoVerifier>,
    ) -> Result<Self, ChainError> {
        let hard_fork = Arc::new(HardFork::new(params.hard_forks.clone())?);
        db.set_hard_fork(hard_fork.clone())?;
        Ok(Self {
            db,
            checkpoints: Arc::new(RwLock::new(checkpoints)),
            hard_fork,
            params,
            verifier,
            accept: Mutex::new(()),
        })
    }

    /// Store the genesis block on an empty writable ledger and run the
    /// post-open repair
    pub fn init(&self) -> Result<(), ChainError> {
        if self.db.height()? == 0 && !self.db.is_read_only() {
            let genesis = create_genesis_block(&self.params.genesis);
            info!(network = %self.params.network, hash = %genesis.hash(), "storing genesis block");
            self.add_block(&genesis, &[])?;
        }
        let repaired = self.db.fixup(&self.params.fixup)?;
        if repaired > 0 {
            info!(repaired, "fixup restored spent key images");
        }
        Ok(())
    }

    pub fn db(&self) -> &Arc<BlockchainDb> {
        &self.db
    }

    pub fn hard_fork(&self) -> &Arc<HardFork> {
        &self.hard_fork
    }

    pub fn checkpoints(&self) -> &Arc<RwLock<Checkpoints>> {
        &self.checkpoints
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    /// Number of blocks in the chain
    pub fn height(&self) -> Result<u64, ChainError> {
        Ok(self.db.height()?)
    }

    pub fn top_hash(&self) -> Result<Hash, ChainError> {
        Ok(self.db.top_block_hash()?)
    }

    pub fn current_hardfork_version(&self, height: u64) -> u8 {
        self.hard_fork.current_version(height)
    }

    /// Difficulty the block at `height` must meet
    fn difficulty_at(&self, height: u64) -> Result<Difficulty, ChainError> {
        let algorithm = DifficultyAlgorithm::for_version(self.hard_fork.current_version(height));
        let start = height.saturating_sub(algorithm.blocks_count() as u64);

        let mut timestamps = Vec::with_capacity((height - start) as usize);
        let mut cumulative = Vec::with_capacity((height - start) as usize);
        for h in start..height {
            let info = self.db.get_block_info(h)?;
            timestamps.push(info.timestamp);
            cumulative.push(info.cumulative_difficulty);
        }

        Ok(next_difficulty(&timestamps, &cumulative, self.params.difficulty_target, algorithm))
    }

    /// Difficulty the next block must meet. Zero means the computation
    /// overflowed and no block can be accepted.
    pub fn next_difficulty(&self) -> Result<Difficulty, ChainError> {
        self.difficulty_at(self.db.height()?)
    }

    /// Validate a candidate and append it. Returns its height.
    pub fn add_block(&self, block: &Block, txs: &[Transaction]) -> Result<u64, ChainError> {
        let _accept = self.accept.lock();
        let height = self.db.height()?;
        let hash = block.hash();

        let expected_prev = if height == 0 { Hash::zero() } else { self.db.top_block_hash()? };
        if block.header.prev_hash != expected_prev {
            return Err(ChainError::WrongPrevious {
                expected: expected_prev,
                got: block.header.prev_hash,
            });
        }
        if !block.miner_tx.is_miner_tx() {
            return Err(ChainError::BadMinerTx(block.miner_tx.hash()));
        }
        if block.miner_height() != Some(height) {
            return Err(ChainError::BadMinerHeight {
                expected: height,
                got: block.miner_height(),
            });
        }

        let check = self.checkpoints.read().check_block_detailed(height, &hash);
        if !check.passed {
            return Err(ChainError::CheckpointMismatch { height, hash });
        }

        let expected_version = self.hard_fork.current_version(height);
        if block.header.major_version != expected_version {
            return Err(ChainError::BadVersion {
                height,
                expected: expected_version,
                got: block.header.major_version,
            });
        }

        if txs.len() != block.tx_hashes.len() {
            return Err(DbError::TxCountMismatch {
                hashes: block.tx_hashes.len(),
                txs: txs.len(),
            }
            .into());
        }
        for (index, (tx, listed)) in txs.iter().zip(&block.tx_hashes).enumerate() {
            if tx.hash() != *listed {
                return Err(ChainError::TxHashMismatch { index });
            }
            if tx.has_gen_input() {
                return Err(ChainError::UnexpectedCoinbase { index });
            }
            if !tx.verify_signatures(self.verifier.as_ref()) {
                return Err(ChainError::InvalidSignature(*listed));
            }
        }

        let difficulty = self.difficulty_at(height)?;
        if difficulty == 0 {
            return Err(ChainError::DifficultyOverflow { height });
        }
        // a pinned hash already vouches for the work
        if !check.is_checkpoint && !check_hash(&block.pow_hash(), difficulty) {
            return Err(ChainError::InsufficientWork { height, difficulty });
        }

        let (prev_cumulative, prev_coins) = match height.checked_sub(1) {
            Some(parent) => {
                let info = self.db.get_block_info(parent)?;
                (info.cumulative_difficulty, info.coins_generated)
            }
            None => (0, 0),
        };
        let cumulative_difficulty = prev_cumulative
            .checked_add(difficulty)
            .ok_or(ChainError::DifficultyOverflow { height })?;
        let coins_generated = block
            .miner_tx
            .total_output_value()
            .and_then(|reward| prev_coins.checked_add(reward))
            .ok_or(ChainError::AmountOverflow { height })?;
        let block_size = (block.to_blob().len() + txs.iter().map(|tx| tx.to_blob().len()).sum::<usize>()) as u64;

        let prev_height = self.db.add_block(block, block_size, cumulative_difficulty, coins_generated, txs)?;
        info!(height, %hash, difficulty, txs = txs.len(), "block added");
        Ok(prev_height)
    }

    /// Remove the top block. The genesis block stays.
    pub fn pop_block(&self) -> Result<(Block, Vec<Transaction>), ChainError> {
        let _accept = self.accept.lock();
        if self.db.height()? <= 1 {
            return Err(ChainError::CannotPopGenesis);
        }
        let popped = self.db.pop_block()?;
        info!(height = self.db.height()?, hash = %popped.0.hash(), "block popped");
        Ok(popped)
    }

    /// Remove up to `count` blocks in one batch, never the genesis block.
    /// Returns how many were removed.
    pub fn pop_blocks(&self, count: u64) -> Result<u64, ChainError> {
        let _accept = self.accept.lock();
        let height = self.db.height()?;
        let count = count.min(height.saturating_sub(1));
        if count == 0 {
            return Ok(0);
        }

        let mut batch = self.db.batch_start()?;
        for _ in 0..count {
            self.db.pop_block_from(&mut batch)?;
        }
        batch.commit()?;
        info!(popped = count, height = height - count, "blocks popped");
        Ok(count)
    }

    pub fn get_block(&self, id: BlockId) -> Result<Block, ChainError> {
        Ok(match id {
            BlockId::Height(height) => self.db.get_block_by_height(height)?,
            BlockId::Hash(hash) => self.db.get_block(&hash)?,
        })
    }

    pub fn get_tx(&self, hash: &Hash) -> Result<Option<Transaction>, ChainError> {
        Ok(self.db.try_get_tx(hash)?)
    }

    /// Whether an alternative block at `block_height` may be considered
    pub fn is_alternative_block_allowed(&self, block_height: u64) -> Result<bool, ChainError> {
        let height = self.db.height()?;
        Ok(self.checkpoints.read().is_alternative_block_allowed(height, block_height))
    }

    /// Re-read the checkpoint file and, when enabled, DNS. The fetch runs on a
    /// snapshot and its new pins are merged into the live registry, so pins
    /// added meanwhile survive. Stored blocks that contradict a new pin are
    /// reported but not removed.
    pub async fn refresh_checkpoints(&self, json_path: Option<&Path>, dns: bool) -> Result<usize, ChainError> {
        let mut fresh = self.checkpoints.read().clone();
        let hosts = dns.then_some(self.params.dns_checkpoint_hosts.as_slice());
        fresh.load_new_checkpoints(json_path, hosts).await?;

        let height = self.db.height()?;
        for (&pinned_height, pinned) in fresh.get_points().range(..height) {
            let stored = self.db.get_block_hash_from_height(pinned_height)?;
            if stored != *pinned {
                warn!(height = pinned_height, %stored, %pinned, "stored block contradicts checkpoint");
            }
        }

        let added = self.checkpoints.write().merge_from(&fresh);
        debug!(added, "checkpoints refreshed");
        Ok(added)
    }

    pub fn status(&self, now: u64) -> Result<ChainStatus, ChainError> {
        let height = self.db.height()?;
        let top = height.checked_sub(1).ok_or_else(|| DbError::BlockNotFound("chain is empty".to_string()))?;
        let info = self.db.get_block_info(top)?;
        Ok(ChainStatus {
            height,
            top_hash: info.hash,
            hard_fork_version: self.hard_fork.get_current_version(),
            next_difficulty: self.difficulty_at(height)?,
            cumulative_difficulty: info.cumulative_difficulty,
            already_generated_coins: info.coins_generated,
            hard_fork_state: self.hard_fork.get_state(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Network;
    use crate::consensus::{BlockHeader, HardForkEntry};
    use crate::constants::MINED_MONEY_UNLOCK_WINDOW;
    use crate::crypto::{KeyImage, NullVerifier, PublicKey};
    use crate::storage::{MemoryEngine, OpenMode};
    use crate::validation::{TxInput, TxOutput};

    struct RejectAll;

    impl CryptoVerifier for RejectAll {
        fn verify_ring_signature(&self, _: &Hash, _: &Transaction) -> bool {
            false
        }

        fn verify_rct_proof(&self, _: &Hash, _: &Transaction) -> bool {
            false
        }
    }

    fn chain_with(params: NetworkParams, checkpoints: Checkpoints, verifier: Arc<dyn CryptoVerifier>) -> Blockchain {
        let db = Arc::new(BlockchainDb::new());
        db.open_with_engine(Arc::new(MemoryEngine::new()), OpenMode::ReadWrite).unwrap();
        let chain = Blockchain::new(db, checkpoints, Arc::new(params), verifier).unwrap();
        chain.init().unwrap();
        chain
    }

    fn testnet() -> Blockchain {
        chain_with(
            NetworkParams::for_network(Network::Testnet),
            Checkpoints::new(),
            Arc::new(NullVerifier),
        )
    }

    fn next_block(chain: &Blockchain, spacing: u64, txs: &[Transaction]) -> Block {
        let height = chain.height().unwrap();
        let miner = Transaction::miner(
            1,
            height,
            vec![TxOutput { amount: 100, key: PublicKey([height as u8; 32]) }],
            MINED_MONEY_UNLOCK_WINDOW,
        );
        Block::new(
            BlockHeader::new(chain.current_hardfork_version(height), 0, height * spacing, chain.top_hash().unwrap(), 0),
            miner,
            txs.iter().map(Transaction::hash).collect(),
        )
    }

    fn spend(image: u8) -> Transaction {
        Transaction {
            version: 1,
            unlock_time: 0,
            inputs: vec![TxInput::ToKey { amount: 5, key_offsets: vec![0], key_image: KeyImage([image; 32]) }],
            outputs: vec![TxOutput { amount: 4, key: PublicKey([1; 32]) }],
            extra: vec![],
            signatures: vec![vec![image]],
            rct: None,
        }
    }

    #[test]
    fn test_init_stores_genesis_once() {
        let chain = testnet();
        assert_eq!(chain.height().unwrap(), 1);
        let genesis = chain.get_block(BlockId::Height(0)).unwrap();
        assert!(genesis.is_genesis());
        chain.init().unwrap();
        assert_eq!(chain.height().unwrap(), 1);
    }

    #[test]
    fn test_add_and_lookup() {
        let chain = testnet();
        let tx = spend(1);
        let block = next_block(&chain, 240, std::slice::from_ref(&tx));
        assert_eq!(chain.add_block(&block, std::slice::from_ref(&tx)).unwrap(), 1);
        assert_eq!(chain.get_block(BlockId::Hash(block.hash())).unwrap(), block);
        assert_eq!(chain.get_tx(&tx.hash()).unwrap(), Some(tx));
        assert_eq!(chain.next_difficulty().unwrap(), 1);

        let status = chain.status(0).unwrap();
        assert_eq!(status.height, 2);
        assert_eq!(status.top_hash, block.hash());
        assert_eq!(status.cumulative_difficulty, 2);
    }

    #[test]
    fn test_rejects_wrong_parent_and_height() {
        let chain = testnet();
        let mut block = next_block(&chain, 240, &[]);
        block.header.prev_hash = Hash::zero();
        assert!(matches!(chain.add_block(&block, &[]), Err(ChainError::WrongPrevious { .. })));

        let mut block = next_block(&chain, 240, &[]);
        block.miner_tx = Transaction::miner(1, 7, vec![], MINED_MONEY_UNLOCK_WINDOW);
        assert!(matches!(
            chain.add_block(&block, &[]),
            Err(ChainError::BadMinerHeight { expected: 1, got: Some(7) })
        ));
    }

    #[test]
    fn test_rejects_checkpoint_mismatch() {
        let mut checkpoints = Checkpoints::new();
        checkpoints.add_checkpoint(1, Hash([7; 32])).unwrap();
        let chain = chain_with(NetworkParams::for_network(Network::Testnet), checkpoints, Arc::new(NullVerifier));

        let block = next_block(&chain, 240, &[]);
        let err = chain.add_block(&block, &[]).unwrap_err();
        assert!(matches!(err, ChainError::CheckpointMismatch { height: 1, .. }));
        assert!(!err.is_fatal());
        assert_eq!(chain.height().unwrap(), 1);
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut params = NetworkParams::for_network(Network::Testnet);
        params.hard_forks = vec![HardForkEntry::new(1, 0, 0, 0), HardForkEntry::new(2, 2, 0, 0)];
        let chain = chain_with(params, Checkpoints::new(), Arc::new(NullVerifier));

        chain.add_block(&next_block(&chain, 240, &[]), &[]).unwrap();
        let mut block = next_block(&chain, 240, &[]);
        assert_eq!(block.header.major_version, 2);
        block.header.major_version = 1;
        assert!(matches!(
            chain.add_block(&block, &[]),
            Err(ChainError::BadVersion { height: 2, expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_rejects_bad_signature_and_hash_mismatch() {
        let chain = chain_with(NetworkParams::for_network(Network::Testnet), Checkpoints::new(), Arc::new(RejectAll));
        let tx = spend(1);
        let block = next_block(&chain, 240, std::slice::from_ref(&tx));
        assert!(matches!(chain.add_block(&block, &[tx]), Err(ChainError::InvalidSignature(_))));

        let block = next_block(&chain, 240, &[spend(2)]);
        assert!(matches!(
            chain.add_block(&block, &[spend(3)]),
            Err(ChainError::TxHashMismatch { index: 0 })
        ));
    }

    #[test]
    fn test_rejects_insufficient_work() {
        let mut params = NetworkParams::for_network(Network::Testnet);
        params.difficulty_target = 1_000_000_000_000_000;
        let chain = chain_with(params, Checkpoints::new(), Arc::new(NullVerifier));

        // a single sample is always mineable
        chain.add_block(&next_block(&chain, 1, &[]), &[]).unwrap();
        let err = chain.add_block(&next_block(&chain, 1, &[]), &[]).unwrap_err();
        assert!(matches!(err, ChainError::InsufficientWork { height: 2, .. }));
    }

    #[test]
    fn test_double_spend_rejected() {
        let chain = testnet();
        let tx = spend(1);
        chain.add_block(&next_block(&chain, 240, std::slice::from_ref(&tx)), std::slice::from_ref(&tx)).unwrap();

        let mut again = spend(1);
        again.outputs[0].amount = 3;
        let block = next_block(&chain, 240, std::slice::from_ref(&again));
        assert!(matches!(
            chain.add_block(&block, &[again]),
            Err(ChainError::Db(DbError::KeyImageSpent(_)))
        ));
    }

    #[test]
    fn test_rejects_miner_tx_with_extra_input() {
        let chain = testnet();
        let mut block = next_block(&chain, 240, &[]);
        block.miner_tx.inputs.push(TxInput::ToKey { amount: 1, key_offsets: vec![0], key_image: KeyImage([4; 32]) });

        let err = chain.add_block(&block, &[]).unwrap_err();
        assert!(matches!(err, ChainError::BadMinerTx(_)));
        assert!(!err.is_fatal());
        assert_eq!(chain.height().unwrap(), 1);

        // the store still reads back and grows
        chain.get_block(BlockId::Height(0)).unwrap();
        chain.add_block(&next_block(&chain, 240, &[]), &[]).unwrap();
        chain.pop_block().unwrap();
    }

    #[test]
    fn test_rejects_overflowing_miner_outputs() {
        let chain = testnet();
        let mut block = next_block(&chain, 240, &[]);
        block.miner_tx.outputs = vec![
            TxOutput { amount: u64::MAX, key: PublicKey([1; 32]) },
            TxOutput { amount: 1, key: PublicKey([2; 32]) },
        ];
        assert!(matches!(
            chain.add_block(&block, &[]),
            Err(ChainError::AmountOverflow { height: 1 })
        ));
        assert_eq!(chain.height().unwrap(), 1);
    }

    #[test]
    fn test_rejects_coinbase_as_ordinary_tx() {
        let chain = chain_with(NetworkParams::for_network(Network::Testnet), Checkpoints::new(), Arc::new(RejectAll));
        let minting = Transaction::miner(1, 12345, vec![TxOutput { amount: 1_000_000, key: PublicKey([6; 32]) }], 0);
        let block = next_block(&chain, 240, std::slice::from_ref(&minting));

        assert!(matches!(
            chain.add_block(&block, &[minting]),
            Err(ChainError::UnexpectedCoinbase { index: 0 })
        ));
        assert_eq!(chain.db().get_num_outputs(1_000_000).unwrap(), 0);
    }

    #[test]
    fn test_pop_keeps_genesis() {
        let chain = testnet();
        assert!(matches!(chain.pop_block(), Err(ChainError::CannotPopGenesis)));

        for _ in 0..4 {
            chain.add_block(&next_block(&chain, 240, &[]), &[]).unwrap();
        }
        let top = chain.top_hash().unwrap();
        let (popped, txs) = chain.pop_block().unwrap();
        assert_eq!(popped.hash(), top);
        assert!(txs.is_empty());

        assert_eq!(chain.pop_blocks(100).unwrap(), 3);
        assert_eq!(chain.height().unwrap(), 1);
        assert_eq!(chain.pop_blocks(1).unwrap(), 0);
    }

    #[test]
    fn test_alternative_blocks_respect_checkpoints() {
        let chain = testnet();
        for _ in 0..3 {
            chain.add_block(&next_block(&chain, 240, &[]), &[]).unwrap();
        }
        let pinned = chain.get_block(BlockId::Height(2)).unwrap().hash();
        chain.checkpoints().write().add_checkpoint(2, pinned).unwrap();

        assert!(!chain.is_alternative_block_allowed(2).unwrap());
        assert!(chain.is_alternative_block_allowed(3).unwrap());
        assert!(!chain.is_alternative_block_allowed(0).unwrap());
    }

    #[test]
    fn test_hard_fork_version_lookup() {
        let chain = testnet();
        assert_eq!(chain.current_hardfork_version(0), 1);
        assert_eq!(chain.current_hardfork_version(5150), 2);
        assert_eq!(chain.hard_fork().get_current_version(), 1);
    }

    #[tokio::test]
    async fn test_refresh_checkpoints_from_file() {
        use std::io::Write;

        let chain = testnet();
        chain.add_block(&next_block(&chain, 240, &[]), &[]).unwrap();
        let stored = chain.top_hash().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"hashlines\":[{{\"height\":1,\"hash\":\"{}\"}}]}}", stored.to_hex()).unwrap();

        assert_eq!(chain.refresh_checkpoints(Some(file.path()), false).await.unwrap(), 1);
        assert!(chain.checkpoints().read().check_block(1, &stored));
    }
}
