//! Block structure
//!
//! A block is a header, the miner transaction, and the hashes of the
//! ordinary transactions it includes. The transactions themselves travel
//! next to the block and are stored in their own table.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{compute_merkle_root, hash_bytes, hash_with_domain, Hash};
use crate::validation::Transaction;

/// Block decoding errors
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Malformed block blob: {0}")]
    Malformed(String),
    #[error("Block has no miner transaction input")]
    MissingMinerInput,
}

/// Block header
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    /// Consensus rule version the block was produced under
    pub major_version: u8,
    /// Vote for the next rule version
    pub minor_version: u8,
    /// Block timestamp (seconds since Unix epoch)
    pub timestamp: u64,
    /// Hash of the previous block
    pub prev_hash: Hash,
    /// Nonce used for PoW
    pub nonce: u32,
}

impl BlockHeader {
    pub fn new(major_version: u8, minor_version: u8, timestamp: u64, prev_hash: Hash, nonce: u32) -> Self {
        Self {
            major_version,
            minor_version,
            timestamp,
            prev_hash,
            nonce,
        }
    }

    /// Serialize the header for hashing
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + 1 + 8 + 32 + 4);
        bytes.push(self.major_version);
        bytes.push(self.minor_version);
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.prev_hash.0);
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        bytes
    }
}

/// A block as stored in the ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub miner_tx: Transaction,
    pub tx_hashes: Vec<Hash>,
}

impl Block {
    pub fn new(header: BlockHeader, miner_tx: Transaction, tx_hashes: Vec<Hash>) -> Self {
        Self {
            header,
            miner_tx,
            tx_hashes,
        }
    }

    /// Root over the miner transaction followed by the ordinary transactions
    pub fn tx_tree_root(&self) -> Hash {
        let mut leaves = Vec::with_capacity(self.tx_hashes.len() + 1);
        leaves.push(self.miner_tx.hash());
        leaves.extend_from_slice(&self.tx_hashes);
        compute_merkle_root(&leaves)
    }

    /// Header, tree root and transaction count: the data a block id commits to
    pub fn hashing_blob(&self) -> Vec<u8> {
        let mut blob = self.header.to_bytes();
        blob.extend_from_slice(&self.tx_tree_root().0);
        blob.extend_from_slice(&(self.tx_hashes.len() as u64 + 1).to_le_bytes());
        blob
    }

    /// Block id
    pub fn hash(&self) -> Hash {
        hash_bytes(&self.hashing_blob())
    }

    /// Proof-of-work hash. Kept separate from the id so the PoW function
    /// can change across forks without renaming blocks.
    pub fn pow_hash(&self) -> Hash {
        hash_with_domain(b"pow", &self.hashing_blob())
    }

    /// Height claimed by the miner transaction
    pub fn miner_height(&self) -> Option<u64> {
        match self.miner_tx.inputs.first() {
            Some(crate::validation::TxInput::Gen { height }) => Some(*height),
            _ => None,
        }
    }

    pub fn prev_hash(&self) -> &Hash {
        &self.header.prev_hash
    }

    pub fn is_genesis(&self) -> bool {
        self.header.prev_hash == Hash::zero()
    }

    pub fn to_blob(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Decode and structurally validate a block blob
    pub fn from_blob(blob: &[u8]) -> Result<Self, BlockError> {
        let block: Block =
            bincode::deserialize(blob).map_err(|e| BlockError::Malformed(e.to_string()))?;
        if !block.miner_tx.is_miner_tx() {
            return Err(BlockError::MissingMinerInput);
        }
        Ok(block)
    }
}
