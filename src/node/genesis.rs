//! Genesis block generation
//!
//! Every network's first block is fully determined by its
//! [`GenesisParams`]: a single miner transaction paying the genesis reward
//! to a fixed key, with no previous block.

use crate::config::{GenesisParams, NetworkParams};
use crate::consensus::{Block, BlockHeader};
use crate::constants::MINED_MONEY_UNLOCK_WINDOW;
use crate::crypto::{hash_with_domain, Hash, PublicKey};
use crate::validation::{Transaction, TxOutput};

/// Create the genesis block
///
/// Produces a byte-for-byte identical block for the same parameters.
pub fn create_genesis_block(params: &GenesisParams) -> Block {
    let key = PublicKey(hash_with_domain(b"genesis-output", &params.nonce.to_le_bytes()).0);
    let miner_tx = Transaction::miner(
        1,
        0,
        vec![TxOutput {
            amount: params.reward,
            key,
        }],
        MINED_MONEY_UNLOCK_WINDOW,
    );

    let header = BlockHeader::new(params.major_version, 0, params.timestamp, Hash::zero(), params.nonce);
    Block::new(header, miner_tx, Vec::new())
}

/// Genesis hash of a network
pub fn genesis_hash(params: &NetworkParams) -> Hash {
    create_genesis_block(&params.genesis).hash()
}

/// Genesis block summary
#[derive(Debug)]
pub struct GenesisInfo {
    pub hash: Hash,
    pub timestamp: u64,
    pub nonce: u32,
    pub reward: u64,
}

impl GenesisInfo {
    pub fn new(params: &NetworkParams) -> Self {
        let genesis = create_genesis_block(&params.genesis);
        Self {
            hash: genesis.hash(),
            timestamp: genesis.header.timestamp,
            nonce: genesis.header.nonce,
            reward: params.genesis.reward,
        }
    }
}
