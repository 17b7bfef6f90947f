//! Cryptonode core library
//!
//! Ledger storage, difficulty retargeting, checkpoints and hard-fork
//! governance for a CryptoNote-style full node.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod node;
pub mod storage;
pub mod validation;

/// Protocol constants
pub mod constants {
    /// Target block time in seconds
    pub const DIFFICULTY_TARGET: u64 = 240;

    /// Samples considered by the V1 trimmed mean
    pub const DIFFICULTY_WINDOW: usize = 720;

    /// Samples trimmed from each end of the V1 window
    pub const DIFFICULTY_CUT: usize = 60;

    /// Samples kept by V2 after trimming
    pub const DIFFICULTY_WINDOW_V2: usize = 17;

    /// Samples trimmed from each end of the V2 window
    pub const DIFFICULTY_CUT_V2: usize = 6;

    /// Samples considered by V2
    pub const DIFFICULTY_BLOCKS_COUNT_V2: usize = DIFFICULTY_WINDOW_V2 + 2 * DIFFICULTY_CUT_V2;

    /// Solve times averaged by LWMA
    pub const DIFFICULTY_WINDOW_V3: usize = 60;

    /// Furthest a timestamp may run ahead under LWMA, in seconds
    pub const BLOCK_FUTURE_TIME_LIMIT_V3: u64 = DIFFICULTY_TARGET * 3;

    /// Blocks before a miner output can be spent
    pub const MINED_MONEY_UNLOCK_WINDOW: u64 = 60;
}
