//! Consensus module - Block structure, difficulty, hard forks and checkpoints

mod block;
mod checkpoints;
mod difficulty;
mod hardfork;

pub use block::*;
pub use checkpoints::*;
pub use difficulty::*;
pub use hardfork::*;
