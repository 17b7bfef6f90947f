//! Node module - genesis construction and the chain mutator

mod blockchain;
mod genesis;

pub use blockchain::*;
pub use genesis::*;
