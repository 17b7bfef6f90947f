//! Storage module - ledger store and its backing engines

mod db;
mod engine;
mod memory;
mod sled_engine;

pub use db::*;
pub use engine::*;
pub use memory::*;
pub use sled_engine::*;
