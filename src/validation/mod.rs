//! Validation module - transaction structure and decoding

mod transaction;

pub use transaction::*;
