//! Cryptography module - BLAKE3 hashing, tree roots, key types and the
//! verification boundary

mod hash;
mod keys;
mod merkle;
mod verifier;

pub use hash::*;
pub use keys::*;
pub use merkle::*;
pub use verifier::*;
