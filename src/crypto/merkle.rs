//! Transaction tree root
//!
//! Blocks commit to their transactions through a binary tree over the miner
//! transaction hash followed by the ordinary transaction hashes. Unlike a
//! duplicate-last Merkle tree, leaves beyond the largest power of two are
//! folded in first so every leaf is hashed exactly once per level.

use super::{hash_pair, Hash};

/// Compute the tree root of a list of hashes.
///
/// Returns the zero hash for an empty list and the single element for a
/// one-element list.
pub fn compute_merkle_root(hashes: &[Hash]) -> Hash {
    match hashes.len() {
        0 => Hash::zero(),
        1 => hashes[0],
        2 => hash_pair(&hashes[0], &hashes[1]),
        count => {
            // largest power of two strictly below count
            let mut width = 1usize;
            while width * 2 < count {
                width *= 2;
            }

            let carried = 2 * width - count;
            let mut level: Vec<Hash> = Vec::with_capacity(width);
            level.extend_from_slice(&hashes[..carried]);
            for pair in hashes[carried..].chunks(2) {
                level.push(hash_pair(&pair[0], &pair[1]));
            }

            while level.len() > 1 {
                level = level
                    .chunks(2)
                    .map(|pair| hash_pair(&pair[0], &pair[1]))
                    .collect();
            }
            level[0]
        }
    }
}
