//! Property-based tests for the consensus leaves
//!
//! Checkpoint merge rules, fork lookups and difficulty arithmetic under
//! random inputs.

use proptest::prelude::*;
use cryptonode::consensus::{
    check_hash, next_difficulty, next_difficulty_v1, next_difficulty_v3, Checkpoints, DifficultyAlgorithm,
    HardFork, HardForkEntry,
};
use cryptonode::constants::{DIFFICULTY_TARGET, DIFFICULTY_WINDOW, DIFFICULTY_WINDOW_V3};
use cryptonode::crypto::Hash;

fn steady_chain(count: usize, spacing: u64, difficulty: u64) -> (Vec<u64>, Vec<u64>) {
    let timestamps = (0..count as u64).map(|i| 1_000 + i * spacing).collect();
    let cumulative = (0..count as u64).map(|i| (i + 1) * difficulty).collect();
    (timestamps, cumulative)
}

/// `hash * difficulty < 2^256`, by schoolbook multiplication over 32-bit limbs
fn product_fits(hash: &[u8; 32], difficulty: u64) -> bool {
    let a: Vec<u64> = hash
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as u64)
        .collect();
    let b = [difficulty & 0xffff_ffff, difficulty >> 32];
    let mut r = [0u64; 10];
    for (i, &x) in a.iter().enumerate() {
        let mut carry = 0u64;
        for (j, &y) in b.iter().enumerate() {
            let cur = r[i + j] + x * y + carry;
            r[i + j] = cur & 0xffff_ffff;
            carry = cur >> 32;
        }
        let mut k = i + 2;
        while carry > 0 {
            let cur = r[k] + carry;
            r[k] = cur & 0xffff_ffff;
            carry = cur >> 32;
            k += 1;
        }
    }
    r[8] == 0 && r[9] == 0
}

// ============================================================================
// CHECKPOINTS
// ============================================================================

proptest! {
    /// Adding the same pin twice leaves the registry unchanged
    #[test]
    fn prop_checkpoint_add_idempotent(height in any::<u64>(), bytes in any::<[u8; 32]>()) {
        let mut checkpoints = Checkpoints::new();
        checkpoints.add_checkpoint(height, Hash(bytes)).unwrap();
        let before = checkpoints.get_points().clone();
        prop_assert!(checkpoints.add_checkpoint(height, Hash(bytes)).is_ok());
        prop_assert_eq!(checkpoints.get_points(), &before);
    }

    /// A conflicting pin fails and the first one survives
    #[test]
    fn prop_checkpoint_conflict_keeps_first(
        height in any::<u64>(),
        a in any::<[u8; 32]>(),
        b in any::<[u8; 32]>()
    ) {
        prop_assume!(a != b);
        let mut checkpoints = Checkpoints::new();
        checkpoints.add_checkpoint(height, Hash(a)).unwrap();
        prop_assert!(checkpoints.add_checkpoint(height, Hash(b)).is_err());
        prop_assert_eq!(checkpoints.get_points()[&height], Hash(a));
    }

    /// Alternatives are never allowed at or below the checkpoint under the tip
    #[test]
    fn prop_alternative_blocks_stay_above_checkpoint(
        pins in prop::collection::btree_set(1u64..10_000, 1..20),
        chain_height in 0u64..12_000,
        candidate in 0u64..12_000
    ) {
        let mut checkpoints = Checkpoints::new();
        for &h in &pins {
            checkpoints.add_checkpoint(h, Hash([h as u8; 32])).unwrap();
        }
        let allowed = checkpoints.is_alternative_block_allowed(chain_height, candidate);
        let guard = pins.range(..=chain_height).next_back();
        let expected = candidate > 0 && guard.map_or(true, |&g| candidate > g);
        prop_assert_eq!(allowed, expected);
    }
}

// ============================================================================
// HARD FORKS
// ============================================================================

proptest! {
    /// Lookup agrees with a linear scan and never decreases with height
    #[test]
    fn prop_hardfork_lookup_monotonic(
        heights in prop::collection::btree_set(0u64..100_000, 1..12),
        probes in prop::collection::vec(0u64..120_000, 1..50)
    ) {
        let entries: Vec<HardForkEntry> = heights
            .iter()
            .enumerate()
            .map(|(i, &h)| HardForkEntry::new(i as u8 + 1, h, 0, 0))
            .collect();
        let hf = HardFork::new(entries.clone()).unwrap();

        let mut sorted = probes.clone();
        sorted.sort_unstable();
        let mut last = 0;
        for height in sorted {
            let version = hf.current_version(height);
            let scanned = entries.iter().filter(|e| e.height <= height).last().map_or(1, |e| e.version);
            prop_assert_eq!(version, scanned);
            prop_assert!(version >= last);
            last = version;
        }
    }

    /// The tip cursor agrees with direct lookup after any add/pop sequence
    #[test]
    fn prop_hardfork_cursor_matches_lookup(adds in 1u64..300, pops in 0u64..300) {
        let hf = HardFork::new(vec![
            HardForkEntry::new(1, 0, 0, 0),
            HardForkEntry::new(2, 50, 0, 0),
            HardForkEntry::new(3, 120, 0, 0),
            HardForkEntry::new(4, 200, 0, 0),
        ]).unwrap();
        for h in 0..adds {
            hf.on_block_added(h);
        }
        let pops = pops.min(adds);
        let new_tip = (adds - pops).checked_sub(1);
        hf.on_block_popped(new_tip);
        let expected = new_tip.map_or(1, |h| hf.current_version(h));
        prop_assert_eq!(hf.get_current_version(), expected);
    }
}

// ============================================================================
// DIFFICULTY
// ============================================================================

proptest! {
    /// Zero times anything never overflows
    #[test]
    fn prop_check_hash_zero_always_passes(difficulty in 1u64..) {
        prop_assert!(check_hash(&Hash::zero(), difficulty));
    }

    /// Difficulty 1 accepts every hash
    #[test]
    fn prop_check_hash_difficulty_one(bytes in any::<[u8; 32]>()) {
        prop_assert!(check_hash(&Hash(bytes), 1));
    }

    /// A hash that meets a difficulty meets every lower one
    #[test]
    fn prop_check_hash_monotonic(bytes in any::<[u8; 32]>(), difficulty in 2u64..) {
        let hash = Hash(bytes);
        if check_hash(&hash, difficulty) {
            prop_assert!(check_hash(&hash, difficulty - 1));
        }
    }

    /// Short chains are always minable
    #[test]
    fn prop_single_sample_is_minimum(ts in any::<u64>(), cd in any::<u64>()) {
        prop_assert_eq!(next_difficulty_v1(&[ts], &[cd], DIFFICULTY_TARGET), 1);
    }

    /// Blocks arriving exactly on target keep the difficulty
    #[test]
    fn prop_v1_steady_chain_is_stable(count in 2usize..=DIFFICULTY_WINDOW, difficulty in 1u64..1_000_000_000) {
        let (ts, cd) = steady_chain(count, DIFFICULTY_TARGET, difficulty);
        prop_assert_eq!(next_difficulty_v1(&ts, &cd, DIFFICULTY_TARGET), difficulty);
    }

    /// The trimmed mean sorts its timestamps, so their order is irrelevant
    #[test]
    fn prop_v1_ignores_timestamp_order(
        count in 2usize..200,
        spacing in 1u64..1_000,
        difficulty in 1u64..1_000_000
    ) {
        let (ts, cd) = steady_chain(count, spacing, difficulty);
        let reversed: Vec<u64> = ts.iter().rev().copied().collect();
        prop_assert_eq!(
            next_difficulty_v1(&ts, &cd, DIFFICULTY_TARGET),
            next_difficulty_v1(&reversed, &cd, DIFFICULTY_TARGET)
        );
    }

    /// LWMA never steps above four times the recent difficulty
    #[test]
    fn prop_lwma_step_is_bounded(spacing in 0u64..3_000, difficulty in 1_000u64..1_000_000_000) {
        let (ts, cd) = steady_chain(DIFFICULTY_WINDOW_V3 + 1, spacing, difficulty);
        let next = next_difficulty_v3(&ts, &cd, DIFFICULTY_TARGET);
        prop_assert!(next > 0);
        prop_assert!(next <= difficulty * 4);
    }

    /// Agrees with an independent 256-bit multiply, including near the boundary
    #[test]
    fn prop_check_hash_matches_wide_multiply(
        mut bytes in any::<[u8; 32]>(),
        zeros in 0usize..32,
        difficulty in any::<u64>()
    ) {
        for b in &mut bytes[32 - zeros..] {
            *b = 0;
        }
        prop_assert_eq!(check_hash(&Hash(bytes), difficulty), product_fits(&bytes, difficulty));
    }

    /// Every algorithm tolerates arbitrary samples without panicking
    #[test]
    fn prop_difficulty_total_on_arbitrary_samples(
        timestamps in prop::collection::vec(any::<u64>(), 0..80),
        cumulative in prop::collection::vec(any::<u64>(), 0..80),
        target in any::<u64>()
    ) {
        for algorithm in [DifficultyAlgorithm::V1, DifficultyAlgorithm::V2, DifficultyAlgorithm::Lwma] {
            let _ = next_difficulty(&timestamps, &cumulative, target, algorithm);
        }
    }

    /// Monotone chains with hostile gaps still give a usable answer or the overflow signal
    #[test]
    fn prop_difficulty_survives_huge_gaps(
        gaps in prop::collection::vec(0u64..(1 << 56), 2..70),
        difficulty in 1u64..1_000_000
    ) {
        let timestamps: Vec<u64> = gaps.iter().scan(0u64, |t, g| { *t += g; Some(*t) }).collect();
        let cumulative: Vec<u64> = (1..=timestamps.len() as u64).map(|i| i * difficulty).collect();
        for algorithm in [DifficultyAlgorithm::V1, DifficultyAlgorithm::V2, DifficultyAlgorithm::Lwma] {
            let _ = next_difficulty(&timestamps, &cumulative, DIFFICULTY_TARGET, algorithm);
        }
    }
}
