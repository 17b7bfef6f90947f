//! Difficulty retargeting
//!
//! Pure functions mapping a window of (timestamp, cumulative difficulty)
//! samples to the difficulty the next block must meet. Three generations are
//! kept because every historical block must still validate under the rule
//! that was active at its height:
//!
//! * V1: sorted, symmetrically trimmed mean over a long window
//! * V2: short trimmed window, blended with the median solve time
//! * V3: linearly weighted moving average (LWMA) over unsorted solve times
//!
//! Every function returns 1 for degenerate input and 0 on arithmetic
//! overflow. Callers must treat 0 as a rejection, never mine against it.

use crate::constants::{
    BLOCK_FUTURE_TIME_LIMIT_V3, DIFFICULTY_BLOCKS_COUNT_V2, DIFFICULTY_CUT, DIFFICULTY_CUT_V2,
    DIFFICULTY_TARGET, DIFFICULTY_WINDOW, DIFFICULTY_WINDOW_V3,
};
use crate::crypto::Hash;

/// Difficulty and cumulative difficulty values
pub type Difficulty = u64;

const MAX_AVERAGE_TIMESPAN: u64 = DIFFICULTY_TARGET * 6;
const MIN_AVERAGE_TIMESPAN: u64 = DIFFICULTY_TARGET / 24;

/// LWMA bias correction for N = 60
const LWMA_ADJUST: f64 = 0.998;

/// Retargeting algorithm generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyAlgorithm {
    V1,
    V2,
    Lwma,
}

impl DifficultyAlgorithm {
    /// Algorithm used for blocks of the given major version
    pub fn for_version(major_version: u8) -> Self {
        match major_version {
            0 | 1 => DifficultyAlgorithm::V1,
            2..=5 => DifficultyAlgorithm::V2,
            _ => DifficultyAlgorithm::Lwma,
        }
    }

    /// How many trailing samples the algorithm consumes
    pub fn blocks_count(&self) -> usize {
        match self {
            DifficultyAlgorithm::V1 => DIFFICULTY_WINDOW,
            DifficultyAlgorithm::V2 => DIFFICULTY_BLOCKS_COUNT_V2,
            DifficultyAlgorithm::Lwma => DIFFICULTY_WINDOW_V3 + 1,
        }
    }
}

/// Compute the next difficulty with the selected algorithm
pub fn next_difficulty(
    timestamps: &[u64],
    cumulative_difficulties: &[Difficulty],
    target_seconds: u64,
    algorithm: DifficultyAlgorithm,
) -> Difficulty {
    match algorithm {
        DifficultyAlgorithm::V1 => next_difficulty_v1(timestamps, cumulative_difficulties, target_seconds),
        DifficultyAlgorithm::V2 => next_difficulty_v2(timestamps, cumulative_difficulties, target_seconds),
        DifficultyAlgorithm::Lwma => next_difficulty_v3(timestamps, cumulative_difficulties, target_seconds),
    }
}

/// Check a proof-of-work hash against a difficulty.
///
/// The hash is read as a little-endian 256-bit integer; the block is valid
/// iff `hash * difficulty` still fits in 256 bits.
pub fn check_hash(hash: &Hash, difficulty: Difficulty) -> bool {
    let mut carry: u128 = 0;
    for limb in hash.0.chunks_exact(8) {
        let mut word = [0u8; 8];
        word.copy_from_slice(limb);
        let product = u64::from_le_bytes(word) as u128 * difficulty as u128 + carry;
        carry = product >> 64;
    }
    carry == 0
}

/// Trailing `window` samples of both series, clipped to the shorter one
fn recent_window<'a>(
    timestamps: &'a [u64],
    cumulative_difficulties: &'a [Difficulty],
    window: usize,
) -> (&'a [u64], &'a [Difficulty]) {
    let length = timestamps.len().min(cumulative_difficulties.len()).min(window);
    (
        &timestamps[timestamps.len() - length..],
        &cumulative_difficulties[cumulative_difficulties.len() - length..],
    )
}

/// Bounds of the samples kept after trimming `cut` from each end
fn cut_range(length: usize, window: usize, cut: usize) -> (usize, usize) {
    let kept = window - 2 * cut;
    if length <= kept {
        (0, length)
    } else {
        let begin = (length - kept + 1) / 2;
        (begin, begin + kept)
    }
}

/// `ceil(work * target / span)`, or 0 if the 128-bit product leaves 64 bits
fn scaled_work(total_work: Difficulty, target_seconds: u64, span: u64) -> Difficulty {
    let product = total_work as u128 * target_seconds as u128;
    if product > u64::MAX as u128 {
        return 0;
    }
    let low = product as u64;
    match low.checked_add(span - 1) {
        Some(rounded) => rounded / span,
        None => 0,
    }
}

fn median(values: &mut [u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        let (a, b) = (values[mid - 1], values[mid]);
        a / 2 + b / 2 + (a % 2 + b % 2) / 2
    }
}

/// V1: windowed trimmed mean
pub fn next_difficulty_v1(
    timestamps: &[u64],
    cumulative_difficulties: &[Difficulty],
    target_seconds: u64,
) -> Difficulty {
    let (timestamps, cumulative) = recent_window(timestamps, cumulative_difficulties, DIFFICULTY_WINDOW);
    let length = timestamps.len();
    if length <= 1 {
        return 1;
    }

    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    let (cut_begin, cut_end) = cut_range(length, DIFFICULTY_WINDOW, DIFFICULTY_CUT);

    let time_span = (sorted[cut_end - 1] - sorted[cut_begin]).max(1);
    let total_work = match cumulative[cut_end - 1].checked_sub(cumulative[cut_begin]) {
        Some(work) if work > 0 => work,
        _ => return 0,
    };

    scaled_work(total_work, target_seconds, time_span)
}

/// V2: trimmed mean blended with the median solve time
pub fn next_difficulty_v2(
    timestamps: &[u64],
    cumulative_difficulties: &[Difficulty],
    target_seconds: u64,
) -> Difficulty {
    let (timestamps, cumulative) =
        recent_window(timestamps, cumulative_difficulties, DIFFICULTY_BLOCKS_COUNT_V2);
    let length = timestamps.len();
    if length <= 1 {
        return 1;
    }

    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    let (cut_begin, cut_end) = cut_range(length, DIFFICULTY_BLOCKS_COUNT_V2, DIFFICULTY_CUT_V2);

    let total_timespan = (sorted[cut_end - 1] - sorted[cut_begin]).max(1);

    let mut timespan_median = 0;
    if cut_begin > 0 && length >= cut_begin * 2 + 3 {
        let mut spans: Vec<u64> = (length - cut_begin * 2 - 3..length - 1)
            .map(|i| (sorted[i + 1] - sorted[i]).max(1))
            .collect();
        timespan_median = median(&mut spans);
    }

    // timestamp gaps are untrusted, blend in u128
    let timespan_length = (length - cut_begin * 2 - 1) as u128;
    let total_timespan = total_timespan as u128;
    let total_timespan_median = if timespan_median > 0 {
        timespan_median as u128 * timespan_length
    } else {
        total_timespan * 7 / 10
    };

    // 0.8 of the mean plus 0.3 of the median; a Poisson median sits near 70% of its mean
    let adjusted_timespan = ((total_timespan * 8 + total_timespan_median * 3) / 10).clamp(
        MIN_AVERAGE_TIMESPAN as u128 * timespan_length,
        MAX_AVERAGE_TIMESPAN as u128 * timespan_length,
    );

    let total_work = match cumulative[cut_end - 1].checked_sub(cumulative[cut_begin]) {
        Some(work) if work > 0 => work,
        _ => return 0,
    };

    let product = total_work as u128 * target_seconds as u128;
    if product > u64::MAX as u128 {
        return 0;
    }
    let next = (product + adjusted_timespan - 1) / adjusted_timespan;
    match u64::try_from(next) {
        Ok(next) => next.max(1),
        Err(_) => 0,
    }
}

/// V3: LWMA, `harmonic_mean(D) * T / LWMA(solvetimes)`.
///
/// Timestamps are used in chain order. Solve times may be negative and are
/// clamped to `[-FTL, 10 * T]`.
pub fn next_difficulty_v3(
    timestamps: &[u64],
    cumulative_difficulties: &[Difficulty],
    target_seconds: u64,
) -> Difficulty {
    if timestamps.len() < 4 || cumulative_difficulties.len() < 4 {
        return 1;
    }
    let (timestamps, cumulative) =
        recent_window(timestamps, cumulative_difficulties, DIFFICULTY_WINDOW_V3 + 1);
    let n = timestamps.len() - 1;

    let t = target_seconds as i128;
    let ftl = BLOCK_FUTURE_TIME_LIMIT_V3 as i128;
    let k = (n * (n + 1) / 2) as f64;

    let mut lwma = 0f64;
    let mut sum_inverse_d = 0f64;
    for i in 1..=n {
        let solve_time = (timestamps[i] as i128 - timestamps[i - 1] as i128).max(-ftl).min(t * 10);
        let difficulty = cumulative[i].saturating_sub(cumulative[i - 1]);
        lwma += (solve_time * i as i128) as f64 / k;
        sum_inverse_d += 1.0 / difficulty as f64;
    }

    let harmonic_mean_d = n as f64 / sum_inverse_d;

    let floor = (t / 4).max(1);
    if (lwma.round() as i128) < floor {
        lwma = floor as f64;
    }

    // a zero per-block difficulty drives the harmonic mean, and the result, to 0
    (harmonic_mean_d * t as f64 / lwma * LWMA_ADJUST) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady(count: usize, spacing: u64, difficulty: u64) -> (Vec<u64>, Vec<u64>) {
        let timestamps = (0..count as u64).map(|i| i * spacing).collect();
        let cumulative = (0..count as u64).map(|i| (i + 1) * difficulty).collect();
        (timestamps, cumulative)
    }

    #[test]
    fn test_v1_degenerate_windows_are_minimum() {
        assert_eq!(next_difficulty_v1(&[], &[], 240), 1);
        assert_eq!(next_difficulty_v1(&[1000], &[5], 240), 1);
    }

    #[test]
    fn test_v1_known_vector() {
        // span 2, work 30: ceil(30 * 1 / 2)
        assert_eq!(next_difficulty_v1(&[0, 1, 2], &[0, 10, 30], 1), 15);
    }

    #[test]
    fn test_v1_full_window_is_stable() {
        let (ts, cd) = steady(DIFFICULTY_WINDOW, DIFFICULTY_TARGET, 1_000);
        assert_eq!(next_difficulty_v1(&ts, &cd, DIFFICULTY_TARGET), 1_000);
    }

    #[test]
    fn test_v1_trims_outlier_timestamp() {
        let (mut ts, cd) = steady(DIFFICULTY_WINDOW, DIFFICULTY_TARGET, 1_000);
        ts[700] = u32::MAX as u64;
        assert_eq!(next_difficulty_v1(&ts, &cd, DIFFICULTY_TARGET), 1_000);
    }

    #[test]
    fn test_v1_uses_most_recent_window() {
        let (ts, cd) = steady(DIFFICULTY_WINDOW, DIFFICULTY_TARGET, 1_000);
        let mut longer_ts = vec![0; 5];
        let mut longer_cd = vec![0; 5];
        longer_ts.extend(ts.iter().map(|t| t + 1));
        longer_cd.extend(cd.iter().copied());
        assert_eq!(next_difficulty_v1(&longer_ts, &longer_cd, DIFFICULTY_TARGET), 1_000);
    }

    #[test]
    fn test_v1_overflow_returns_zero() {
        assert_eq!(next_difficulty_v1(&[0, 1], &[0, u64::MAX], 2), 0);
        // product fits, rounding does not
        assert_eq!(next_difficulty_v1(&[0, 2], &[0, u64::MAX], 1), 0);
    }

    #[test]
    fn test_v1_same_timestamps_use_unit_span() {
        assert_eq!(next_difficulty_v1(&[7, 7], &[0, 3], 10), 30);
    }

    #[test]
    fn test_v2_full_window() {
        let (ts, cd) = steady(DIFFICULTY_BLOCKS_COUNT_V2, DIFFICULTY_TARGET, 1_000);
        // adjusted timespan 17.6 T over 16 T of work
        assert_eq!(next_difficulty_v2(&ts, &cd, DIFFICULTY_TARGET), 910);
    }

    #[test]
    fn test_v2_short_chain_without_median() {
        assert_eq!(next_difficulty_v2(&[0, 240], &[1_000, 2_000], 240), 992);
        assert_eq!(next_difficulty_v2(&[5], &[1], 240), 1);
    }

    #[test]
    fn test_v2_clamps_instant_blocks() {
        let ts = vec![100; 10];
        let cd: Vec<u64> = (1..=10).map(|i| i * 100).collect();
        // adjusted timespan clamps up to MIN_AVERAGE_TIMESPAN * 9 = 90
        assert_eq!(next_difficulty_v2(&ts, &cd, 240), (900 * 240 + 89) / 90);
    }

    #[test]
    fn test_v3_short_chain_is_minimum() {
        assert_eq!(next_difficulty_v3(&[0, 1, 2], &[1, 2, 3], 240), 1);
    }

    #[test]
    fn test_v3_steady_state() {
        let (ts, cd) = steady(DIFFICULTY_WINDOW_V3 + 1, DIFFICULTY_TARGET, 1_000);
        let next = next_difficulty_v3(&ts, &cd, DIFFICULTY_TARGET);
        assert!((997..=998).contains(&next), "got {}", next);
    }

    #[test]
    fn test_v3_depends_on_timestamp_order() {
        let (ts, cd) = steady(DIFFICULTY_WINDOW_V3 + 1, DIFFICULTY_TARGET, 1_000);
        let mut swapped = ts.clone();
        swapped.swap(59, 60);
        let ordered = next_difficulty_v3(&ts, &cd, DIFFICULTY_TARGET);
        let reordered = next_difficulty_v3(&swapped, &cd, DIFFICULTY_TARGET);
        assert_ne!(ordered, reordered);

        // the trimmed mean sorts first, so it cannot tell the difference
        assert_eq!(
            next_difficulty_v1(&ts, &cd, DIFFICULTY_TARGET),
            next_difficulty_v1(&swapped, &cd, DIFFICULTY_TARGET)
        );
    }

    #[test]
    fn test_v3_fast_blocks_raise_difficulty() {
        let (ts, cd) = steady(DIFFICULTY_WINDOW_V3 + 1, DIFFICULTY_TARGET / 2, 1_000);
        assert!(next_difficulty_v3(&ts, &cd, DIFFICULTY_TARGET) > 1_900);
    }

    #[test]
    fn test_v3_lwma_floor_bounds_instant_blocks() {
        let (ts, cd) = steady(DIFFICULTY_WINDOW_V3 + 1, 0, 1_000);
        // LWMA floors at T / 4, so at most a 4x step
        let next = next_difficulty_v3(&ts, &cd, DIFFICULTY_TARGET);
        assert!(next <= 4_000 && next > 3_900, "got {}", next);
    }

    #[test]
    fn test_v3_zero_block_difficulty_signals_error() {
        let ts = vec![0, 240, 480, 720, 960];
        let cd = vec![10, 20, 20, 30, 40];
        assert_eq!(next_difficulty_v3(&ts, &cd, 240), 0);
    }

    #[test]
    fn test_v2_huge_gap_clamps_instead_of_overflowing() {
        assert_eq!(next_difficulty_v2(&[0, 1 << 62], &[0, 10], 240), 2);
    }

    #[test]
    fn test_v2_huge_median_gaps() {
        let (ts, cd) = steady(DIFFICULTY_BLOCKS_COUNT_V2, 1 << 58, 1_000);
        // 16 blocks of work over the MAX_AVERAGE_TIMESPAN clamp: ceil(16000 * 240 / (1440 * 16))
        assert_eq!(next_difficulty_v2(&ts, &cd, DIFFICULTY_TARGET), 167);
    }

    #[test]
    fn test_median_of_large_pair() {
        assert_eq!(median(&mut [u64::MAX, u64::MAX]), u64::MAX);
        assert_eq!(median(&mut [u64::MAX, u64::MAX - 2]), u64::MAX - 1);
        assert_eq!(median(&mut [3, 4]), 3);
    }

    #[test]
    fn test_v3_extreme_timestamps() {
        let ts = vec![0, 1 << 63, 0, u64::MAX, 1];
        let cd = vec![1, 2, 3, 4, 5];
        // every solve time lands on a clamp bound
        assert!(next_difficulty_v3(&ts, &cd, DIFFICULTY_TARGET) <= 4);
    }

    #[test]
    fn test_mismatched_series_are_clipped() {
        assert_eq!(next_difficulty_v1(&[0, 1, 2], &[10, 30], 1), 20);
        assert_eq!(next_difficulty_v2(&[0], &[1, 2, 3], 240), 1);
    }

    #[test]
    fn test_algorithm_for_version() {
        assert_eq!(DifficultyAlgorithm::for_version(1), DifficultyAlgorithm::V1);
        assert_eq!(DifficultyAlgorithm::for_version(2), DifficultyAlgorithm::V2);
        assert_eq!(DifficultyAlgorithm::for_version(5), DifficultyAlgorithm::V2);
        assert_eq!(DifficultyAlgorithm::for_version(6), DifficultyAlgorithm::Lwma);
        assert_eq!(DifficultyAlgorithm::for_version(9), DifficultyAlgorithm::Lwma);
    }

    #[test]
    fn test_check_hash_zero_hash_always_passes() {
        assert!(check_hash(&Hash::zero(), 1));
        assert!(check_hash(&Hash::zero(), u64::MAX));
    }

    #[test]
    fn test_check_hash_max_hash() {
        let max = Hash([0xff; 32]);
        assert!(check_hash(&max, 1));
        assert!(!check_hash(&max, 2));
    }

    #[test]
    fn test_check_hash_carry_boundary() {
        // 2^255 * 2 = 2^256 overflows by exactly one bit
        let mut half = [0u8; 32];
        half[31] = 0x80;
        assert!(!check_hash(&Hash(half), 2));

        // (2^255 - 1) * 2 fits
        let mut below = [0xff; 32];
        below[31] = 0x7f;
        assert!(check_hash(&Hash(below), 2));
        assert!(!check_hash(&Hash(below), 3));
    }

    #[test]
    fn test_check_hash_carry_from_low_limbs() {
        // top limb alone fits, but carries from the lower limbs push it over
        let mut bytes = [0xff; 32];
        bytes[24..].copy_from_slice(&(u64::MAX / 3).to_le_bytes());
        assert!(!check_hash(&Hash(bytes), 3));

        let mut clean = [0u8; 32];
        clean[24..].copy_from_slice(&(u64::MAX / 3).to_le_bytes());
        assert!(check_hash(&Hash(clean), 3));
    }

    #[test]
    fn test_next_difficulty_dispatch() {
        let (ts, cd) = (vec![0, 1, 2], vec![0, 10, 30]);
        assert_eq!(next_difficulty(&ts, &cd, 1, DifficultyAlgorithm::V1), 15);
        assert_eq!(next_difficulty(&[], &[], 240, DifficultyAlgorithm::V2), 1);
        assert_eq!(next_difficulty(&[], &[], 240, DifficultyAlgorithm::Lwma), 1);
    }
}
