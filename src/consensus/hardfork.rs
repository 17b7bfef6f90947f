//! Hard-fork schedule
//!
//! Maps a height to the consensus rule version active there. The schedule is
//! plain data supplied by [`NetworkParams`](crate::config::NetworkParams); a
//! small cursor tracks the chain tip so the ledger does not binary search on
//! every block.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Seconds after the last scheduled fork before the node warns about updates
const UPDATE_TIME: u64 = 7 * 24 * 3600;
/// Seconds after the last scheduled fork before the node assumes it was left behind
const FORKED_TIME: u64 = 31 * 24 * 3600;

/// Hard-fork schedule errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HardForkError {
    #[error("Hard-fork schedule is empty")]
    Empty,
    #[error("Hard-fork entry {index} is not above its predecessor")]
    Unsorted { index: usize },
    #[error("Unknown hard-fork version {0}")]
    UnknownVersion(u8),
}

/// One scheduled fork
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardForkEntry {
    pub version: u8,
    /// First height the version applies to
    pub height: u64,
    /// Percentage of recent blocks that must vote for the version; 0 = none
    pub threshold: u8,
    /// Unix time the fork was scheduled for
    pub time: u64,
}

impl HardForkEntry {
    pub const fn new(version: u8, height: u64, threshold: u8, time: u64) -> Self {
        Self {
            version,
            height,
            threshold,
            time,
        }
    }
}

/// How this node's schedule relates to wall-clock time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardForkState {
    Ready,
    UpdateNeeded,
    LikelyForked,
}

#[derive(Debug, Default)]
struct Cursor {
    /// Number of entries whose height is at or below the tip
    passed: usize,
    tip: Option<u64>,
}

/// Height-ordered fork schedule with a tip cursor
#[derive(Debug)]
pub struct HardFork {
    entries: Vec<HardForkEntry>,
    cursor: Mutex<Cursor>,
}

impl HardFork {
    /// Build a schedule, rejecting empty or out-of-order tables
    pub fn new(entries: Vec<HardForkEntry>) -> Result<Self, HardForkError> {
        if entries.is_empty() {
            return Err(HardForkError::Empty);
        }
        for (index, pair) in entries.windows(2).enumerate() {
            if pair[1].height <= pair[0].height || pair[1].version <= pair[0].version {
                return Err(HardForkError::Unsorted { index: index + 1 });
            }
        }
        Ok(Self {
            entries,
            cursor: Mutex::new(Cursor::default()),
        })
    }

    pub fn entries(&self) -> &[HardForkEntry] {
        &self.entries
    }

    fn version_after(&self, passed: usize) -> u8 {
        match passed {
            0 => 1,
            n => self.entries[n - 1].version,
        }
    }

    /// Version active at `height`; heights before the first entry are version 1
    pub fn current_version(&self, height: u64) -> u8 {
        let passed = self.entries.partition_point(|e| e.height <= height);
        self.version_after(passed)
    }

    /// Move the cursor onto a newly stored block
    pub fn on_block_added(&self, height: u64) {
        let mut cursor = self.cursor.lock();
        if cursor.tip.map_or(false, |tip| height < tip) {
            cursor.passed = self.entries.partition_point(|e| e.height <= height);
        } else {
            while cursor.passed < self.entries.len() && self.entries[cursor.passed].height <= height {
                cursor.passed += 1;
            }
        }
        cursor.tip = Some(height);
    }

    /// Move the cursor back after the top block was removed.
    /// `new_tip` is `None` once the chain is empty.
    pub fn on_block_popped(&self, new_tip: Option<u64>) {
        let mut cursor = self.cursor.lock();
        cursor.passed = match new_tip {
            Some(height) => self.entries.partition_point(|e| e.height <= height),
            None => 0,
        };
        cursor.tip = new_tip;
    }

    /// Version active at the tip the cursor tracks
    pub fn get_current_version(&self) -> u8 {
        let cursor = self.cursor.lock();
        self.version_after(cursor.passed)
    }

    /// Height of the tip the cursor tracks
    pub fn tip(&self) -> Option<u64> {
        self.cursor.lock().tip
    }

    pub fn earliest_height(&self, version: u8) -> Option<u64> {
        self.entries.iter().find(|e| e.version == version).map(|e| e.height)
    }

    /// Highest version this node knows about
    pub fn ideal_version(&self) -> u8 {
        self.entries.last().map_or(1, |e| e.version)
    }

    /// Whether `votes` out of the last `window` blocks meet the version's threshold
    pub fn threshold_met(&self, version: u8, votes: u64, window: u64) -> Result<bool, HardForkError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.version == version)
            .ok_or(HardForkError::UnknownVersion(version))?;
        if entry.threshold == 0 {
            return Ok(true);
        }
        Ok(window > 0 && votes.saturating_mul(100) >= entry.threshold as u64 * window)
    }

    pub fn get_state(&self, now: u64) -> HardForkState {
        let last_fork = self.entries.last().map_or(0, |e| e.time);
        if last_fork.saturating_add(FORKED_TIME) < now {
            HardForkState::LikelyForked
        } else if last_fork.saturating_add(UPDATE_TIME) < now {
            HardForkState::UpdateNeeded
        } else {
            HardForkState::Ready
        }
    }
}
