//! Checkpoint registry
//!
//! Height to block-hash pins. A pinned height can never be rewritten: adding
//! a different hash at an existing height fails and leaves the registry
//! untouched. Pins come from compiled-in defaults, an operator JSON file, and
//! DNS TXT records.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::crypto::Hash;

/// Per-host budget for a DNS TXT lookup
const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// Checkpoint errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Conflicting checkpoint at height {height}: have {existing}, got {new}")]
    Conflict { height: u64, existing: Hash, new: Hash },
    #[error("Invalid checkpoint hash '{0}'")]
    InvalidHash(String),
    #[error("Checkpoint file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Checkpoint file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// One record of the checkpoint file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashLine {
    pub height: u64,
    pub hash: String,
}

/// Checkpoint file layout: `{"hashlines": [{"height": .., "hash": ".."}]}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HashFile {
    pub hashlines: Vec<HashLine>,
}

/// Outcome of checking a block against the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointCheck {
    pub passed: bool,
    /// Whether a checkpoint exists at the checked height
    pub is_checkpoint: bool,
}

/// Height-ordered checkpoint map
#[derive(Debug, Clone, Default)]
pub struct Checkpoints {
    points: BTreeMap<u64, Hash>,
}

impl Checkpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `hash` at `height`. Re-adding the same pin is a no-op.
    pub fn add_checkpoint(&mut self, height: u64, hash: Hash) -> Result<(), CheckpointError> {
        match self.points.get(&height) {
            Some(existing) if *existing != hash => Err(CheckpointError::Conflict {
                height,
                existing: *existing,
                new: hash,
            }),
            Some(_) => Ok(()),
            None => {
                self.points.insert(height, hash);
                Ok(())
            }
        }
    }

    /// Pin a hex-encoded hash
    pub fn add_checkpoint_hex(&mut self, height: u64, hash_hex: &str) -> Result<(), CheckpointError> {
        let hash = Hash::from_hex(hash_hex).map_err(|_| CheckpointError::InvalidHash(hash_hex.to_string()))?;
        self.add_checkpoint(height, hash)
    }

    /// True while some checkpoint at or above `height` remains
    pub fn is_in_checkpoint_zone(&self, height: u64) -> bool {
        self.get_max_height().map_or(false, |max| height <= max)
    }

    pub fn check_block(&self, height: u64, hash: &Hash) -> bool {
        self.check_block_detailed(height, hash).passed
    }

    pub fn check_block_detailed(&self, height: u64, hash: &Hash) -> CheckpointCheck {
        match self.points.get(&height) {
            None => CheckpointCheck {
                passed: true,
                is_checkpoint: false,
            },
            Some(pinned) if pinned == hash => {
                info!(height, %hash, "checkpoint passed");
                CheckpointCheck {
                    passed: true,
                    is_checkpoint: true,
                }
            }
            Some(pinned) => {
                error!(height, expected = %pinned, fetched = %hash, "checkpoint failed");
                CheckpointCheck {
                    passed: false,
                    is_checkpoint: true,
                }
            }
        }
    }

    /// Whether a block at `block_height` may start an alternative chain while
    /// the main chain is at `blockchain_height`.
    pub fn is_alternative_block_allowed(&self, blockchain_height: u64, block_height: u64) -> bool {
        if block_height == 0 {
            return false;
        }
        match self.points.range(..=blockchain_height).next_back() {
            None => true,
            Some((&checkpoint_height, _)) => checkpoint_height < block_height,
        }
    }

    pub fn get_max_height(&self) -> Option<u64> {
        self.points.keys().next_back().copied()
    }

    pub fn get_points(&self) -> &BTreeMap<u64, Hash> {
        &self.points
    }

    /// Fail if `other` pins a different hash at any height pinned here
    pub fn check_for_conflicts(&self, other: &Checkpoints) -> Result<(), CheckpointError> {
        for (&height, hash) in other.get_points() {
            if let Some(existing) = self.points.get(&height) {
                if existing != hash {
                    return Err(CheckpointError::Conflict {
                        height,
                        existing: *existing,
                        new: *hash,
                    });
                }
            }
        }
        Ok(())
    }

    /// Copy in every pin of `other` not already present. Conflicting pins are
    /// logged and skipped. Returns how many were added.
    pub fn merge_from(&mut self, other: &Checkpoints) -> usize {
        let mut added = 0;
        for (&height, hash) in other.get_points() {
            match self.points.get(&height) {
                None => {
                    self.points.insert(height, *hash);
                    added += 1;
                }
                Some(existing) if existing != hash => {
                    warn!(height, %existing, new = %hash, "skipping conflicting checkpoint");
                }
                Some(_) => {}
            }
        }
        added
    }

    /// Load the compiled-in pins of a network
    pub fn init_default_checkpoints(&mut self, defaults: &[(u64, &str)]) -> Result<(), CheckpointError> {
        for (height, hash_hex) in defaults {
            self.add_checkpoint_hex(*height, hash_hex)?;
        }
        debug!(count = defaults.len(), "default checkpoints loaded");
        Ok(())
    }

    /// Merge pins from a JSON file. Only heights above the current maximum are
    /// taken; a missing file is not an error.
    pub fn load_checkpoints_from_json(&mut self, path: &Path) -> Result<(), CheckpointError> {
        if !path.exists() {
            debug!(path = %path.display(), "no checkpoint file found");
            return Ok(());
        }

        info!(path = %path.display(), "loading checkpoints from file");
        let contents = std::fs::read_to_string(path)?;
        let file: HashFile = serde_json::from_str(&contents)?;

        let prev_max_height = self.get_max_height();
        info!(max_height = ?prev_max_height, "hard-coded checkpoint frontier");

        for line in &file.hashlines {
            if prev_max_height.map_or(false, |max| line.height <= max) {
                debug!(height = line.height, "skipping checkpoint below current frontier");
                continue;
            }
            info!(height = line.height, hash = %line.hash, "adding checkpoint");
            self.add_checkpoint_hex(line.height, &line.hash)?;
        }
        Ok(())
    }

    /// Merge well-formed `height:hash` records, dropping malformed and
    /// conflicting ones. Returns how many records were accepted.
    pub fn merge_dns_records<S: AsRef<str>>(&mut self, records: &[S]) -> usize {
        let mut accepted = 0;
        for record in records {
            let record = record.as_ref();
            let Some((height, hash)) = parse_dns_record(record) else {
                debug!(record, "ignoring malformed DNS checkpoint record");
                continue;
            };
            match self.add_checkpoint(height, hash) {
                Ok(()) => accepted += 1,
                Err(e) => warn!(record, "rejected DNS checkpoint: {}", e),
            }
        }
        accepted
    }

    /// Query DNS hosts and merge what they publish. Lookup failures are
    /// logged; the registry keeps whatever it already had.
    pub async fn load_checkpoints_from_dns(&mut self, hosts: &[String]) -> usize {
        let records = fetch_dns_checkpoint_records(hosts).await;
        let accepted = self.merge_dns_records(&records);
        info!(accepted, "DNS checkpoints merged");
        accepted
    }

    /// Refresh from the optional JSON file and, when asked, from DNS
    pub async fn load_new_checkpoints(
        &mut self,
        json_path: Option<&Path>,
        dns_hosts: Option<&[String]>,
    ) -> Result<(), CheckpointError> {
        if let Some(path) = json_path {
            self.load_checkpoints_from_json(path)?;
        }
        if let Some(hosts) = dns_hosts {
            self.load_checkpoints_from_dns(hosts).await;
        }
        Ok(())
    }
}

/// Parse a `"<height>:<hex hash>"` TXT record
pub fn parse_dns_record(record: &str) -> Option<(u64, Hash)> {
    let (height, hash) = record.trim().split_once(':')?;
    let height = height.trim().parse::<u64>().ok()?;
    let hash = Hash::from_hex(hash.trim()).ok()?;
    Some((height, hash))
}

/// Collect TXT strings from every host; unreachable hosts are skipped
pub async fn fetch_dns_checkpoint_records(hosts: &[String]) -> Vec<String> {
    use hickory_resolver::{config::ResolverConfig, name_server::TokioConnectionProvider, Resolver};

    let resolver =
        Resolver::builder_with_config(ResolverConfig::default(), TokioConnectionProvider::default()).build();

    let mut records = Vec::new();
    for host in hosts {
        debug!(host = %host, "querying DNS checkpoints");
        match tokio::time::timeout(DNS_TIMEOUT, resolver.txt_lookup(host.as_str())).await {
            Ok(Ok(response)) => {
                for txt in response.iter() {
                    for data in txt.txt_data() {
                        records.push(String::from_utf8_lossy(data).into_owned());
                    }
                }
            }
            Ok(Err(e)) => warn!(host = %host, "DNS checkpoint lookup failed: {}", e),
            Err(_) => warn!(host = %host, "DNS checkpoint lookup timed out"),
        }
    }
    records
}
