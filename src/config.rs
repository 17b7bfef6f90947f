//! Node configuration
//!
//! `NetworkParams` holds the consensus data of one network (fork schedule,
//! compiled-in checkpoints, genesis). It is built once at startup and
//! shared by `Arc`. `NodeConfig` holds operator settings read from TOML.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::HardForkEntry;
use crate::constants::DIFFICULTY_TARGET;
use crate::storage::{DbType, FixupPlan};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Which chain the node follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Stagenet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Stagenet => "stagenet",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "stagenet" => Ok(Network::Stagenet),
            other => Err(format!("unknown network '{}'", other)),
        }
    }
}

/// Parameters of the genesis block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenesisParams {
    pub major_version: u8,
    pub timestamp: u64,
    pub nonce: u32,
    pub reward: u64,
}

/// Consensus data of one network
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub network: Network,
    pub difficulty_target: u64,
    pub hard_forks: Vec<HardForkEntry>,
    pub default_checkpoints: &'static [(u64, &'static str)],
    pub dns_checkpoint_hosts: Vec<String>,
    pub genesis: GenesisParams,
    pub fixup: FixupPlan,
}

const MAINNET_HARD_FORKS: [(u8, u64, u64); 9] = [
    (1, 1, 1482806500),
    (2, 21300, 1497657600),
    (3, 116520, 1522800000),
    (4, 137500, 1528045200),
    (5, 165000, 1529643600),
    (6, 199800, 1537065522),
    (7, 274000, 1555234940),
    (8, 274360, 1555321375),
    (9, 350000, 1574120819),
];

const TESTNET_HARD_FORKS: [(u8, u64, u64); 9] = [
    (1, 1, 1482806500),
    (2, 5150, 1497181713),
    (3, 103580, 1522540800),
    (4, 122452, 1527699600),
    (5, 128680, 1529308166),
    (6, 130500, 1554265083),
    (7, 130530, 1554465078),
    (8, 130560, 1554479506),
    (9, 164100, 1572592223),
];

const MAINNET_CHECKPOINTS: &[(u64, &str)] = &[
    (1, "82e8f378ea29d152146b6317903249751b809e97c0b6655f86e120b9de95c38a"),
    (10, "e097b62bba41e5fd583d3a68de074cddd77c85a6158b031d963232146494a2d6"),
    (100, "f3bd44c626cc12d449183ca84b58615d792523ba229385ff6717ab29a3e88926"),
    (1000, "d284c992cb570f86c2e0bcfaa552b1d73bd40417e1c2a40f82bc6432217f0873"),
    (3000, "81e040955b710dc5a5056668c4eaf3fbc4da2f72c0a63763250ede32a92e0f06"),
    (5000, "e838c077bc66356d9bb321d4eb60f0851ef766f0619ddc4c6568a0f149aacea0"),
    (10000, "360b96c3d0a5202c548672d550700d982ca15ad5627f70bce0a89dda840b3611"),
    (20000, "603a45b60dd92ef4524c80d58411d09480b4668c54bc08dd651d838832bd399e"),
    (21300, "d0a76e98ebb4d8e928d931a1807bba11a2fafdf544c119761b0ed6de4e1898cf"),
    (50000, "ae36641cf06ed788375bfb32f0038cbcd98f1d7bfb09937148fb1a57c6b52dd8"),
    (75000, "b26f4e1225569da282b77659020bace52e5e89abbdee33e9e52266b1e71803a5"),
    (100000, "ffe474fe8353f90700c8138ddea3547d5c1e4a6facb1df85897e7a6e4daab540"),
    (116520, "da1cb8f30305cd5fad7d6c33b3ed88fede053e0926102d8e544b65e93e33a08b"),
    (137500, "0a50041b952bdc1b1f2c6a5e8749600f545e43ddfa255607b529df95f8945e5d"),
    (165000, "a15ab984e4c93bff84f617daaed357e28c5eb2fb6c64efa803f4cfba0b69f4a4"),
    (199800, "d8c7fcfcf605e834b3125b68cc96736e1f1d2f753c79c24db8fb9d6af4b84293"),
    (274000, "49d2579161c277b9d9fe6baba5aabcef1534e9abef93eaa7f17cc8fe229454b0"),
    (274360, "66c129116187f36980a97333f1c7cf99c21629cc52bc6d591126d3a8fe36b90a"),
    (300000, "b09b147b23148d2995ff860d9ede9d8d38757c934b6de7945d397fc4e1ab2501"),
    (320000, "3305f11f07669f156bbe9f9b07523d7b5a6f4c430475ae61c379c1e31984c1fb"),
    (345000, "d67de29cf089207413686ceb385dbafcc9f7c12690e4a5d4ee9b42c274d2d4b3"),
    (350000, "d3675de05fed5f6633288adb07ac4982b4c891be6347d9f6edfac9b21dbbd721"),
    (375000, "405fdfcd94e6acecd0f282f41c0983c1b3437dce84e566f763f2fd683da02ea3"),
    (394000, "86462c05c540b2df7ac39a8e5d85dc08d191b5cbc1ea59c8e5966bdd2bd28f31"),
    (405000, "aaf7f8ceb403c3110dbb9256dd10f888524fed90159065400f52e663c1c3733f"),
    (420000, "a67b28a7ec8785cdaf5d54cd56d5e92fe52dd2cbaa8ee7fab7eb27deb21b65ac"),
    (435000, "ee11193a62f74d2ed681fd2e9212e9e4061774d9dd90039cc5a4d0b65f2c5522"),
    (446000, "c50f8599b0c0cf5ad620217e9a496fdfa1f82b485995cfd73a04a1509bb902a2"),
    (465000, "985a03585380e5a8ba30a2515174c05afbc71a858ec171a1c1a8658df322935e"),
    (492000, "a2efbec083be4f1aadb1e368e85fc861a3014bcef6e58dad2161b46cc6fa0cea"),
];

const DNS_SUFFIXES: [&str; 4] = ["stream", "download", "win", "bid"];

/// Genesis reward, roughly a tenth of the money supply
const GENESIS_REWARD: u64 = 8_800_000_000_000_000;

fn fork_table(rows: &[(u8, u64, u64)]) -> Vec<HardForkEntry> {
    rows.iter()
        .map(|&(version, height, time)| HardForkEntry::new(version, height, 0, time))
        .collect()
}

fn dns_hosts(label: &str) -> Vec<String> {
    DNS_SUFFIXES
        .iter()
        .map(|suffix| format!("{}.sumopulse.{}", label, suffix))
        .collect()
}

impl NetworkParams {
    pub fn for_network(network: Network) -> Self {
        let (hard_forks, default_checkpoints, dns_label, nonce) = match network {
            Network::Mainnet => (fork_table(&MAINNET_HARD_FORKS), MAINNET_CHECKPOINTS, "checkpoints", 10000),
            Network::Testnet => (fork_table(&TESTNET_HARD_FORKS), &[][..], "testpoints", 10001),
            Network::Stagenet => (fork_table(&TESTNET_HARD_FORKS), &[][..], "stagenetpoints", 10002),
        };

        Self {
            network,
            difficulty_target: DIFFICULTY_TARGET,
            hard_forks,
            default_checkpoints,
            dns_checkpoint_hosts: dns_hosts(dns_label),
            genesis: GenesisParams {
                major_version: 1,
                timestamp: 0,
                nonce,
                reward: GENESIS_REWARD,
            },
            fixup: FixupPlan::default(),
        }
    }
}

/// Operator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: Network,
    pub data_dir: PathBuf,
    pub db_type: DbType,
    /// Flush the engine after every committed batch
    pub db_sync: bool,
    pub read_only: bool,
    pub checkpoints_file: Option<PathBuf>,
    pub dns_checkpoints: bool,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            data_dir: PathBuf::from(".cryptonode"),
            db_type: DbType::Sled,
            db_sync: true,
            read_only: false,
            checkpoints_file: None,
            dns_checkpoints: false,
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Read a TOML config file; absent keys take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Ledger directory for the configured network
    pub fn db_path(&self) -> PathBuf {
        match self.network {
            Network::Mainnet => self.data_dir.join("ledger"),
            other => self.data_dir.join(other.as_str()).join("ledger"),
        }
    }
}
