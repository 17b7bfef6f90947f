//! Cryptonode operator CLI
//!
//! Opens the ledger for the configured network, bootstraps genesis, and runs
//! one maintenance command against it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cryptonode::config::{Network, NetworkParams, NodeConfig};
use cryptonode::consensus::Checkpoints;
use cryptonode::crypto::NullVerifier;
use cryptonode::node::{Blockchain, GenesisInfo};
use cryptonode::storage::{BlockchainDb, DbType, OpenMode};

#[derive(Parser)]
#[command(name = "cryptonode")]
#[command(about = "CryptoNote ledger maintenance node", long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Network to follow (mainnet, testnet, stagenet)
    #[arg(long, global = true)]
    network: Option<Network>,

    /// Data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Backing engine (sled, memory)
    #[arg(long, global = true)]
    db_type: Option<DbType>,

    /// Open the ledger read-only
    #[arg(long, global = true)]
    read_only: bool,

    /// Also fetch checkpoints published over DNS
    #[arg(long, global = true)]
    dns_checkpoints: bool,

    /// JSON checkpoint file to merge
    #[arg(long, global = true)]
    checkpoints_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the chain tip, difficulty and fork state
    Status,
    /// Remove blocks from the top of the chain
    PopBlocks {
        /// How many blocks to remove
        count: u64,
    },
    /// List the checkpoints in force
    Checkpoints,
    /// Show the genesis block of the network
    Genesis,
}

impl Cli {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
            None => NodeConfig::default(),
        };
        if let Some(network) = self.network {
            config.network = network;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(db_type) = self.db_type {
            config.db_type = db_type;
        }
        if let Some(file) = &self.checkpoints_file {
            config.checkpoints_file = Some(file.clone());
        }
        config.read_only |= self.read_only;
        config.dns_checkpoints |= self.dns_checkpoints;
        if self.verbose {
            config.log_level = "debug".to_string();
        }
        Ok(config)
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.node_config()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let params = Arc::new(NetworkParams::for_network(config.network));

    if let Commands::Genesis = cli.command {
        let info = GenesisInfo::new(&params);
        println!("Genesis block ({}):", config.network);
        println!("  Hash:      {}", info.hash);
        println!("  Timestamp: {}", info.timestamp);
        println!("  Nonce:     {}", info.nonce);
        println!("  Reward:    {}", info.reward);
        return Ok(());
    }

    let mode = if config.read_only { OpenMode::ReadOnly } else { OpenMode::ReadWrite };
    let db_path = config.db_path();
    let db = Arc::new(BlockchainDb::new());
    db.open(&db_path, config.db_type, mode, config.db_sync)
        .with_context(|| format!("opening ledger at {}", db_path.display()))?;

    let mut checkpoints = Checkpoints::new();
    checkpoints
        .init_default_checkpoints(params.default_checkpoints)
        .context("loading compiled-in checkpoints")?;

    let chain = Blockchain::new(db.clone(), checkpoints, params.clone(), Arc::new(NullVerifier))?;
    if let Err(e) = chain.init() {
        error!(fatal = e.is_fatal(), "ledger initialisation failed: {}", e);
        return Err(e.into());
    }

    if config.checkpoints_file.is_some() || config.dns_checkpoints {
        match chain
            .refresh_checkpoints(config.checkpoints_file.as_deref(), config.dns_checkpoints)
            .await
        {
            Ok(added) => info!(added, "checkpoints loaded"),
            Err(e) => warn!("keeping compiled-in checkpoints: {}", e),
        }
    }

    match cli.command {
        Commands::Status => {
            let status = chain.status(unix_now())?;
            println!("Network:            {}", config.network);
            println!("Engine:             {} ({})", config.db_type, db_path.display());
            println!("Height:             {}", status.height);
            println!("Top block:          {}", status.top_hash);
            println!("Hard-fork version:  {} ({:?})", status.hard_fork_version, status.hard_fork_state);
            println!("Next difficulty:    {}", status.next_difficulty);
            println!("Cumulative work:    {}", status.cumulative_difficulty);
            println!("Generated coins:    {}", status.already_generated_coins);
            db.show_stats();
        }
        Commands::PopBlocks { count } => {
            let popped = chain.pop_blocks(count)?;
            println!("Popped {} blocks, height now {}", popped, chain.height()?);
        }
        Commands::Checkpoints => {
            let checkpoints = chain.checkpoints().read();
            for (height, hash) in checkpoints.get_points() {
                println!("{:>10}  {}", height, hash);
            }
            println!("{} checkpoints", checkpoints.get_points().len());
        }
        Commands::Genesis => {}
    }

    db.close()?;
    Ok(())
}
