//! # DPoS-BFT Node
//!
//! Entry point for the DPoS-BFT consensus node.
//!
//! This binary provides:
//! - A single node with a RocksDB consensus database (`start`)
//! - An in-process committee for local development (`dev`)
//! - Configuration and key generation tools (`init`, `keys`)

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cluster;
mod node;

use cluster::Cluster;
use dposbft_config::{Config, GenesisConfig};
use dposbft_consensus::types::now_ms;
use dposbft_crypto::PrivateKey;
use node::{Node, NodeOptions};

/// DPoS-BFT node and tools
#[derive(Parser, Debug)]
#[command(name = "dposbft")]
#[command(version)]
#[command(about = "DPoS-BFT consensus node - elected committees with LBFT2 finality")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose logging (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format: text, json, or compact
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
    Compact,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a node
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "dposbft.toml")]
        config: String,

        /// Data directory (overrides config file)
        #[arg(short, long)]
        data_dir: Option<String>,

        /// Path to the signing key file (hex encoded)
        #[arg(long, env = "DPOSBFT_KEY_FILE")]
        key: Option<String>,

        /// Produce blocks in this key's proposer slots
        #[arg(long)]
        miner: bool,

        /// Sign as a committee validator
        #[arg(long)]
        validator: bool,
    },

    /// Run a whole committee in this process
    Dev {
        /// Committee size, 3f + 1
        #[arg(short, long, default_value = "4")]
        nodes: u8,

        /// Block period in milliseconds
        #[arg(long, default_value = "1000")]
        period_ms: u64,
    },

    /// Write a single-validator configuration and its key
    Init {
        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: String,

        /// Chain ID
        #[arg(long, default_value = "1")]
        chain_id: u64,
    },

    /// Key management commands
    Keys {
        #[command(subcommand)]
        command: KeysCommands,
    },

    /// Show version information
    Version,
}

#[derive(clap::Subcommand, Debug)]
enum KeysCommands {
    /// Generate a new signing key
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Show the address of a key file
    Show {
        /// Key file path
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting DPoS-BFT");

    match cli.command {
        Commands::Start {
            config,
            data_dir,
            key,
            miner,
            validator,
        } => handle_start(config, data_dir, key, miner, validator).await,
        Commands::Dev { nodes, period_ms } => handle_dev(nodes, period_ms).await,
        Commands::Init { output, chain_id } => handle_init(output, chain_id),
        Commands::Keys { command } => handle_keys(command),
        Commands::Version => handle_version(),
    }
}

/// Initialize tracing with the configured format and verbosity
fn init_tracing(cli: &Cli) -> Result<()> {
    let filter = match cli.verbose {
        0 => "info,dposbft=info",
        1 => "info,dposbft=debug,dposbft_consensus=debug",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true))
                .with(env_filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(env_filter)
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(fmt::layer().compact())
                .with(env_filter)
                .init();
        }
    }

    Ok(())
}

fn read_key(path: &str) -> Result<PrivateKey> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read key file {path}"))?;
    PrivateKey::from_hex(&content).with_context(|| format!("Invalid key in {path}"))
}

/// Handle the `start` command
async fn handle_start(
    config_path: String,
    data_dir: Option<String>,
    key_path: Option<String>,
    miner: bool,
    validator: bool,
) -> Result<()> {
    info!(config = %config_path, "Loading configuration");
    let mut config = Config::load(Path::new(&config_path))?;

    if let Some(dir) = data_dir {
        config.storage.data_dir = dir;
    }

    let key = key_path.as_deref().map(read_key).transpose()?;
    if (miner || validator) && key.is_none() {
        bail!("--miner and --validator need a signing key (--key)");
    }

    let mut node = Node::new(
        config,
        NodeOptions {
            key,
            miner,
            validator,
        },
    )?;
    node.run().await
}

/// Handle the `dev` command
async fn handle_dev(nodes: u8, period_ms: u64) -> Result<()> {
    let mut base = Config::default();
    base.dpos.period_ms = period_ms;
    base.network.keep_connection_interval_ms = 500;

    let mut cluster = Cluster::new(&base, nodes)?;
    for (index, address) in cluster.addresses().iter().enumerate() {
        info!(node = %cluster::node_name(index as u8 + 1), %address, "Dev committee member");
    }
    cluster.run().await
}

/// Handle the `init` command
fn handle_init(output: String, chain_id: u64) -> Result<()> {
    let dir = Path::new(&output);
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {output}"))?;

    let key = PrivateKey::random();
    let address = key.address();

    let mut config = Config::default();
    config.chain.chain_id = chain_id;
    config.chain.network_id = chain_id;
    config.dpos.faulty_number = 0;
    config.dpos.term_len = 1;
    config.dpos.low_rpt_seats = 0;
    config.genesis = GenesisConfig {
        timestamp_ms: now_ms(),
        proposers: vec![address],
        validators: vec![address],
        candidates: vec![address],
        ..Default::default()
    };
    config.storage.data_dir = dir.join("data").to_string_lossy().to_string();
    config.validate()?;

    let config_path = dir.join("dposbft.toml");
    config.save(&config_path)?;
    let key_path = dir.join("validator.key");
    std::fs::write(&key_path, hex::encode(key.to_bytes()))?;

    info!(%address, config = %config_path.display(), key = %key_path.display(), "Initialized single-validator chain");
    println!("Validator: {address}");
    println!("Start with: dposbft start --config {} --key {} --miner --validator", config_path.display(), key_path.display());
    Ok(())
}

/// Handle the `keys` commands
fn handle_keys(command: KeysCommands) -> Result<()> {
    match command {
        KeysCommands::Generate { output } => {
            let key = PrivateKey::random();
            let address = key.address();
            match output {
                Some(path) => {
                    std::fs::write(&path, hex::encode(key.to_bytes()))?;
                    println!("{}", serde_json::json!({ "address": address.to_string(), "file": path }));
                }
                None => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "address": address.to_string(),
                            "private_key": hex::encode(key.to_bytes()),
                        })
                    );
                }
            }
        }
        KeysCommands::Show { path } => {
            let key = read_key(&path)?;
            println!("{}", serde_json::json!({ "address": key.address().to_string() }));
        }
    }
    Ok(())
}

/// Handle the `version` command
fn handle_version() -> Result<()> {
    println!("dposbft {}", env!("CARGO_PKG_VERSION"));
    println!(
        "consensus protocol {} v{}",
        dposbft_consensus::PROTOCOL_NAME,
        dposbft_consensus::PROTOCOL_VERSION
    );
    Ok(())
}
