use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tessera_common::{crypto::SecretKey, wallet::Wallet};
use tessera_daemon::{
    config::NodeConfig,
    core::storage::SledStorage,
    node::NodeRuntime,
};

#[derive(Parser)]
#[command(name = "tessera_daemon", about = "Tessera Proof-of-Stake mesh node", version)]
struct NodeArgs {
    /// Path to a JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the database location
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Override the p2p bind address
    #[arg(long)]
    bind_address: Option<SocketAddr>,

    /// Additional peers to connect to, may be repeated
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,

    /// Start producing blocks immediately
    #[arg(long)]
    mine: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = NodeArgs::parse();

    let level = LevelFilter::from_str(&args.log_level).context("invalid log level")?;
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    let mut config = match &args.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str::<NodeConfig>(&content).context("parsing config file")?
        }
        None => NodeConfig::default(),
    };
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(bind_address) = args.bind_address {
        config.bind_address = bind_address;
    }
    config.priority_peers.extend(args.peers);

    let wallet = load_or_create_wallet(&config.db_path).context("loading wallet key")?;
    info!("node address: {}", wallet.address());

    let storage = SledStorage::open(&config.db_path, config.checkpoint.compression)
        .context("opening database")?;
    let node = NodeRuntime::new(config, storage, wallet)
        .await
        .context("loading chain")?;

    node.start().await.context("starting node")?;
    if args.mine {
        node.start_mining();
    }

    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    info!("interrupt received, shutting down");
    node.stop().await;
    Ok(())
}

// The wallet secret lives next to the database as a hex file; a missing
// file means a fresh identity.
fn load_or_create_wallet(db_path: &Path) -> Result<Wallet> {
    let key_path = db_path.with_extension("key");
    if key_path.exists() {
        let hex = std::fs::read_to_string(&key_path)?;
        let secret = SecretKey::from_hex(hex.trim())
            .map_err(|e| anyhow::anyhow!("invalid wallet key file: {}", e))?;
        Ok(Wallet::from_secret(&secret))
    } else {
        let wallet = Wallet::generate();
        std::fs::write(&key_path, wallet.keypair().secret_key().to_hex())
            .with_context(|| format!("writing wallet key to {}", key_path.display()))?;
        info!("generated a new wallet key at {}", key_path.display());
        Ok(wallet)
    }
}
