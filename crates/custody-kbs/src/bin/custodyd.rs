use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use custody_kbs::{load_keystore, Broker, BrokerConfig, BrokerServer, KeyStore};
use log::info;

#[derive(Parser, Debug)]
#[clap(
    name = "custodyd",
    version,
    about = "Custody key broker - performs operations with keys it never hands out"
)]
struct Args {
    /// Path to configuration file
    #[clap(short, long, env = "CUSTODY_CONFIG")]
    config: Option<PathBuf>,

    /// Socket path, overrides server.socket_path
    #[clap(short, long, env = "CUSTODY_SOCKET")]
    socket: Option<PathBuf>,

    /// Key store file, overrides keystore.path
    #[clap(short, long, env = "CUSTODY_KEYSTORE")]
    keystore: Option<PathBuf>,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    /// Validate configuration and key store, then exit
    #[clap(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    info!("Starting custodyd v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => BrokerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BrokerConfig::default(),
    };
    if let Some(socket) = args.socket {
        config.server.socket_path = socket;
    }
    if let Some(keystore) = args.keystore {
        config.keystore.path = keystore;
    }
    config.validate().context("invalid configuration")?;

    let store = load_keystore(&config.keystore.path)
        .with_context(|| format!("loading key store {}", config.keystore.path.display()))?;
    info!("Key sets: {}", store.set_names().join(", "));
    info!("{} grant(s) configured", config.grants.len());

    if args.check {
        info!("Configuration OK");
        return Ok(());
    }

    let broker = Arc::new(Broker::new(
        Arc::new(store),
        Arc::new(config.gate()),
        config.registry()?,
    ));
    let server = BrokerServer::bind(&config.server, broker)
        .await
        .context("binding broker socket")?;

    server.run().await?;

    Ok(())
}
