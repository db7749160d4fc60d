//! mqttd - in-memory MQTT 3.1.1 broker.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mqttd::{Broker, BrokerConfig, StaticAuthenticator};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// In-memory MQTT 3.1.1 broker.
#[derive(Parser, Debug)]
#[command(name = "mqttd")]
#[command(about = "In-memory MQTT 3.1.1 broker")]
struct Args {
    /// Broker config file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file (e.g. 0.0.0.0:1883)
    #[arg(short, long)]
    listen: Option<String>,

    /// Client credentials file (YAML); all clients are allowed when omitted
    #[arg(long)]
    auth: Option<PathBuf>,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let mut config = match &args.config {
        Some(path) => BrokerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BrokerConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let mut builder = Broker::builder(config);
    if let Some(path) = &args.auth {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading credentials {}", path.display()))?;
        let auth = StaticAuthenticator::from_yaml(&text)
            .with_context(|| format!("parsing credentials {}", path.display()))?;
        info!("Loaded {} client credentials", auth.len());
        builder = builder.authenticator(auth);
    }

    let broker = builder.build();
    let addr = broker.start().await.context("starting broker")?;
    info!("mqttd ready on {}", addr);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    broker.shutdown().await;
    Ok(())
}
