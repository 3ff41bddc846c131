//! PokeChess relay.
//!
//!   cargo run -p pokechess-relay -- --bind 0.0.0.0:9300
//!   cargo run -p pokechess-relay -- --config relay.toml

use clap::Parser;
use pokechess_relay::RelayConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Signalling relay for PokeChess peers")]
struct Cli {
    /// TOML file with relay settings.
    #[arg(long, short, env = "POKECHESS_RELAY_CONFIG")]
    config: Option<PathBuf>,
    /// Address to listen on. Overrides the config file.
    #[arg(long, env = "POKECHESS_RELAY_BIND")]
    bind: Option<SocketAddr>,
    #[arg(long)]
    max_peers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pokechess_relay=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(max_peers) = cli.max_peers {
        config.max_peers = max_peers;
    }

    tracing::info!(bind = %config.bind, max_peers = config.max_peers, "starting relay");
    pokechess_relay::server::run(config.bind, config.max_peers).await
}
