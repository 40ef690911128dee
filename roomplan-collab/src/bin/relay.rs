//! `roomplan-relay`: standalone fan-out relay for collaboration rooms.

use clap::builder::RangedU64ValueParser;
use clap::Parser;
use roomplan_collab::relay::{RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "roomplan-relay")]
#[command(about = "WebSocket relay for real-time room collaboration")]
struct Cli {
    /// Address to bind to
    #[arg(long, default_value = "127.0.0.1:8080", env = "ROOMPLAN_RELAY_BIND")]
    bind: String,

    /// Frames buffered per peer before it lags
    #[arg(long, default_value_t = 256, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    capacity: usize,

    /// Maximum connections per room
    #[arg(long, default_value_t = 100, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    max_peers: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let server = RelayServer::new(RelayConfig {
        bind_addr: cli.bind,
        broadcast_capacity: cli.capacity,
        max_peers_per_room: cli.max_peers,
    });

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down"),
    }
    Ok(())
}
