//! cellsync-server: hosts shared notebook documents over WebSocket.
//!
//! Participants connect with `create` to open a new document or `join` to
//! attach to an existing one; every document lives in memory for as long as
//! someone is attached.

use clap::Parser;
use log::info;

use cellsync_collab::server::{ServerConfig, SyncServer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value_t = ServerConfig::default().bind_addr)]
    bind: String,
    /// Maximum participants attached to one document
    #[arg(long, default_value_t = ServerConfig::default().max_peers_per_room)]
    max_peers: usize,
    /// Commits a slow participant may fall behind before it is dropped
    #[arg(long, default_value_t = ServerConfig::default().broadcast_capacity)]
    broadcast_capacity: usize,
    /// Seconds between keepalive pings
    #[arg(long, default_value_t = ServerConfig::default().heartbeat_interval_secs)]
    heartbeat: u64,
}

impl Cli {
    fn config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            max_peers_per_room: self.max_peers,
            broadcast_capacity: self.broadcast_capacity,
            heartbeat_interval_secs: self.heartbeat,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = Cli::parse().config();

    info!("Starting cellsync server on {}...", config.bind_addr);

    let server = SyncServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Server stopped: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_config() {
        let config = Cli::parse_from(["cellsync-server"]).config();
        let default = ServerConfig::default();
        assert_eq!(config.bind_addr, default.bind_addr);
        assert_eq!(config.max_peers_per_room, default.max_peers_per_room);
        assert_eq!(config.heartbeat_interval_secs, default.heartbeat_interval_secs);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Cli::parse_from(["cellsync-server", "--bind", "0.0.0.0:7000", "--max-peers", "4", "--heartbeat", "5"])
            .config();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_peers_per_room, 4);
        assert_eq!(config.heartbeat_interval_secs, 5);
        assert_eq!(config.broadcast_capacity, ServerConfig::default().broadcast_capacity);
    }
}
