//! Standalone sync server for the cyber range dashboards.
//!
//! Usage: `range-server [BIND_ADDR]`. Without an argument the address comes
//! from `RANGE_BIND_ADDR`, then falls back to the server default.

use log::{error, info};
use range_sync::server::{ServerConfig, SyncServer};

const BIND_ADDR_ENV: &str = "RANGE_BIND_ADDR";

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(BIND_ADDR_ENV).ok())
        .filter(|addr| !addr.trim().is_empty())
    {
        config.bind_addr = addr;
    }
    config
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = config_from_env();
    info!("Starting range sync server on {}...", config.bind_addr);

    let server = SyncServer::new(config);
    if let Err(e) = server.run().await {
        error!("Sync server stopped: {e}");
        std::process::exit(1);
    }
}
