use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (MESHIRCD_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("MESHIRCD_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("meshircd_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = meshircd_server::config::ServerConfig::parse();
    tracing::info!(
        server = %config.server_name,
        clients = %config.listen_addr,
        peers = %config.peer_listen_addr,
        "Starting IRC server"
    );
    if !config.peers.is_empty() {
        tracing::info!("Dialing peers: {}", config.peers.join(", "));
    }

    let server = meshircd_server::server::Server::new(config);
    server.run().await
}
