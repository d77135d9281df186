//! gracetcp - line-echo server
//!
//! Loads the configuration, sets up logging and serves the echo handler
//! until a termination signal arrives.

use gracetcp::config::Config;
use gracetcp::handler::EchoHandler;
use gracetcp::server::{Server, ShutdownCause};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    // RUST_LOG wins over the configured level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        version = gracetcp::VERSION,
        address = %config.address,
        max_connections = config.max_connections,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "Starting gracetcp echo server"
    );

    let handler = Arc::new(EchoHandler::new().with_idle_timeout(config.idle_timeout));
    let server = Server::new(handler);

    match server.listen_and_serve_with_signal(&config).await? {
        ShutdownCause::Signal => info!("Server shutdown complete"),
        ShutdownCause::AcceptError(e) => warn!(error = %e, "Server stopped after accept error"),
    }
    Ok(())
}
