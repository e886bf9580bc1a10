//! emberweb: an embeddable HTTP/1.1 server engine.
//!
//! The binary runs the engine with its built-in static file handler.
//! Configuration comes from CLI arguments or a TOML file.

use emberweb::config::Config;
use emberweb::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        root = %config.root.display(),
        max_connections = config.max_connections,
        "Starting emberweb server"
    );

    runtime::run(config)?;
    Ok(())
}
