// src/main.rs

//! The entry point for a standalone fleetsync node.

use anyhow::Result;
use fleetsync::config::{BrokerBackend, Config};
use fleetsync::server;
use std::env;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|arg| arg == "--version") {
        println!("fleetsync version {VERSION}");
        return Ok(());
    }

    let flag_value = |flag: &str| -> Option<String> {
        let index = args.iter().position(|arg| arg == flag)?;
        match args.get(index + 1) {
            Some(value) => Some(value.clone()),
            None => {
                eprintln!("{flag} flag requires a value");
                std::process::exit(1);
            }
        }
    };

    let config_path = flag_value("--config").unwrap_or_else(|| "fleetsync.toml".to_string());
    let mut config = match Config::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    if let Some(server_name) = flag_value("--server-name") {
        config.server_name = server_name;
    }
    if args.iter().any(|arg| arg == "--memory") {
        config.broker.backend = BrokerBackend::Memory;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    info!("fleetsync {} starting as '{}'.", VERSION, config.server_name);

    if let Err(e) = server::run(config).await {
        error!("Node runtime error: {:#}", e);
        return Err(e);
    }

    Ok(())
}
