// src/main.rs

//! The main entry point for the cluster recovery coordinator.

use std::env;
use std::sync::Arc;

use anyhow::Result;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("recoverd version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "recoverd.toml".to_string());

    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info,recoverd::core=debug".to_string());

    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    let _reload_handle = Arc::new(reload_handle);

    if let Err(e) = recoverd::coordinator::run(&config_path).await {
        error!("coordinator runtime error: {e}");
        return Err(e);
    }

    Ok(())
}
