//! tuned-echo: TCP socket tuning around a line echo service
//!
//! Runs either side of a newline-delimited echo exchange:
//! - server: accepts connections and answers every line with a timestamped
//!   acknowledgment until the client sends `quit`
//! - client: sends a fixed number of numbered messages, then `quit`
//!
//! Both sides apply the same socket options before exchanging data:
//! TCP_NODELAY, 64 KB send/receive buffers, keepalive, a 30 s read timeout
//! and a 5 s linger. The listener additionally sets SO_REUSEADDR.

mod client;
mod config;
mod server;
mod session;
mod tuning;

use client::Client;
use config::{Config, Mode};
use server::Server;
use tracing::{error, info};
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

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match config.mode {
        Mode::Server => runtime.block_on(run_server(config)),
        Mode::Client => runtime.block_on(run_client(config)),
    }
}

/// Run the listener until it fails
async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.server.host,
        port = config.server.port,
        "Starting TCP optimization server"
    );

    let server = Server::bind(&config.server, config.socket).await.map_err(|e| {
        error!(error = %e, "Server failed to start");
        e
    })?;

    server.run().await.map_err(|e| {
        error!(error = %e, "Server stopped");
        e
    })?;
    Ok(())
}

/// Run the fixed client exchange
async fn run_client(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.client.host,
        port = config.client.port,
        messages = config.client.messages,
        pause_ms = config.client.pause.as_millis() as u64,
        "Starting TCP optimization client"
    );

    Client::new(config.client, config.socket)
        .run()
        .await
        .map_err(|e| {
            error!(error = %e, "Client failed");
            e
        })?;
    Ok(())
}
