//! gatewayd - WireGuard/OSPF/VRRP site-to-site gateway reconciler
//!
//! This daemon keeps the local WireGuard interface, BIRD and Keepalived
//! converged on the set of peer gateways announced over relations.

use clap::Parser;
use gatewayd::config::Config;
use gatewayd::server::Server;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gatewayd=info,wg_gateway_core=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!(
        "gatewayd v{} - WireGuard/OSPF/VRRP gateway reconciler",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    let server = match Server::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Install signal handler
    let signal_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_server.shutdown();
    });

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
