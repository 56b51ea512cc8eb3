//! # virtpilot Node
//!
//! HTTP/JSON control service for VMs on one or more hypervisors.
//!
//! ## Usage
//! ```bash
//! virtpilot-node --config /etc/virtpilot/node.yaml
//! virtpilot-node --dev --listen 127.0.0.1:8080
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use virtpilot_common::LogFormat;
use virtpilot_node::cli::Args;
use virtpilot_node::config::{Config, DEFAULT_CONFIG_PATH};
use virtpilot_node::server;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let format = if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    virtpilot_common::init_logging(&args.log_level, format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting virtpilot node"
    );

    let config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                cfg.with_cli_overrides(&args)
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                return Err(e);
            }
        },
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                cfg.with_cli_overrides(&args)
            }
            Err(_) => {
                info!("No config file found, using CLI arguments and defaults");
                Config::default_with_cli(&args)
            }
        },
    };

    info!(
        listen = %config.server.listen_address,
        hypervisor = ?config.hypervisor.backend,
        default_uri = %config.hypervisor.default_uri,
        "Node configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    Ok(())
}
