//! Command-line argument parsing.

use clap::Parser;

/// virtpilot Node - VM control service
#[derive(Parser, Debug)]
#[command(name = "virtpilot-node")]
#[command(about = "virtpilot Node - HTTP control service for hypervisor-hosted VMs")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "VIRTPILOT_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Listen address for the HTTP API
    #[arg(long)]
    pub listen: Option<String>,

    /// Hypervisor URI used when a request does not name one
    #[arg(long, env = "VIRTPILOT_DEFAULT_URI")]
    pub default_uri: Option<String>,

    /// Directory with install media
    #[arg(long)]
    pub iso_path: Option<String>,

    /// Enable development mode (mock hypervisor)
    #[arg(long)]
    pub dev: bool,
}
