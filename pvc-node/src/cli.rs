//! Command-line arguments for the node daemon.

use clap::Parser;

/// PVC node daemon: cluster coordination core for one hypervisor host.
#[derive(Parser, Debug)]
#[command(name = "pvc-node", version, about)]
pub struct Args {
    /// Path to the node configuration document
    #[arg(short, long, default_value = "/etc/pvc/node.yaml", env = "PVC_CONFIG")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "PVC_LOG_LEVEL")]
    pub log_level: String,

    /// Override the node name from the config document
    #[arg(long)]
    pub node_name: Option<String>,

    /// Development mode: in-memory KV backend and mock drivers
    #[arg(long)]
    pub dev: bool,
}
