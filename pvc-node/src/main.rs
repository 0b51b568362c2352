//! # PVC Node Daemon
//!
//! Runs on each cluster host and coordinates it with the rest of the
//! cluster: membership, primary election, fencing, VM placement, and
//! network/storage convergence.
//!
//! ## Usage
//! ```bash
//! pvc-node --config /etc/pvc/node.yaml
//! ```

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use pvc_drivers::{
    MockFence, MockHypervisor, MockNetwork, MockStorage,
    system::{SystemFence, SystemHypervisor, SystemNetwork, SystemStorage},
};
use pvc_kv::MemoryKv;
use pvc_node::cli::Args;
use pvc_node::{Config, Daemon, DriverSet};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(_) if args.dev => Config::default(),
        Err(e) => return Err(e.context(format!("cannot load config from {}", args.config))),
    };
    let mut config = config.with_cli_overrides(&args);

    // The config document supplies the optional JSON log sink; the level
    // comes from the command line or RUST_LOG.
    match &config.logging.json_log_path {
        Some(path) => pvc_common::init_logging_json(&args.log_level, path)?,
        None => pvc_common::init_logging(&args.log_level)?,
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = %args.config,
        "Starting PVC node daemon"
    );

    // Development mode is a one-node cluster out of the box.
    if args.dev && config.cluster.coordinators.is_empty() {
        config.cluster.coordinators = vec![config.node_name()];
    }
    config.validate()?;

    // The external coordination service client is deployment-specific;
    // this build carries the in-process backend, which `--dev` uses and
    // which otherwise limits the daemon to single-node operation.
    if !args.dev {
        warn!("No external KV backend bundled, running the in-process backend");
    }
    let kv = Arc::new(MemoryKv::new());

    let drivers = if args.dev {
        info!("Using mock driver backends");
        DriverSet {
            hypervisor: Arc::new(MockHypervisor::new()),
            network: Arc::new(MockNetwork::new()),
            storage: Arc::new(MockStorage::new()),
            fence: Arc::new(MockFence::new()),
            extra_plugins: Vec::new(),
        }
    } else {
        DriverSet {
            hypervisor: Arc::new(SystemHypervisor::new(
                "qemu:///system",
                "/var/log/pvc/consoles",
            )),
            network: Arc::new(SystemNetwork::new()),
            storage: Arc::new(SystemStorage::new()),
            fence: Arc::new(SystemFence::new()),
            extra_plugins: Vec::new(),
        }
    };

    let daemon = Daemon::start(config, kv, drivers).await?;
    let mut session_lost = daemon.session_lost();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, stopping");
            daemon.shutdown().await;
            Ok(())
        }
        _ = session_lost.changed() => {
            error!("KV session lost; daemon must restart");
            daemon.abort();
            Err(anyhow::anyhow!("fatal: cluster session lost"))
        }
    }
}
