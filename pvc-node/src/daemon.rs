//! Daemon lifecycle and component wiring.
//!
//! Builds the explicit context every component receives (config, KV
//! handle, drivers), opens the ephemeral session, walks the daemon state
//! through stop -> init -> run, and spawns one long-lived worker per
//! component. Graceful stop reverses the steps; session loss is fatal and
//! surfaces through [`Daemon::session_lost`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use pvc_drivers::{FenceDriver, HypervisorDriver, NetworkDriver, StorageDriver};
use pvc_kv::{KvStore, KvStoreExt, SessionHandle};
use pvc_schema::{paths, DaemonState, NodeAddresses, NodeRecord, NodeRole};

use crate::config::Config;
use crate::dispatch::{self, Subscriptions};
use crate::fencer::FenceController;
use crate::health::{HealthPlugin, KvProbe, LoadProbe, OsdProbe, PluginHost};
use crate::keepalive::KeepaliveEngine;
use crate::network_ctrl::NetworkController;
use crate::placement::PlacementController;
use crate::primary::PrimaryRole;
use crate::state::NodeState;
use crate::storage_ctrl::StorageController;
use crate::tasks::TaskController;

/// Shared dependencies handed to every component.
pub struct Context {
    pub config: Arc<Config>,
    pub node_name: String,
    pub kv: Arc<dyn KvStore>,
    pub hypervisor: Arc<dyn HypervisorDriver>,
    pub network: Arc<dyn NetworkDriver>,
    pub storage: Arc<dyn StorageDriver>,
    pub fence: Arc<dyn FenceDriver>,
}

/// The driver backends (and any extra health probes) the daemon runs with.
pub struct DriverSet {
    pub hypervisor: Arc<dyn HypervisorDriver>,
    pub network: Arc<dyn NetworkDriver>,
    pub storage: Arc<dyn StorageDriver>,
    pub fence: Arc<dyn FenceDriver>,
    pub extra_plugins: Vec<Arc<dyn HealthPlugin>>,
}

/// One running node daemon.
pub struct Daemon {
    ctx: Arc<Context>,
    state: Arc<NodeState>,
    plugins: Arc<PluginHost>,
    session: Option<SessionHandle>,
    session_expired: watch::Receiver<bool>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    /// Kept on hypervisor-role nodes so the primary signal stays open
    /// (it permanently reads false there).
    _primary_tx: Option<watch::Sender<bool>>,
}

impl Daemon {
    /// Bring the node into the cluster and start every component.
    pub async fn start(config: Config, kv: Arc<dyn KvStore>, drivers: DriverSet) -> Result<Self> {
        config.validate()?;
        let node_name = config.node_name();
        let role = config.node.role;

        info!(
            node = %node_name,
            role = %role,
            keepalive_secs = config.timers.keepalive_interval,
            "Starting node daemon"
        );

        let ctx = Arc::new(Context {
            config: Arc::new(config),
            node_name: node_name.clone(),
            kv: Arc::clone(&kv),
            hypervisor: drivers.hypervisor,
            network: drivers.network,
            storage: drivers.storage,
            fence: drivers.fence,
        });

        // The session TTL matches the suspect window: a node that cannot
        // heartbeat for that long is about to be treated as missing anyway.
        let ttl = ctx.config.suspect_age().max(Duration::from_secs(3));
        let session = kv
            .session(ttl)
            .await
            .context("cannot open KV session")?;
        let session_expired = session.expired();

        let state = Arc::new(NodeState::new(&node_name, role));
        if let Ok(Some((record, _))) = kv.get_json::<NodeRecord>(&paths::node(&node_name)).await {
            state.adopt(&record);
        }
        state
            .transition_daemon(kv.as_ref(), DaemonState::Init)
            .await?;

        // Publish what peers need to reach this node: management
        // controller credentials for the fencer, per-network addresses
        // for live migration, and the ephemeral presence key.
        kv.put_json(
            &paths::node_ipmi(&node_name),
            &ctx.config.ipmi_credentials(),
        )
        .await?;
        let nets = &ctx.config.cluster.networks;
        let strip = |cidr: &str| cidr.split('/').next().unwrap_or_default().to_string();
        kv.put_json(
            &paths::node_addrs(&node_name),
            &NodeAddresses {
                upstream: strip(&nets.upstream.address),
                cluster: strip(&nets.cluster.address),
                storage: strip(&nets.storage.address),
            },
        )
        .await?;
        kv.put_ephemeral(&session, &paths::node_alive(&node_name), "1")
            .await?;

        // Health probes: builtins plus whatever the caller supplies,
        // armed through the plugin directory.
        let mut available: Vec<Arc<dyn HealthPlugin>> = vec![
            Arc::new(LoadProbe),
            Arc::new(KvProbe::new(kv.availability())),
            Arc::new(OsdProbe::new(Arc::clone(&kv), &node_name)),
        ];
        available.extend(drivers.extra_plugins);
        let plugins = Arc::new(PluginHost::discover(
            &ctx.config.plugin_directory,
            available,
        ));
        plugins.setup_all().await;

        let (shutdown_tx, _) = broadcast::channel(8);
        let (primary_tx, primary_rx) = watch::channel(false);
        let (fence_tx, fence_rx) = mpsc::channel(16);

        let (placement_tx, placement_rx) = dispatch::channel();
        let (network_tx, network_rx) = dispatch::channel();
        let (storage_tx, storage_rx) = dispatch::channel();
        let (tasks_tx, tasks_rx) = dispatch::channel();

        let placement = Arc::new(PlacementController::new(Arc::clone(&ctx), Arc::clone(&state)));
        let network_ctrl = Arc::new(NetworkController::new(
            Arc::clone(&ctx),
            primary_rx.clone(),
        ));
        let storage_ctrl = Arc::new(StorageController::new(Arc::clone(&ctx)));
        let task_ctrl = Arc::new(TaskController::new(
            Arc::clone(&ctx),
            Arc::clone(&state),
            Arc::clone(&placement),
            Arc::clone(&storage_ctrl),
            primary_rx.clone(),
        ));

        let mut handles = Vec::new();

        handles.push(tokio::spawn(dispatch::run(
            Arc::clone(&kv),
            ctx.config.keepalive_interval(),
            Subscriptions {
                placement: placement_tx,
                network: network_tx,
                storage: storage_tx,
                tasks: tasks_tx,
            },
            shutdown_tx.subscribe(),
        )));

        let keepalive = KeepaliveEngine::new(
            Arc::clone(&ctx),
            Arc::clone(&state),
            Arc::clone(&plugins),
            fence_tx,
            primary_rx.clone(),
        );
        handles.push(tokio::spawn(keepalive.run(shutdown_tx.subscribe())));

        handles.push(tokio::spawn(
            Arc::clone(&placement).run(placement_rx, shutdown_tx.subscribe()),
        ));
        handles.push(tokio::spawn(
            Arc::clone(&network_ctrl).run(network_rx, shutdown_tx.subscribe()),
        ));
        handles.push(tokio::spawn(
            Arc::clone(&storage_ctrl).run(storage_rx, shutdown_tx.subscribe()),
        ));
        handles.push(tokio::spawn(
            Arc::clone(&task_ctrl).run(tasks_rx, shutdown_tx.subscribe()),
        ));

        let fencer = FenceController::new(Arc::clone(&ctx), primary_rx.clone());
        handles.push(tokio::spawn(
            fencer.run(fence_rx, shutdown_tx.subscribe()),
        ));

        // Only coordinators join the election; hypervisor-role nodes stay
        // at coordinator_state none.
        let mut primary_tx_keep = None;
        if role == NodeRole::Coordinator {
            let handle = kv
                .acquire_leader(&session, paths::PRIMARY_ELECTION, &node_name)
                .await
                .context("cannot join primary election")?;
            let primary_role =
                PrimaryRole::new(Arc::clone(&ctx), Arc::clone(&state), primary_tx);
            handles.push(tokio::spawn(
                primary_role.run(handle, shutdown_tx.subscribe()),
            ));
        } else {
            primary_tx_keep = Some(primary_tx);
        }

        state
            .transition_daemon(kv.as_ref(), DaemonState::Run)
            .await?;
        info!(node = %node_name, "Node daemon running");

        Ok(Self {
            ctx,
            state,
            plugins,
            session: Some(session),
            session_expired,
            shutdown_tx,
            handles,
            _primary_tx: primary_tx_keep,
        })
    }

    pub fn node_name(&self) -> &str {
        &self.ctx.node_name
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// Flips true when the KV session is gone. Session loss is fatal to
    /// cluster membership; the caller restarts the daemon.
    pub fn session_lost(&self) -> watch::Receiver<bool> {
        self.session_expired.clone()
    }

    /// Graceful stop: leave the run state, wind down every component (the
    /// primary role relinquishes before releasing its lease), and close
    /// the session.
    pub async fn shutdown(mut self) {
        info!(node = %self.ctx.node_name, "Node daemon stopping");

        if let Err(e) = self
            .state
            .transition_daemon(self.ctx.kv.as_ref(), DaemonState::Stop)
            .await
        {
            warn!(error = %e, "Cannot publish stop state");
        }

        let _ = self.shutdown_tx.send(());
        for handle in self.handles.drain(..) {
            if tokio::time::timeout(Duration::from_secs(30), handle)
                .await
                .is_err()
            {
                warn!("Component did not stop in time");
            }
        }

        self.plugins.cleanup_all().await;

        if let Some(mut session) = self.session.take() {
            session.close();
        }
        info!("Node daemon stopped");
    }

    /// Hard kill, as a crashing host would: components are aborted and no
    /// state transitions are published. Used by the test harness.
    pub fn abort(mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        // Dropping the session removes the ephemeral presence key, the
        // definitive signal of node loss.
        self.session.take();
    }
}
