//! Primary-coordinator role.
//!
//! Consumes the leader election. On acquiring the lease: bind the
//! floating addresses, turn on the per-network gateway dispatchers and
//! the fence controller (both follow the shared primary signal), then
//! advertise `primary`. On losing or releasing the lease the same steps
//! run in the opposite order, so no resource is ever held past the lease.
//! The transient takeover/relinquish states are published so health
//! probes can suppress alarms while services move.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use pvc_kv::{KvStoreExt, LeadershipHandle};
use pvc_schema::{paths, CoordinatorState, NodeRecord, NodeRole};

use crate::daemon::Context;
use crate::state::NodeState;

pub struct PrimaryRole {
    ctx: Arc<Context>,
    state: Arc<NodeState>,
    primary_tx: watch::Sender<bool>,
}

impl PrimaryRole {
    pub fn new(ctx: Arc<Context>, state: Arc<NodeState>, primary_tx: watch::Sender<bool>) -> Self {
        Self {
            ctx,
            state,
            primary_tx,
        }
    }

    /// Follow the leadership handle until shutdown.
    pub async fn run(self, mut handle: LeadershipHandle, mut shutdown: broadcast::Receiver<()>) {
        // Coordinators idle at secondary until the lease says otherwise.
        if let Err(e) = self
            .state
            .transition_coordinator(self.ctx.kv.as_ref(), CoordinatorState::Secondary)
            .await
        {
            error!(error = %e, "Cannot enter secondary state");
        }

        let mut leader_rx = handle.watch();
        let mut is_primary = false;

        // The lease may already be ours (first candidate in the queue).
        if *leader_rx.borrow() {
            self.takeover().await;
            is_primary = true;
        }

        loop {
            tokio::select! {
                changed = leader_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let leading = *leader_rx.borrow();
                    if leading && !is_primary {
                        self.takeover().await;
                        is_primary = true;
                    } else if !leading && is_primary {
                        warn!("Primary lease lost");
                        self.relinquish().await;
                        is_primary = false;
                    }
                }
                _ = shutdown.recv() => {
                    if is_primary {
                        // Relinquish before releasing the lease so the
                        // next primary sees clean ownership.
                        self.relinquish().await;
                    }
                    handle.release();
                    info!("Primary role shutting down");
                    break;
                }
            }
        }
    }

    async fn takeover(&self) {
        info!("Acquired primary lease, taking over cluster services");
        if let Err(e) = self
            .state
            .transition_coordinator(self.ctx.kv.as_ref(), CoordinatorState::Takeover)
            .await
        {
            error!(error = %e, "Cannot enter takeover state");
        }

        // A crashed primary leaves a record still claiming the role; the
        // incoming primary force-demotes it so the cluster never shows
        // two primaries.
        self.demote_stale_primaries().await;

        for (device, address) in self.ctx.config.floating_addresses() {
            match self.ctx.network.bind_address(&device, &address).await {
                Ok(()) => info!(device = %device, address = %address, "Floating address bound"),
                Err(e) => {
                    error!(device = %device, address = %address, error = %e, "Floating address bind failed")
                }
            }
        }

        // Gateways and the fence controller follow this signal.
        let _ = self.primary_tx.send(true);

        if let Err(e) = self
            .state
            .transition_coordinator(self.ctx.kv.as_ref(), CoordinatorState::Primary)
            .await
        {
            error!(error = %e, "Cannot advertise primary state");
        }
        info!("This node is now the primary coordinator");
    }

    /// Force any other node record still advertising a primary-side state
    /// back to secondary. Role transitions are one of the two sanctioned
    /// cases of writing a peer's coordinator_state.
    async fn demote_stale_primaries(&self) {
        let records = match self.ctx.kv.list_json::<NodeRecord>(paths::NODES).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Cannot scan node records for stale primaries");
                return;
            }
        };

        for (path, mut record, version) in records {
            let Some(name) = paths::node_name(&path).map(String::from) else {
                continue;
            };
            if name == self.ctx.node_name || record.role != NodeRole::Coordinator {
                continue;
            }
            if matches!(
                record.coordinator_state,
                CoordinatorState::Primary
                    | CoordinatorState::Takeover
                    | CoordinatorState::Relinquish
            ) {
                warn!(peer = %name, state = %record.coordinator_state, "Demoting stale primary record");
                record.coordinator_state = CoordinatorState::Secondary;
                if let Err(e) = self.ctx.kv.cas_json(&path, Some(version), &record).await {
                    warn!(peer = %name, error = %e, "Stale primary demotion lost a race");
                }
            }
        }
    }

    async fn relinquish(&self) {
        info!("Relinquishing primary role");
        if let Err(e) = self
            .state
            .transition_coordinator(self.ctx.kv.as_ref(), CoordinatorState::Relinquish)
            .await
        {
            error!(error = %e, "Cannot enter relinquish state");
        }

        // Reverse order of takeover: services down first, addresses last.
        let _ = self.primary_tx.send(false);

        for (device, address) in self.ctx.config.floating_addresses().into_iter().rev() {
            if let Err(e) = self.ctx.network.unbind_address(&device, &address).await {
                warn!(device = %device, address = %address, error = %e, "Floating address unbind failed");
            }
        }

        if let Err(e) = self
            .state
            .transition_coordinator(self.ctx.kv.as_ref(), CoordinatorState::Secondary)
            .await
        {
            error!(error = %e, "Cannot return to secondary state");
        }
    }
}
