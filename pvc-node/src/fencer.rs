//! Fence controller.
//!
//! Runs on every node but acts only while this node holds the primary
//! lease. Confirmed-dead peers arrive from the keepalive engine; each one
//! is CAS-marked dead (aborting cleanly on a recovery race), power-reset
//! through its management controller, marked fenced, and then handled per
//! the configured post-fence action. Storage locks are always cleared
//! before a VM is offered to another node.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use pvc_common::{retry_with_backoff, ClusterError, RetryPolicy};
use pvc_drivers::{IpmiCredentials, FENCE_DEADLINE};
use pvc_kv::{KvStore, KvStoreExt};
use pvc_schema::{
    paths, CoordinatorState, DaemonState, MigrationMethod, NodeRecord, TaskRecord, TaskRequest,
    TaskStatus, VmRecord, VmState,
};

use crate::config::FenceAction;
use crate::daemon::Context;
use crate::placement::select_target;

pub struct FenceController {
    ctx: Arc<Context>,
    primary_rx: watch::Receiver<bool>,
}

impl FenceController {
    pub fn new(ctx: Arc<Context>, primary_rx: watch::Receiver<bool>) -> Self {
        Self { ctx, primary_rx }
    }

    /// Consume confirmed-dead peers until shutdown.
    pub async fn run(
        self,
        mut dead_peers: mpsc::Receiver<String>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Fence controller running");
        loop {
            tokio::select! {
                peer = dead_peers.recv() => {
                    match peer {
                        Some(peer) => self.handle_dead_peer(&peer).await,
                        None => break,
                    }
                }
                _ = shutdown.recv() => {
                    info!("Fence controller shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_dead_peer(&self, peer: &str) {
        if !*self.primary_rx.borrow() {
            debug!(peer = %peer, "Not primary, ignoring dead peer");
            return;
        }

        info!(peer = %peer, "Handling confirmed-dead peer");

        // The ephemeral presence key is the definitive liveness signal: if
        // it is back, the peer's session recovered and fencing must abort.
        match self.ctx.kv.get(&paths::node_alive(peer)).await {
            Ok(Some(_)) => {
                info!(peer = %peer, "Peer session is alive again, aborting fence");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(peer = %peer, error = %e, "Cannot check peer liveness, aborting fence");
                return;
            }
        }

        let path = paths::node(peer);
        let (mut record, version) = match self.ctx.kv.get_json::<NodeRecord>(&path).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                warn!(peer = %peer, "No node record for dead peer");
                return;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Cannot read dead peer record");
                return;
            }
        };
        if record.daemon_state != DaemonState::Run {
            debug!(peer = %peer, state = %record.daemon_state, "Peer already handled");
            return;
        }

        // CAS to dead. A mismatch means the peer published a keepalive in
        // the meantime; abort and let the next evaluation decide.
        record.daemon_state = DaemonState::Dead;
        let version = match self.ctx.kv.cas_json(&path, Some(version), &record).await {
            Ok(version) => version,
            Err(e) => {
                info!(peer = %peer, error = %e, "Lost the race marking peer dead, aborting");
                return;
            }
        };
        warn!(peer = %peer, "Peer marked dead, invoking fence driver");

        match self.fence_peer(peer).await {
            Ok(()) => {
                record.daemon_state = DaemonState::Fenced;
                record.coordinator_state = CoordinatorState::None;
                if let Err(e) = self.ctx.kv.cas_json(&path, Some(version), &record).await {
                    error!(peer = %peer, error = %e, "Cannot record fence result");
                    return;
                }
                info!(peer = %peer, "Peer fenced");

                if self.ctx.config.fencing.actions.successful_fence == FenceAction::Migrate {
                    self.recover_peer_vms(peer).await;
                }
            }
            Err(e) => {
                error!(peer = %peer, error = %e, "Fence failed after retries");
                // The failed-fence action defaults to none. Migrating here
                // is only sound when the peer is guaranteed to have reset
                // itself, which config validation ties to the suicide
                // timer being armed.
                if self.ctx.config.fencing.actions.failed_fence == FenceAction::Migrate {
                    warn!(
                        peer = %peer,
                        "failed_fence=migrate: recovering VMs on the strength of the peer's suicide timer"
                    );
                    self.recover_peer_vms(peer).await;
                }
            }
        }
    }

    /// Power-reset the peer, up to three attempts with backoff.
    async fn fence_peer(&self, peer: &str) -> Result<(), ClusterError> {
        let credentials = match self
            .ctx
            .kv
            .get_json::<IpmiCredentials>(&paths::node_ipmi(peer))
            .await?
        {
            Some((credentials, _)) => credentials,
            None => {
                return Err(ClusterError::Invalid(format!(
                    "no management-controller credentials published for {}",
                    peer
                )))
            }
        };

        let policy = RetryPolicy::default();
        retry_with_backoff(&policy, "fence", || {
            let credentials = credentials.clone();
            async move {
                match timeout(FENCE_DEADLINE, self.ctx.fence.fence(peer, &credentials)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(ClusterError::Transient(e.to_string())),
                    Err(_) => Err(ClusterError::Transient("fence attempt timed out".into())),
                }
            }
        })
        .await
        .map_err(|e| ClusterError::Unreachable(format!("fence of {} failed: {}", peer, e)))
    }

    /// The successful-fence migrate action: clear each dead-owned VM's
    /// storage locks, pick it a new home, and rewrite its record. The
    /// target's placement controller does the actual start.
    async fn recover_peer_vms(&self, peer: &str) {
        let vms = match self.ctx.kv.list_json::<VmRecord>(paths::DOMAINS).await {
            Ok(vms) => vms,
            Err(e) => {
                error!(peer = %peer, error = %e, "Cannot list VMs for recovery");
                return;
            }
        };
        let nodes: Vec<(String, NodeRecord)> = match self
            .ctx
            .kv
            .list_json::<NodeRecord>(paths::NODES)
            .await
        {
            Ok(nodes) => nodes
                .into_iter()
                .filter_map(|(path, record, _)| {
                    paths::node_name(&path).map(|name| (name.to_string(), record))
                })
                .collect(),
            Err(e) => {
                error!(peer = %peer, error = %e, "Cannot list nodes for recovery");
                return;
            }
        };
        let all_vms: Vec<VmRecord> = vms
            .iter()
            .filter(|(path, _, _)| paths::domain_uuid(path).is_some())
            .map(|(_, vm, _)| vm.clone())
            .collect();

        for (path, vm, version) in vms {
            let Some(uuid) = paths::domain_uuid(&path).map(String::from) else {
                continue;
            };
            if vm.node != peer || vm.state != VmState::Start {
                continue;
            }

            // Locks first: the block store refuses concurrent use, so no
            // new node may open these volumes while the dead peer's marks
            // remain.
            let mut locks_cleared = true;
            for volume in &vm.volumes {
                if let Err(e) = self
                    .ctx
                    .storage
                    .clear_lock(&volume.pool, &volume.name)
                    .await
                {
                    error!(
                        uuid = %uuid,
                        volume = %format!("{}/{}", volume.pool, volume.name),
                        error = %e,
                        "Cannot clear storage lock, leaving VM down"
                    );
                    locks_cleared = false;
                    break;
                }
                self.mirror_lock_cleared(&volume.pool, &volume.name).await;
            }
            if !locks_cleared {
                self.emit_error_task(
                    &vm.name,
                    &format!("VM {} not recovered: storage lock could not be cleared", vm.name),
                )
                .await;
                continue;
            }

            let target = match select_target(
                &vm,
                self.ctx.config.migration.target_selector,
                &nodes,
                &all_vms,
                &[peer],
            ) {
                Ok(target) => target,
                Err(e) => {
                    warn!(uuid = %uuid, error = %e, "No recovery target for VM");
                    self.emit_error_task(
                        &vm.name,
                        &format!("VM {} not recovered from {}: {}", vm.name, peer, e),
                    )
                    .await;
                    continue;
                }
            };

            let mut recovered = vm.clone();
            recovered.node = target.clone();
            if vm.meta.migration_method == MigrationMethod::Live {
                recovered.previous_node = Some(peer.to_string());
            }
            match self
                .ctx
                .kv
                .cas_json(&paths::domain(&uuid), Some(version), &recovered)
                .await
            {
                Ok(_) => {
                    info!(
                        uuid = %uuid,
                        name = %vm.name,
                        from = %peer,
                        to = %target,
                        "VM recovered from fenced node"
                    );
                }
                Err(e) => {
                    warn!(uuid = %uuid, error = %e, "Recovery write lost a race");
                }
            }
        }
    }

    async fn mirror_lock_cleared(&self, pool: &str, name: &str) {
        let path = paths::volume(pool, name);
        if let Ok(Some((mut record, _))) = self
            .ctx
            .kv
            .get_json::<pvc_schema::VolumeRecord>(&path)
            .await
        {
            record.lock_holder = None;
            let _ = self.ctx.kv.put_json(&path, &record).await;
        }
    }

    async fn emit_error_task(&self, subject: &str, message: &str) {
        let mut task = TaskRecord::new(TaskRequest::ErrorReport {
            subject: subject.to_string(),
        });
        task.claimed_by = Some(self.ctx.node_name.clone());
        task.advance(TaskStatus::Failed, message);
        let _ = self.ctx.kv.put_json(&paths::task(&task.id), &task).await;
    }
}
