//! Task controller.
//!
//! The task tree is the cluster's administrative inbox. Every record is
//! claimed by exactly one node through a CAS on `claimed_by`, routed to
//! the owning controller, and answered through its status fields:
//! accepted -> running -> done | failed. Operations that lose a race or
//! hit a busy migration slot are returned to the queue and retried.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use pvc_common::ClusterError;
use pvc_kv::{KvStore, KvStoreExt};
use pvc_schema::{
    paths, DomainState, TaskRecord, TaskRequest, TaskStatus, VmRecord, VmState,
};

use crate::daemon::Context;
use crate::dispatch::Event;
use crate::placement::PlacementController;
use crate::state::NodeState;
use crate::storage_ctrl::StorageController;

pub struct TaskController {
    ctx: Arc<Context>,
    state: Arc<NodeState>,
    placement: Arc<PlacementController>,
    storage: Arc<StorageController>,
    primary_rx: watch::Receiver<bool>,
}

impl TaskController {
    pub fn new(
        ctx: Arc<Context>,
        state: Arc<NodeState>,
        placement: Arc<PlacementController>,
        storage: Arc<StorageController>,
        primary_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            state,
            placement,
            storage,
            primary_rx,
        }
    }

    fn name(&self) -> &str {
        &self.ctx.node_name
    }

    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<Event>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Task controller running");
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(Event::Task(_)) | Some(Event::Tick) | Some(Event::Availability(true)) => {
                            self.scan().await;
                        }
                        Some(_) => {}
                        None => {
                            warn!("Task controller stopping: event channel closed");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Task controller shutting down");
                    break;
                }
            }
        }
    }

    /// Claim and dispatch every open task this node is responsible for.
    async fn scan(self: &Arc<Self>) {
        if !*self.ctx.kv.availability().borrow() {
            return;
        }

        let tasks = match self.ctx.kv.list_json::<TaskRecord>(paths::TASKS).await {
            Ok(tasks) => tasks,
            Err(e) => {
                debug!(error = %e, "Cannot list task table");
                return;
            }
        };

        for (_, task, version) in tasks {
            if task.status != TaskStatus::Accepted || task.claimed_by.is_some() {
                continue;
            }
            if !self.routes_here(&task.request).await {
                continue;
            }

            let mut claimed = task.clone();
            claimed.claimed_by = Some(self.name().to_string());
            claimed.advance(TaskStatus::Running, "claimed");
            match self
                .ctx
                .kv
                .cas_json(&paths::task(&task.id), Some(version), &claimed)
                .await
            {
                Ok(_) => {
                    info!(task_id = %task.id, request = ?task.request, "Task claimed");
                    let controller = Arc::clone(self);
                    tokio::spawn(async move {
                        controller.execute(claimed).await;
                    });
                }
                Err(e) => {
                    debug!(task_id = %task.id, error = %e, "Lost the claim race");
                }
            }
        }
    }

    /// Routing: flush/unflush and OSD adds go to the named node, VM
    /// operations to the VM's current owner, storage commands to the
    /// primary.
    async fn routes_here(&self, request: &TaskRequest) -> bool {
        match request {
            TaskRequest::FlushNode { node } | TaskRequest::UnflushNode { node } => {
                node == self.name()
            }
            TaskRequest::MigrateVm { uuid, .. }
            | TaskRequest::UnmigrateVm { uuid }
            | TaskRequest::MoveVm { uuid, .. } => {
                matches!(
                    self.ctx.kv.get_json::<VmRecord>(&paths::domain(uuid)).await,
                    Ok(Some((vm, _))) if vm.node == self.name()
                )
            }
            TaskRequest::AddOsd { node, .. } => node == self.name(),
            TaskRequest::CreateVolume { .. }
            | TaskRequest::ResizeVolume { .. }
            | TaskRequest::DeleteVolume { .. }
            | TaskRequest::SnapshotVolume { .. } => *self.primary_rx.borrow(),
            // Error reports are closed on creation, never claimed.
            TaskRequest::ErrorReport { .. } => false,
        }
    }

    async fn execute(&self, task: TaskRecord) {
        let result = self.dispatch(&task.request).await;
        self.finish(task, result).await;
    }

    async fn dispatch(&self, request: &TaskRequest) -> Result<String, ClusterError> {
        match request {
            TaskRequest::FlushNode { .. } => {
                if self.state.snapshot().domain_state == DomainState::Flushed {
                    return Ok("node already flushed".to_string());
                }
                self.state
                    .transition_domain(self.ctx.kv.as_ref(), DomainState::Flushing)
                    .await?;
                self.placement.drain().await?;
                Ok("node flushed".to_string())
            }
            TaskRequest::UnflushNode { .. } => {
                self.state
                    .transition_domain(self.ctx.kv.as_ref(), DomainState::Unflushing)
                    .await?;
                self.state
                    .transition_domain(self.ctx.kv.as_ref(), DomainState::Ready)
                    .await?;
                let queued = self.queue_return_migrations().await?;
                self.autostart_local_vms().await?;
                Ok(format!("node ready, {} return migrations queued", queued))
            }
            TaskRequest::MigrateVm {
                uuid,
                target,
                force,
            } => {
                let target = self
                    .placement
                    .migrate_vm(uuid, target.clone(), *force, true)
                    .await?;
                Ok(format!("migrated to {}", target))
            }
            TaskRequest::MoveVm { uuid, target } => {
                let target = self
                    .placement
                    .migrate_vm(uuid, target.clone(), false, false)
                    .await?;
                Ok(format!("moved to {}", target))
            }
            TaskRequest::UnmigrateVm { uuid } => {
                let target = self.placement.unmigrate_vm(uuid).await?;
                Ok(format!("returned to {}", target))
            }
            TaskRequest::AddOsd {
                id,
                node,
                device,
                weight,
            } => {
                self.storage
                    .bootstrap_osd(*id, node, device, *weight)
                    .await?;
                Ok(format!("OSD {} up on {}", id, device))
            }
            TaskRequest::CreateVolume {
                pool,
                name,
                size_bytes,
            } => {
                self.storage.create_volume(pool, name, *size_bytes).await?;
                Ok(format!("volume {}/{} created", pool, name))
            }
            TaskRequest::ResizeVolume {
                pool,
                name,
                size_bytes,
            } => {
                self.storage.resize_volume(pool, name, *size_bytes).await?;
                Ok(format!("volume {}/{} resized", pool, name))
            }
            TaskRequest::DeleteVolume { pool, name } => {
                self.storage.delete_volume(pool, name).await?;
                Ok(format!("volume {}/{} deleted", pool, name))
            }
            TaskRequest::SnapshotVolume {
                pool,
                name,
                snapshot,
            } => {
                self.storage.snapshot_volume(pool, name, snapshot).await?;
                Ok(format!("snapshot {}/{}@{} created", pool, name, snapshot))
            }
            TaskRequest::ErrorReport { .. } => {
                Err(ClusterError::Invalid("error reports are not executable".into()))
            }
        }
    }

    /// After an unflush, queue an unmigrate for every VM that was drained
    /// off this node, so it comes home with its breadcrumb cleared.
    async fn queue_return_migrations(&self) -> Result<usize, ClusterError> {
        let vms = self.ctx.kv.list_json::<VmRecord>(paths::DOMAINS).await?;
        let tasks = self.ctx.kv.list_json::<TaskRecord>(paths::TASKS).await?;

        let mut queued = 0;
        for (path, vm, _) in vms {
            let Some(uuid) = paths::domain_uuid(&path).map(String::from) else {
                continue;
            };
            if vm.previous_node.as_deref() != Some(self.name())
                || vm.node == self.name()
                || vm.state != VmState::Start
            {
                continue;
            }
            let already_queued = tasks.iter().any(|(_, task, _)| {
                task.is_open()
                    && matches!(&task.request, TaskRequest::UnmigrateVm { uuid: u } if *u == uuid)
            });
            if already_queued {
                continue;
            }

            let task = TaskRecord::new(TaskRequest::UnmigrateVm { uuid: uuid.clone() });
            self.ctx.kv.put_json(&paths::task(&task.id), &task).await?;
            debug!(uuid = %uuid, task_id = %task.id, "Queued return migration");
            queued += 1;
        }
        Ok(queued)
    }

    /// Power on any autostart-flagged VM that sat out the drain powered
    /// off on this node.
    async fn autostart_local_vms(&self) -> Result<(), ClusterError> {
        let vms = self.ctx.kv.list_json::<VmRecord>(paths::DOMAINS).await?;
        for (path, mut vm, version) in vms {
            if paths::domain_uuid(&path).is_none() {
                continue;
            }
            if vm.node != self.name() || !vm.meta.autostart || vm.state != VmState::Stop {
                continue;
            }
            vm.state = VmState::Start;
            if let Err(e) = self.ctx.kv.cas_json(&path, Some(version), &vm).await {
                debug!(path = %path, error = %e, "Autostart write lost a race");
            } else {
                info!(name = %vm.name, "Autostart VM queued to start");
            }
        }
        Ok(())
    }

    /// Record the outcome. Transient failures requeue the task; everything
    /// else closes it.
    async fn finish(&self, task: TaskRecord, result: Result<String, ClusterError>) {
        let path = paths::task(&task.id);
        let Ok(Some((mut current, version))) = self.ctx.kv.get_json::<TaskRecord>(&path).await
        else {
            return;
        };

        match result {
            Ok(message) => {
                info!(task_id = %task.id, message = %message, "Task done");
                current.advance(TaskStatus::Done, message);
            }
            Err(e) if e.is_retryable() => {
                debug!(task_id = %task.id, error = %e, "Task requeued");
                current.claimed_by = None;
                current.advance(TaskStatus::Accepted, format!("will retry: {}", e));
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Task failed");
                current.advance(TaskStatus::Failed, e.to_string());
            }
        }

        if let Err(e) = self.ctx.kv.cas_json(&path, Some(version), &current).await {
            warn!(task_id = %task.id, error = %e, "Cannot record task outcome");
        }
    }
}
