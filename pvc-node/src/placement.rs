//! VM placement: target selection and the per-node placement controller.
//!
//! The controller reconciles the actual state of this node's domains to
//! the desired state in the VM table: start, stop, graceful shutdown,
//! restart, live and cold migration, unmigrate, move, and node drain.
//! Migrations are serialized per VM by a CAS on the record's `migrating`
//! field and per node by a local slot; contenders queue as tasks and are
//! retried when the slot frees.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use pvc_common::ClusterError;
use pvc_drivers::{DomainRuntimeState, DomainSpec, VM_MIGRATE_DEADLINE, VM_START_DEADLINE};
use pvc_kv::{KvStore, KvStoreExt};
use pvc_schema::{
    paths, DaemonState, DomainState, MigrationMethod, NodeAddresses, NodeRecord, TargetSelector,
    TaskRecord, TaskRequest, TaskStatus, VmRecord, VmState,
};

use crate::console_log::ConsoleRing;
use crate::daemon::Context;
use crate::dispatch::Event;
use crate::state::NodeState;

// =============================================================================
// TARGET SELECTION
// =============================================================================

/// Pick the best target node for a VM.
///
/// Candidates must be running, ready for domains, and allowed by the VM's
/// node limit. Ranking follows the VM's selector (falling back to the
/// cluster default); ties break deterministically by node name ascending.
pub fn select_target(
    vm: &VmRecord,
    default_selector: TargetSelector,
    nodes: &[(String, NodeRecord)],
    vms: &[VmRecord],
    exclude: &[&str],
) -> Result<String, ClusterError> {
    let selector = vm.selector_or(default_selector);

    let mut candidates: Vec<(&str, &NodeRecord)> = nodes
        .iter()
        .filter(|(name, record)| {
            record.daemon_state == DaemonState::Run
                && record.domain_state == DomainState::Ready
                && vm.node_allowed(name)
                && !exclude.contains(&name.as_str())
        })
        .map(|(name, record)| (name.as_str(), record))
        .collect();

    if candidates.is_empty() {
        return Err(ClusterError::Invalid(format!(
            "NoEligibleTarget: no ready node accepts VM {}",
            vm.name
        )));
    }

    // Name order first so that equal scores resolve to the smallest name.
    candidates.sort_by_key(|(name, _)| *name);

    let score = |name: &str, record: &NodeRecord| -> f64 {
        match selector {
            TargetSelector::Mem => record.mem_allocated as f64,
            TargetSelector::Memprov => {
                let provisioned: u64 = vms
                    .iter()
                    .filter(|v| v.node == name && v.state != VmState::Start)
                    .map(|v| v.memory_mib)
                    .sum();
                (record.mem_allocated + provisioned) as f64
            }
            TargetSelector::Load => record.load,
            TargetSelector::Vcpus => record.vcpus_allocated as f64,
            TargetSelector::Vms => record.vm_count as f64,
        }
    };

    let mut best: Option<(&str, f64)> = None;
    for (name, record) in candidates {
        let key = score(name, record);
        match best {
            Some((_, best_key)) if key >= best_key => {}
            _ => best = Some((name, key)),
        }
    }

    Ok(best.expect("candidate set is non-empty").0.to_string())
}

/// How a completed transfer treats `previous_node`.
#[derive(Debug, Clone, Copy)]
enum PrevPolicy {
    /// Trackable migrate: record the source for a later unmigrate.
    Track { force: bool },
    /// Move: no tracking.
    Clear,
    /// Record-driven migration: the writer already set the fields.
    Keep,
    /// Unmigrate: clear the breadcrumb unless the migrate was forced.
    Unmigrate { was_forced: bool },
}

// =============================================================================
// PLACEMENT CONTROLLER
// =============================================================================

pub struct PlacementController {
    ctx: Arc<Context>,
    state: Arc<NodeState>,
    consoles: StdMutex<HashMap<String, ConsoleRing>>,
    /// Local migration slot: one transfer in or out of this node at a time.
    migration_slot: AsyncMutex<()>,
    /// One drain at a time; the flush task and the reconcile loop can
    /// both ask for one.
    drain_lock: AsyncMutex<()>,
}

impl PlacementController {
    pub fn new(ctx: Arc<Context>, state: Arc<NodeState>) -> Self {
        Self {
            ctx,
            state,
            consoles: StdMutex::new(HashMap::new()),
            migration_slot: AsyncMutex::new(()),
            drain_lock: AsyncMutex::new(()),
        }
    }

    fn name(&self) -> &str {
        &self.ctx.node_name
    }

    /// Controller loop: reconcile on domain changes and ticks.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<Event>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("VM placement controller running");
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(Event::Domain(_)) | Some(Event::Tick) | Some(Event::Availability(true)) => {
                            self.reconcile_all().await;
                        }
                        Some(_) => {}
                        None => {
                            warn!("VM placement controller stopping: event channel closed");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("VM placement controller shutting down");
                    break;
                }
            }
        }
    }

    /// One full reconciliation pass over the VM table.
    pub async fn reconcile_all(&self) {
        if !*self.ctx.kv.availability().borrow() {
            return;
        }

        let vms = match self.ctx.kv.list_json::<VmRecord>(paths::DOMAINS).await {
            Ok(vms) => vms,
            Err(e) => {
                debug!(error = %e, "Cannot list VM table");
                return;
            }
        };

        for (path, vm, version) in &vms {
            let Some(uuid) = paths::domain_uuid(path).map(String::from) else {
                continue;
            };

            // A record-driven migration: the API moved `node` and left the
            // breadcrumb; this controller on the source executes it.
            if vm.state == VmState::Migrate
                && vm.previous_node.as_deref() == Some(self.name())
                && vm.node != self.name()
                && vm.migrating.is_none()
            {
                if let Err(e) = self.run_record_migration(&uuid, vm, *version).await {
                    warn!(uuid = %uuid, error = %e, "Record-driven migration failed");
                }
                continue;
            }

            if vm.node == self.name() && vm.migrating.is_none() {
                self.reconcile_local(&uuid, vm).await;
            }
        }

        self.capture_consoles(&vms).await;

        if self.state.snapshot().domain_state == DomainState::Flushing {
            // Resume a drain interrupted by a daemon restart.
            if let Err(e) = self.drain().await {
                warn!(error = %e, "Node drain did not complete");
            }
        }
    }

    /// Converge one owned VM to its desired state.
    async fn reconcile_local(&self, uuid: &str, vm: &VmRecord) {
        let actual = self
            .ctx
            .hypervisor
            .state(uuid)
            .await
            .unwrap_or(DomainRuntimeState::Unknown);
        let running = actual == DomainRuntimeState::Running;

        match vm.state {
            VmState::Start if !running => {
                self.start_vm(uuid, vm).await;
            }
            VmState::Stop | VmState::Disable if running => {
                self.stop_vm(uuid, vm, false).await;
            }
            VmState::Shutdown => {
                if running {
                    self.stop_vm(uuid, vm, true).await;
                }
                self.write_state(uuid, VmState::Stop).await;
                self.flush_console(uuid).await;
            }
            VmState::Restart => {
                if running {
                    if let Err(e) = self.ctx.hypervisor.stop(uuid).await {
                        warn!(uuid = %uuid, error = %e, "Restart: stop failed");
                        return;
                    }
                }
                self.start_vm(uuid, vm).await;
                self.write_state(uuid, VmState::Start).await;
            }
            VmState::Unmigrate => {
                if let Err(e) = self.unmigrate_vm(uuid).await {
                    warn!(uuid = %uuid, error = %e, "Unmigrate failed");
                }
            }
            _ => {}
        }
    }

    /// Acquire storage locks and start the domain; a failure marks the VM
    /// failed and emits an error task.
    async fn start_vm(&self, uuid: &str, vm: &VmRecord) {
        if let Err(e) = self.lock_volumes(vm).await {
            self.fail_vm(uuid, &vm.name, &format!("storage lock: {}", e))
                .await;
            return;
        }

        let spec = DomainSpec::new(uuid, &vm.name, &vm.definition);
        match timeout(VM_START_DEADLINE, self.ctx.hypervisor.start(&spec)).await {
            Ok(Ok(())) => {
                info!(uuid = %uuid, name = %vm.name, "VM started");
            }
            Ok(Err(e)) => {
                self.fail_vm(uuid, &vm.name, &format!("start failed: {}", e))
                    .await;
            }
            Err(_) => {
                self.fail_vm(uuid, &vm.name, "start timed out").await;
            }
        }
    }

    /// Stop a domain, gracefully when asked, and release its locks.
    async fn stop_vm(&self, uuid: &str, vm: &VmRecord, graceful: bool) {
        if graceful {
            let grace = self.ctx.config.vm_shutdown_timeout();
            match self.ctx.hypervisor.shutdown(uuid, grace).await {
                Ok(true) => {
                    info!(uuid = %uuid, "VM shut down gracefully");
                }
                Ok(false) => {
                    warn!(uuid = %uuid, "Guest ignored shutdown, forcing stop");
                    if let Err(e) = self.ctx.hypervisor.stop(uuid).await {
                        error!(uuid = %uuid, error = %e, "Forced stop failed");
                        return;
                    }
                }
                Err(e) => {
                    warn!(uuid = %uuid, error = %e, "Shutdown failed, forcing stop");
                    if let Err(e) = self.ctx.hypervisor.stop(uuid).await {
                        error!(uuid = %uuid, error = %e, "Forced stop failed");
                        return;
                    }
                }
            }
        } else if let Err(e) = self.ctx.hypervisor.stop(uuid).await {
            error!(uuid = %uuid, error = %e, "Stop failed");
            return;
        }

        self.unlock_volumes(vm).await;
    }

    // =========================================================================
    // MIGRATION
    // =========================================================================

    /// Trackable migrate (or move, with `track = false`) of an owned VM.
    /// Returns the chosen target.
    pub async fn migrate_vm(
        &self,
        uuid: &str,
        target: Option<String>,
        force: bool,
        track: bool,
    ) -> Result<String, ClusterError> {
        let _slot = self.migration_slot.lock().await;
        let (vm, version) = self.get_vm(uuid).await?;

        if vm.node != self.name() {
            return Err(ClusterError::Invalid(format!(
                "VM {} is owned by {}, not {}",
                vm.name,
                vm.node,
                self.name()
            )));
        }
        if vm.migrating.is_some() {
            return Err(ClusterError::Transient(format!(
                "VM {} already has a migration in flight",
                vm.name
            )));
        }

        let (nodes, all_vms) = self.cluster_snapshot().await?;
        let target = match target {
            Some(target) => target,
            None => select_target(
                &vm,
                self.ctx.config.migration.target_selector,
                &nodes,
                &all_vms,
                &[self.name()],
            )?,
        };
        if target == self.name() {
            return Err(ClusterError::Invalid(format!(
                "VM {} already runs on {}",
                vm.name, target
            )));
        }
        self.check_target(&vm, &target, &nodes)?;
        self.check_slot_free(&all_vms, &target)?;

        let resume = Self::resume_state(vm.state);
        let claimed = self.claim_migration(uuid, &vm, version, &target).await?;
        let policy = if track {
            PrevPolicy::Track { force }
        } else {
            PrevPolicy::Clear
        };
        self.transfer(uuid, claimed, &target, resume, policy).await
    }

    /// Reverse a tracked migration using the stored previous node.
    pub async fn unmigrate_vm(&self, uuid: &str) -> Result<String, ClusterError> {
        let _slot = self.migration_slot.lock().await;
        let (vm, version) = self.get_vm(uuid).await?;

        if vm.node != self.name() {
            return Err(ClusterError::Invalid(format!(
                "VM {} is owned by {}, not {}",
                vm.name,
                vm.node,
                self.name()
            )));
        }
        let previous = vm.previous_node.clone().ok_or_else(|| {
            ClusterError::Invalid(format!("VM {} has no previous node to return to", vm.name))
        })?;
        if vm.migrating.is_some() {
            return Err(ClusterError::Transient(format!(
                "VM {} already has a migration in flight",
                vm.name
            )));
        }

        let (nodes, all_vms) = self.cluster_snapshot().await?;
        // Fall back to the selector when the previous node is unhealthy.
        let target = if self.node_eligible(&vm, &previous, &nodes) {
            previous
        } else {
            warn!(
                uuid = %uuid,
                previous = %previous,
                "Previous node is not eligible, selecting another target"
            );
            select_target(
                &vm,
                self.ctx.config.migration.target_selector,
                &nodes,
                &all_vms,
                &[self.name()],
            )?
        };
        self.check_slot_free(&all_vms, &target)?;

        let was_forced = vm.migration_forced;
        let resume = Self::resume_state(vm.state);
        let claimed = self.claim_migration(uuid, &vm, version, &target).await?;
        self.transfer(
            uuid,
            claimed,
            &target,
            resume,
            PrevPolicy::Unmigrate { was_forced },
        )
        .await
    }

    /// Execute a migration the API requested by rewriting the record
    /// directly (`state = migrate`, `node` = target, breadcrumb set).
    async fn run_record_migration(
        &self,
        uuid: &str,
        vm: &VmRecord,
        version: u64,
    ) -> Result<String, ClusterError> {
        let _slot = self.migration_slot.lock().await;
        let target = vm.node.clone();
        let (nodes, all_vms) = self.cluster_snapshot().await?;
        self.check_target(vm, &target, &nodes)?;
        self.check_slot_free(&all_vms, &target)?;

        let claimed = self.claim_migration(uuid, vm, version, &target).await?;
        self.transfer(uuid, claimed, &target, VmState::Start, PrevPolicy::Keep)
            .await
    }

    /// CAS the `migrating` claim (a `source:target` token) onto the
    /// record. A mismatch means another writer got there first.
    async fn claim_migration(
        &self,
        uuid: &str,
        vm: &VmRecord,
        version: u64,
        target: &str,
    ) -> Result<(VmRecord, u64), ClusterError> {
        let mut claimed = vm.clone();
        claimed.migrating = Some(format!("{}:{}", self.name(), target));
        claimed.state = VmState::Migrate;
        let version = self
            .ctx
            .kv
            .cas_json(&paths::domain(uuid), Some(version), &claimed)
            .await?;
        Ok((claimed, version))
    }

    /// The desired state a VM returns to once its transfer finalizes: a
    /// powered-off VM moves powered off, everything else resumes running.
    fn resume_state(before: VmState) -> VmState {
        match before {
            VmState::Stop | VmState::Disable => before,
            _ => VmState::Start,
        }
    }

    /// Move the domain to `target` and finalize the record.
    async fn transfer(
        &self,
        uuid: &str,
        claimed: (VmRecord, u64),
        target: &str,
        resume: VmState,
        policy: PrevPolicy,
    ) -> Result<String, ClusterError> {
        let (vm, version) = claimed;
        let live = vm.meta.migration_method == MigrationMethod::Live;
        let running = self
            .ctx
            .hypervisor
            .state(uuid)
            .await
            .map(|s| s == DomainRuntimeState::Running)
            .unwrap_or(false);

        if running {
            let moved = if live {
                let addr = self.cluster_address(target).await;
                timeout(
                    VM_MIGRATE_DEADLINE,
                    self.ctx.hypervisor.migrate(uuid, &addr, true),
                )
                .await
                .map_err(|_| ClusterError::Transient("live migration timed out".into()))
                .and_then(|r| {
                    r.map_err(|e| ClusterError::Transient(format!("live migration: {}", e)))
                })
            } else {
                // The guest cannot survive live migration: cold move.
                self.stop_vm(uuid, &vm, true).await;
                Ok(())
            };

            if let Err(e) = moved {
                self.rollback_migration(uuid, &vm, version).await;
                return Err(e);
            }
            self.unlock_volumes(&vm).await;
        }

        let mut done = vm.clone();
        done.node = target.to_string();
        done.state = resume;
        done.migrating = None;
        match policy {
            PrevPolicy::Track { force } => {
                if force {
                    if done.previous_node.is_none() {
                        done.previous_node = Some(self.name().to_string());
                    }
                    done.migration_forced = true;
                } else {
                    done.previous_node = Some(self.name().to_string());
                    done.migration_forced = false;
                }
            }
            PrevPolicy::Clear => {
                done.previous_node = None;
                done.migration_forced = false;
            }
            PrevPolicy::Keep => {}
            PrevPolicy::Unmigrate { was_forced } => {
                if !was_forced {
                    done.previous_node = None;
                }
                done.migration_forced = false;
            }
        }

        self.ctx
            .kv
            .cas_json(&paths::domain(uuid), Some(version), &done)
            .await?;
        info!(
            uuid = %uuid,
            name = %done.name,
            target = %target,
            live = live,
            "Migration complete"
        );
        self.flush_console(uuid).await;
        Ok(target.to_string())
    }

    /// Undo a claim after a failed transfer so the VM keeps running here.
    async fn rollback_migration(&self, uuid: &str, vm: &VmRecord, version: u64) {
        let mut rollback = vm.clone();
        rollback.migrating = None;
        rollback.state = VmState::Start;
        if let Err(e) = self
            .ctx
            .kv
            .cas_json(&paths::domain(uuid), Some(version), &rollback)
            .await
        {
            warn!(uuid = %uuid, error = %e, "Migration rollback write failed");
        }
    }

    // =========================================================================
    // NODE DRAIN
    // =========================================================================

    /// Drain every running VM off this node, then mark it flushed.
    ///
    /// A VM no ready node will take is stopped rather than blocking the
    /// drain; unless its migration method already implies a powered-off
    /// move, an error task records the decision.
    pub async fn drain(&self) -> Result<(), ClusterError> {
        let _guard = self.drain_lock.lock().await;
        info!("Draining VMs off this node");

        loop {
            let vms = self.ctx.kv.list_json::<VmRecord>(paths::DOMAINS).await?;
            let owned_running: Vec<(String, VmRecord)> = vms
                .iter()
                .filter(|(path, vm, _)| {
                    paths::domain_uuid(path).is_some()
                        && vm.node == self.name()
                        && vm.state == VmState::Start
                })
                .map(|(path, vm, _)| {
                    (paths::domain_uuid(path).unwrap().to_string(), vm.clone())
                })
                .collect();

            if owned_running.is_empty() {
                break;
            }

            for (uuid, vm) in owned_running {
                match self.migrate_vm(&uuid, None, false, true).await {
                    Ok(target) => {
                        info!(uuid = %uuid, target = %target, "Drained VM");
                    }
                    Err(ClusterError::Invalid(msg)) if msg.starts_with("NoEligibleTarget") => {
                        warn!(uuid = %uuid, "No eligible target during drain, stopping VM");
                        self.stop_vm(&uuid, &vm, vm.meta.migration_method == MigrationMethod::Shutdown)
                            .await;
                        self.write_state(&uuid, VmState::Stop).await;
                        if vm.meta.migration_method != MigrationMethod::Shutdown {
                            self.emit_error_task(
                                &vm.name,
                                &format!(
                                    "VM {} could not be placed during drain and was stopped",
                                    vm.name
                                ),
                            )
                            .await;
                        }
                    }
                    Err(ClusterError::Transient(msg)) | Err(ClusterError::Conflict(msg)) => {
                        debug!(uuid = %uuid, msg = %msg, "Drain migration will retry");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    Err(e) => {
                        error!(uuid = %uuid, error = %e, "Drain migration failed, stopping VM");
                        self.stop_vm(&uuid, &vm, true).await;
                        self.write_state(&uuid, VmState::Stop).await;
                        self.emit_error_task(
                            &vm.name,
                            &format!("VM {} failed to migrate during drain: {}", vm.name, e),
                        )
                        .await;
                    }
                }
            }
        }

        self.state
            .transition_domain(self.ctx.kv.as_ref(), DomainState::Flushed)
            .await?;
        info!("Node drain complete");
        Ok(())
    }

    // =========================================================================
    // CONSOLE CAPTURE
    // =========================================================================

    /// Drain console output for owned domains into their rings and flush
    /// coalesced batches to the KV store.
    async fn capture_consoles(&self, vms: &[(String, VmRecord, u64)]) {
        for (path, vm, _) in vms {
            let Some(uuid) = paths::domain_uuid(path) else {
                continue;
            };
            if vm.node != self.name() {
                continue;
            }

            let running = matches!(
                self.ctx.hypervisor.state(uuid).await,
                Ok(DomainRuntimeState::Running)
            );
            if !running {
                continue;
            }

            let lines = match self.ctx.hypervisor.drain_console(uuid).await {
                Ok(lines) => lines,
                Err(_) => continue,
            };

            let snapshot = {
                let mut consoles = self.consoles.lock().unwrap();
                let ring = consoles.entry(uuid.to_string()).or_insert_with(|| {
                    ConsoleRing::new(self.ctx.config.logging.console_log_lines)
                });
                ring.push_lines(lines);
                if ring.flush_due() {
                    Some(ring.flush())
                } else {
                    None
                }
            };

            if let Some(lines) = snapshot {
                let _ = self
                    .ctx
                    .kv
                    .put_json(&paths::domain_console(uuid), &lines)
                    .await;
            }
        }
    }

    /// Force out any pending console lines, on VM state changes.
    async fn flush_console(&self, uuid: &str) {
        let snapshot = {
            let mut consoles = self.consoles.lock().unwrap();
            consoles
                .get_mut(uuid)
                .filter(|ring| ring.has_pending())
                .map(|ring| ring.flush())
        };
        if let Some(lines) = snapshot {
            let _ = self
                .ctx
                .kv
                .put_json(&paths::domain_console(uuid), &lines)
                .await;
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    async fn get_vm(&self, uuid: &str) -> Result<(VmRecord, u64), ClusterError> {
        self.ctx
            .kv
            .get_json::<VmRecord>(&paths::domain(uuid))
            .await?
            .ok_or_else(|| ClusterError::Invalid(format!("unknown VM {}", uuid)))
    }

    /// Node and VM tables in one read, for placement decisions.
    async fn cluster_snapshot(
        &self,
    ) -> Result<(Vec<(String, NodeRecord)>, Vec<VmRecord>), ClusterError> {
        let nodes = self
            .ctx
            .kv
            .list_json::<NodeRecord>(paths::NODES)
            .await?
            .into_iter()
            .filter_map(|(path, record, _)| {
                paths::node_name(&path).map(|name| (name.to_string(), record))
            })
            .collect();
        let vms = self
            .ctx
            .kv
            .list_json::<VmRecord>(paths::DOMAINS)
            .await?
            .into_iter()
            .filter(|(path, _, _)| paths::domain_uuid(path).is_some())
            .map(|(_, vm, _)| vm)
            .collect();
        Ok((nodes, vms))
    }

    fn node_eligible(&self, vm: &VmRecord, name: &str, nodes: &[(String, NodeRecord)]) -> bool {
        nodes.iter().any(|(n, record)| {
            n == name
                && record.daemon_state == DaemonState::Run
                && record.domain_state == DomainState::Ready
                && vm.node_allowed(name)
        })
    }

    fn check_target(
        &self,
        vm: &VmRecord,
        target: &str,
        nodes: &[(String, NodeRecord)],
    ) -> Result<(), ClusterError> {
        if self.node_eligible(vm, target, nodes) {
            Ok(())
        } else {
            Err(ClusterError::Invalid(format!(
                "target {} is not eligible for VM {}",
                target, vm.name
            )))
        }
    }

    /// Backpressure: one active migration in or out of a node. The
    /// in-flight `source:target` tokens say which nodes are busy;
    /// contending requests surface as transient errors and are retried
    /// as tasks.
    fn check_slot_free(&self, vms: &[VmRecord], target: &str) -> Result<(), ClusterError> {
        for vm in vms {
            if let Some(token) = &vm.migrating {
                let busy = token
                    .split(':')
                    .any(|node| node == self.name() || node == target);
                if busy {
                    return Err(ClusterError::Transient(format!(
                        "migration slot busy ({} is moving)",
                        vm.name
                    )));
                }
            }
        }
        Ok(())
    }

    async fn cluster_address(&self, node: &str) -> String {
        match self
            .ctx
            .kv
            .get_json::<NodeAddresses>(&paths::node_addrs(node))
            .await
        {
            Ok(Some((addrs, _))) if !addrs.cluster.is_empty() => addrs.cluster,
            _ => node.to_string(),
        }
    }

    async fn lock_volumes(&self, vm: &VmRecord) -> Result<(), ClusterError> {
        for volume in &vm.volumes {
            self.ctx
                .storage
                .lock_volume(&volume.pool, &volume.name, self.name())
                .await
                .map_err(|e| ClusterError::Invalid(e.to_string()))?;
            self.mirror_lock(&volume.pool, &volume.name, Some(self.name().to_string()))
                .await;
        }
        Ok(())
    }

    async fn unlock_volumes(&self, vm: &VmRecord) {
        for volume in &vm.volumes {
            if let Err(e) = self
                .ctx
                .storage
                .unlock_volume(&volume.pool, &volume.name, self.name())
                .await
            {
                warn!(
                    volume = %format!("{}/{}", volume.pool, volume.name),
                    error = %e,
                    "Volume unlock failed"
                );
                continue;
            }
            self.mirror_lock(&volume.pool, &volume.name, None).await;
        }
    }

    /// Mirror the driver's lock state into the volume record.
    async fn mirror_lock(&self, pool: &str, name: &str, holder: Option<String>) {
        let path = paths::volume(pool, name);
        if let Ok(Some((mut record, _))) = self
            .ctx
            .kv
            .get_json::<pvc_schema::VolumeRecord>(&path)
            .await
        {
            record.lock_holder = holder;
            let _ = self.ctx.kv.put_json(&path, &record).await;
        }
    }

    /// Rewrite only the state field of a record, tolerating version races.
    async fn write_state(&self, uuid: &str, state: VmState) {
        let path = paths::domain(uuid);
        let Ok(Some((mut record, current))) = self.ctx.kv.get_json::<VmRecord>(&path).await else {
            return;
        };
        if record.state == state {
            return;
        }
        record.state = state;
        if let Err(e) = self.ctx.kv.cas_json(&path, Some(current), &record).await {
            debug!(uuid = %uuid, error = %e, "State write lost a race, will reconcile");
        }
    }

    async fn fail_vm(&self, uuid: &str, name: &str, message: &str) {
        error!(uuid = %uuid, name = %name, message = %message, "VM failed");
        let path = paths::domain(uuid);
        if let Ok(Some((mut record, version))) = self.ctx.kv.get_json::<VmRecord>(&path).await {
            record.state = VmState::Fail;
            let _ = self.ctx.kv.cas_json(&path, Some(version), &record).await;
        }
        self.emit_error_task(name, message).await;
    }

    async fn emit_error_task(&self, subject: &str, message: &str) {
        let mut task = TaskRecord::new(TaskRequest::ErrorReport {
            subject: subject.to_string(),
        });
        task.claimed_by = Some(self.name().to_string());
        task.advance(TaskStatus::Failed, message);
        let _ = self.ctx.kv.put_json(&paths::task(&task.id), &task).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, mem_allocated: u64, load: f64, vcpus: u32, vms: u32) -> (String, NodeRecord) {
        let mut record = NodeRecord::new(pvc_schema::NodeRole::Hypervisor);
        record.daemon_state = DaemonState::Run;
        record.domain_state = DomainState::Ready;
        record.mem_allocated = mem_allocated;
        record.load = load;
        record.vcpus_allocated = vcpus;
        record.vm_count = vms;
        (name.to_string(), record)
    }

    #[test]
    fn test_selector_mem_picks_least_allocated() {
        let vm = VmRecord::new("v1", "hv1");
        let nodes = vec![
            node("hv1", 4096, 0.5, 4, 2),
            node("hv2", 1024, 3.0, 8, 5),
            node("hv3", 2048, 0.1, 1, 1),
        ];
        let target = select_target(&vm, TargetSelector::Mem, &nodes, &[], &["hv1"]).unwrap();
        assert_eq!(target, "hv2");
    }

    #[test]
    fn test_selector_tie_breaks_by_name() {
        let vm = VmRecord::new("v1", "hv9");
        let nodes = vec![
            node("hv3", 1024, 0.0, 0, 0),
            node("hv1", 1024, 0.0, 0, 0),
            node("hv2", 1024, 0.0, 0, 0),
        ];
        // All scores equal: smallest name wins, every time.
        for _ in 0..10 {
            let target = select_target(&vm, TargetSelector::Mem, &nodes, &[], &[]).unwrap();
            assert_eq!(target, "hv1");
        }
    }

    #[test]
    fn test_selector_honors_node_limit() {
        let mut vm = VmRecord::new("v1", "hv1");
        vm.meta.node_limit = vec!["hv3".to_string()];
        let nodes = vec![
            node("hv2", 0, 0.0, 0, 0),
            node("hv3", 9999, 9.0, 99, 99),
        ];
        let target = select_target(&vm, TargetSelector::Mem, &nodes, &[], &[]).unwrap();
        assert_eq!(target, "hv3");
    }

    #[test]
    fn test_selector_memprov_counts_powered_off_vms() {
        let vm = VmRecord::new("v1", "hv9");
        let nodes = vec![node("hv1", 1000, 0.0, 0, 0), node("hv2", 1500, 0.0, 0, 0)];
        // hv1 carries a large provisioned-but-stopped VM.
        let parked = VmRecord::new("parked", "hv1").with_memory(4096);
        let vms = vec![parked];

        assert_eq!(
            select_target(&vm, TargetSelector::Mem, &nodes, &vms, &[]).unwrap(),
            "hv1"
        );
        assert_eq!(
            select_target(&vm, TargetSelector::Memprov, &nodes, &vms, &[]).unwrap(),
            "hv2"
        );
    }

    #[test]
    fn test_selector_skips_not_ready_nodes() {
        let vm = VmRecord::new("v1", "hv9");
        let mut flushed = node("hv1", 0, 0.0, 0, 0);
        flushed.1.domain_state = DomainState::Flushed;
        let mut dead = node("hv2", 0, 0.0, 0, 0);
        dead.1.daemon_state = DaemonState::Dead;
        let nodes = vec![flushed, dead, node("hv3", 5000, 0.0, 0, 0)];

        assert_eq!(
            select_target(&vm, TargetSelector::Mem, &nodes, &[], &[]).unwrap(),
            "hv3"
        );
    }

    #[test]
    fn test_selector_empty_set_is_an_error() {
        let vm = VmRecord::new("v1", "hv1");
        let err = select_target(&vm, TargetSelector::Mem, &[], &[], &[]).unwrap_err();
        match err {
            ClusterError::Invalid(msg) => assert!(msg.starts_with("NoEligibleTarget")),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }
}
