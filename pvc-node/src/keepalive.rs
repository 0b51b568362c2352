//! Keepalive engine.
//!
//! One ticker per daemon. Each tick publishes this node's liveness and
//! telemetry, then evaluates every peer's freshness. Peer staleness is
//! judged from *locally observed* change times of their keepalive
//! timestamps, never from the timestamp values themselves, so clock skew
//! between nodes cannot produce false fences.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use pvc_kv::KvStoreExt;
use pvc_schema::{paths, DaemonState, NodeRecord, VmRecord, VmState};
use pvc_telemetry::TelemetryCollector;

use crate::daemon::Context;
use crate::health::{PluginHost, PLUGIN_BUDGET};
use crate::state::NodeState;

/// What this node has locally observed about one peer.
struct PeerObservation {
    /// The peer's last published keepalive_ts value.
    last_ts: i64,
    /// When *we* saw that value change.
    seen_at: Instant,
}

pub struct KeepaliveEngine {
    ctx: Arc<Context>,
    state: Arc<NodeState>,
    telemetry: TelemetryCollector,
    plugins: Arc<PluginHost>,
    /// Confirmed-dead peers are handed to the fence controller here.
    fence_tx: mpsc::Sender<String>,
    primary_rx: watch::Receiver<bool>,
    observed: HashMap<String, PeerObservation>,
    suspected: HashSet<String>,
    reported_dead: HashSet<String>,
    /// Consecutive failed self-publishes, for the suicide check.
    missed_publishes: u32,
    /// The reset has been requested; the host is going down.
    suicided: bool,
}

impl KeepaliveEngine {
    pub fn new(
        ctx: Arc<Context>,
        state: Arc<NodeState>,
        plugins: Arc<PluginHost>,
        fence_tx: mpsc::Sender<String>,
        primary_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            state,
            telemetry: TelemetryCollector::new(),
            plugins,
            fence_tx,
            primary_rx,
            observed: HashMap::new(),
            suspected: HashSet::new(),
            reported_dead: HashSet::new(),
            missed_publishes: 0,
            suicided: false,
        }
    }

    /// Run until shutdown. The tick itself never blocks on another
    /// controller; plugin runs are bounded by [`PLUGIN_BUDGET`].
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let interval = self.ctx.config.keepalive_interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let facts = self.telemetry.facts();
        info!(
            interval_secs = interval.as_secs(),
            hostname = %facts.hostname,
            os = %facts.os,
            kernel = %facts.kernel,
            cpus = facts.cpu_count,
            "Keepalive engine running"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    info!("Keepalive engine shutting down");
                    break;
                }
            }
        }
    }

    async fn tick(&mut self) {
        self.publish_self().await;
        self.suicide_check().await;
        self.evaluate_peers().await;
    }

    /// Publish this node's record: liveness timestamp, telemetry, VM
    /// allocation, and the health plugin pass.
    async fn publish_self(&mut self) {
        let snapshot = self.state.snapshot();
        let sample = self.telemetry.sample();

        // Allocation accounting over the VM table.
        let (mut mem_allocated, mut vcpus_allocated, mut vm_count) = (0u64, 0u32, 0u32);
        match self.ctx.kv.list_json::<VmRecord>(paths::DOMAINS).await {
            Ok(vms) => {
                for (_, vm, _) in vms {
                    if vm.node == self.ctx.node_name {
                        vm_count += 1;
                        if vm.state == VmState::Start {
                            mem_allocated += vm.memory_mib;
                            vcpus_allocated += vm.vcpus;
                        }
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "Cannot read VM table for allocation stats");
            }
        }

        let plugin_results = self
            .plugins
            .run_all(PLUGIN_BUDGET, snapshot.coordinator_state)
            .await;
        let health_delta = PluginHost::health_delta(&plugin_results);

        let record = NodeRecord {
            role: self.state.role(),
            daemon_state: snapshot.daemon_state,
            coordinator_state: snapshot.coordinator_state,
            domain_state: snapshot.domain_state,
            keepalive_ts: Utc::now().timestamp_millis(),
            load: sample.load_1min,
            mem_total: sample.mem_total_mib,
            mem_used: sample.mem_used_mib,
            mem_allocated,
            vcpus_allocated,
            vm_count,
            health_delta,
            plugin_results,
        };

        let path = paths::node(&self.ctx.node_name);
        match self.ctx.kv.put_json(&path, &record).await {
            Ok(_) => {
                self.missed_publishes = 0;
            }
            Err(e) => {
                self.missed_publishes += 1;
                warn!(
                    error = %e,
                    missed = self.missed_publishes,
                    "Keepalive publish failed"
                );
            }
        }
    }

    /// With `suicide_intervals = 0` this is a no-op: no code path reboots
    /// the host. Otherwise, after the configured number of consecutive
    /// failed publishes, hard-reset through the management controller.
    async fn suicide_check(&mut self) {
        let intervals = self.ctx.config.fencing.suicide_intervals;
        if intervals == 0 || self.suicided {
            return;
        }
        if self.missed_publishes <= intervals {
            return;
        }

        error!(
            missed = self.missed_publishes,
            "Keepalive publishes are not landing; hard-resetting this host"
        );
        // One shot: the host reboots out from under us.
        self.suicided = true;
        let credentials = self.ctx.config.ipmi_credentials();
        if let Err(e) = self
            .ctx
            .fence
            .fence(&self.ctx.node_name, &credentials)
            .await
        {
            error!(error = %e, "Self-reset through management controller failed");
        }
    }

    /// Evaluate every peer's freshness against the locally observed
    /// change times.
    async fn evaluate_peers(&mut self) {
        let records = match self.ctx.kv.list_json::<NodeRecord>(paths::NODES).await {
            Ok(records) => records,
            Err(e) => {
                debug!(error = %e, "Cannot read node table for peer evaluation");
                return;
            }
        };

        let suspect_age = self.ctx.config.suspect_age();
        let dead_age = self.ctx.config.dead_age();
        let now = Instant::now();

        for (path, record, _) in records {
            let Some(name) = paths::node_name(&path) else {
                continue;
            };
            if name == self.ctx.node_name {
                continue;
            }

            let obs = self
                .observed
                .entry(name.to_string())
                .or_insert(PeerObservation {
                    last_ts: record.keepalive_ts,
                    seen_at: now,
                });
            if record.keepalive_ts != obs.last_ts {
                obs.last_ts = record.keepalive_ts;
                obs.seen_at = now;
            }

            // Only running peers are candidates for fencing; a node that
            // is stopped, dead, or fenced already has its fate recorded.
            if record.daemon_state != DaemonState::Run {
                self.suspected.remove(name);
                self.reported_dead.remove(name);
                continue;
            }

            let age = obs.seen_at.elapsed();
            if age >= dead_age {
                if self.reported_dead.insert(name.to_string()) {
                    warn!(
                        peer = name,
                        age_secs = age.as_secs(),
                        "Peer confirmed dead"
                    );
                    if *self.primary_rx.borrow() {
                        if let Err(e) = self.fence_tx.send(name.to_string()).await {
                            warn!(peer = name, error = %e, "Cannot hand peer to fencer");
                        }
                    }
                }
            } else if age >= suspect_age {
                if self.suspected.insert(name.to_string()) {
                    warn!(peer = name, age_secs = age.as_secs(), "Peer is suspect");
                }
            } else if self.suspected.remove(name) || self.reported_dead.remove(name) {
                info!(peer = name, "Peer recovered");
            }
        }
    }
}
