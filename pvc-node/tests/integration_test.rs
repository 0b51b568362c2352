//! Integration tests for the cluster coordination core.
//!
//! Each test stands up a small cluster of real daemons against one
//! in-memory KV backend and per-node mock drivers. The storage and fence
//! mocks are shared across nodes, like the replicated block store and the
//! management controllers they stand in for. Timing-sensitive scenarios
//! run under a paused clock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use pvc_drivers::{
    FenceDriver, HypervisorDriver, MockFence, MockHypervisor, MockNetwork, MockStorage,
    NetworkDriver, StorageDriver,
};
use pvc_kv::{KvStoreExt, MemoryKv};
use pvc_node::config::Config;
use pvc_node::health::{HealthPlugin, PluginResult};
use pvc_node::{Daemon, DriverSet};
use pvc_schema::{
    paths, CoordinatorState, DaemonState, DomainState, MigrationMethod, NodeRecord, TaskRecord,
    TaskRequest, TaskStatus, VmRecord, VmState,
};

// =============================================================================
// HARNESS
// =============================================================================

struct TestNode {
    daemon: Option<Daemon>,
    hypervisor: Arc<MockHypervisor>,
    network: Arc<MockNetwork>,
}

impl TestNode {
    fn kill(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.abort();
        }
        self.hypervisor.crash();
    }
}

fn test_config(name: &str, coordinators: &[&str]) -> Config {
    let mut config = Config::default();
    config.node.name = Some(name.to_string());
    config.cluster.coordinators = coordinators.iter().map(|c| c.to_string()).collect();
    config.timers.keepalive_interval = 1;
    config.fencing.fence_intervals = 3;
    config.fencing.ipmi.hostname = format!("{}-lom", name);
    config.fencing.ipmi.username = "admin".to_string();
    config.fencing.ipmi.password = "secret".to_string();
    config.plugin_directory = "/nonexistent/pvc-test-plugins".to_string();

    let host_octet: String = name.chars().filter(|c| c.is_ascii_digit()).collect();
    let host_octet = if host_octet.is_empty() { "9".to_string() } else { host_octet };
    let nets = &mut config.cluster.networks;
    nets.upstream.device = "eth0".to_string();
    nets.upstream.floating_ip = "192.0.2.100/24".to_string();
    nets.cluster.device = "eth1".to_string();
    nets.cluster.address = format!("10.0.1.{}/24", host_octet);
    nets.cluster.floating_ip = "10.0.1.254/24".to_string();
    nets.storage.device = "eth2".to_string();
    nets.storage.address = format!("10.0.2.{}/24", host_octet);
    nets.storage.floating_ip = "10.0.2.254/24".to_string();
    config
}

async fn spawn_node(
    kv: &MemoryKv,
    storage: &Arc<MockStorage>,
    fence: &Arc<MockFence>,
    name: &str,
    coordinators: &[&str],
    tweak: impl FnOnce(&mut Config),
) -> TestNode {
    let mut config = test_config(name, coordinators);
    tweak(&mut config);

    let hypervisor = Arc::new(MockHypervisor::new());
    let network = Arc::new(MockNetwork::new());

    let daemon = Daemon::start(
        config,
        Arc::new(kv.clone()),
        DriverSet {
            hypervisor: Arc::clone(&hypervisor) as Arc<dyn HypervisorDriver>,
            network: Arc::clone(&network) as Arc<dyn NetworkDriver>,
            storage: Arc::clone(storage) as Arc<dyn StorageDriver>,
            fence: Arc::clone(fence) as Arc<dyn FenceDriver>,
            extra_plugins: Vec::new(),
        },
    )
    .await
    .expect("daemon should start");

    TestNode {
        daemon: Some(daemon),
        hypervisor,
        network,
    }
}

async fn get_vm(kv: &MemoryKv, uuid: &str) -> VmRecord {
    kv.get_json::<VmRecord>(&paths::domain(uuid))
        .await
        .unwrap()
        .expect("VM record should exist")
        .0
}

async fn get_node(kv: &MemoryKv, name: &str) -> NodeRecord {
    kv.get_json::<NodeRecord>(&paths::node(name))
        .await
        .unwrap()
        .expect("node record should exist")
        .0
}

async fn submit_task(kv: &MemoryKv, request: TaskRequest) -> String {
    let task = TaskRecord::new(request);
    kv.put_json(&paths::task(&task.id), &task).await.unwrap();
    task.id
}

async fn task_status(kv: &MemoryKv, id: &str) -> (TaskStatus, String) {
    let (task, _) = kv
        .get_json::<TaskRecord>(&paths::task(id))
        .await
        .unwrap()
        .expect("task record should exist");
    (task.status, task.message)
}

/// Invariant: at most one node advertises primary at any snapshot.
async fn count_primaries(kv: &MemoryKv) -> usize {
    kv.list_json::<NodeRecord>(paths::NODES)
        .await
        .unwrap()
        .iter()
        .filter(|(path, record, _)| {
            paths::node_name(path).is_some()
                && record.coordinator_state == CoordinatorState::Primary
        })
        .count()
}

async fn settle(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

// =============================================================================
// SCENARIOS
// =============================================================================

/// Scenario A: three healthy coordinators elect exactly one primary, the
/// primary binds the floating addresses, and killing it moves the lease
/// within the fence window.
#[tokio::test(start_paused = true)]
async fn test_primary_election_and_failover() {
    let kv = MemoryKv::new();
    let storage = Arc::new(MockStorage::new());
    let fence = Arc::new(MockFence::new());
    let coordinators = ["n1", "n2", "n3"];

    let mut n1 = spawn_node(&kv, &storage, &fence, "n1", &coordinators, |_| {}).await;
    let n2 = spawn_node(&kv, &storage, &fence, "n2", &coordinators, |_| {}).await;
    let n3 = spawn_node(&kv, &storage, &fence, "n3", &coordinators, |_| {}).await;

    settle(5).await;

    // Exactly one primary: the first coordinator to join the election.
    assert_eq!(count_primaries(&kv).await, 1);
    assert_eq!(
        get_node(&kv, "n1").await.coordinator_state,
        CoordinatorState::Primary
    );
    assert_eq!(
        get_node(&kv, "n2").await.coordinator_state,
        CoordinatorState::Secondary
    );

    // The primary holds the floating addresses: upstream, cluster, and
    // storage (networks are not collapsed here).
    assert_eq!(n1.network.bound_addresses().len(), 3);
    assert!(n2.network.bound_addresses().is_empty());

    // Kill the primary's daemon: the lease moves within the fence window.
    n1.kill();
    settle(4).await;

    assert_eq!(count_primaries(&kv).await, 1);
    assert_eq!(
        get_node(&kv, "n2").await.coordinator_state,
        CoordinatorState::Primary
    );
    assert_eq!(n2.network.bound_addresses().len(), 3);

    if let Some(daemon) = n3.daemon {
        daemon.shutdown().await;
    }
    if let Some(daemon) = n2.daemon {
        daemon.shutdown().await;
    }
}

/// Scenario B: a dead node is fenced by the primary and its VM restarts
/// on the surviving node with the least allocated memory, storage lock
/// cleared first.
#[tokio::test(start_paused = true)]
async fn test_node_fence_recovers_vms() {
    let kv = MemoryKv::new();
    let storage = Arc::new(MockStorage::new());
    let fence = Arc::new(MockFence::new());
    let coordinators = ["n1", "n2", "n3"];

    let n1 = spawn_node(&kv, &storage, &fence, "n1", &coordinators, |_| {}).await;
    let mut n2 = spawn_node(&kv, &storage, &fence, "n2", &coordinators, |_| {}).await;
    let n3 = spawn_node(&kv, &storage, &fence, "n3", &coordinators, |_| {}).await;

    storage
        .create_volume("vms", "v1_root", 10 << 30)
        .await
        .unwrap();

    // Ballast on n1 so the mem selector prefers n3.
    let ballast = VmRecord::new("ballast", "n1")
        .with_state(VmState::Start)
        .with_memory(8192);
    kv.put_json(&paths::domain("vm-ballast"), &ballast)
        .await
        .unwrap();

    let v1 = VmRecord::new("v1", "n2")
        .with_state(VmState::Start)
        .with_memory(2048)
        .with_volume("vms", "v1_root");
    kv.put_json(&paths::domain("vm-v1"), &v1).await.unwrap();

    settle(5).await;
    assert!(n2.hypervisor.is_running("vm-v1"));
    assert_eq!(
        storage.lock_holder("vms", "v1_root").await.unwrap(),
        Some("n2".to_string())
    );

    // n2's host dies.
    n2.kill();
    settle(20).await;

    // The primary fenced n2 through its management controller.
    assert_eq!(fence.fenced_nodes(), vec!["n2".to_string()]);
    let fenced = get_node(&kv, "n2").await;
    assert_eq!(fenced.daemon_state, DaemonState::Fenced);
    assert_eq!(fenced.coordinator_state, CoordinatorState::None);

    // v1 restarted on the least-loaded survivor, lock rebound to it.
    let v1 = get_vm(&kv, "vm-v1").await;
    assert_eq!(v1.node, "n3");
    assert_eq!(v1.state, VmState::Start);
    assert!(n3.hypervisor.is_running("vm-v1"));
    assert_eq!(
        storage.lock_holder("vms", "v1_root").await.unwrap(),
        Some("n3".to_string())
    );

    // Placement legality: the chosen node is running and ready.
    let target = get_node(&kv, "n3").await;
    assert_eq!(target.daemon_state, DaemonState::Run);
    assert_eq!(target.domain_state, DomainState::Ready);

    if let Some(daemon) = n1.daemon {
        daemon.shutdown().await;
    }
    if let Some(daemon) = n3.daemon {
        daemon.shutdown().await;
    }
}

/// Scenario C: graceful flush drains every running VM with breadcrumbs,
/// and unflush brings them home with the breadcrumbs cleared.
#[tokio::test(start_paused = true)]
async fn test_flush_and_unflush_round_trip() {
    let kv = MemoryKv::new();
    let storage = Arc::new(MockStorage::new());
    let fence = Arc::new(MockFence::new());
    let coordinators = ["n1", "n2", "n3"];

    let n1 = spawn_node(&kv, &storage, &fence, "n1", &coordinators, |_| {}).await;
    let n2 = spawn_node(&kv, &storage, &fence, "n2", &coordinators, |_| {}).await;
    let n3 = spawn_node(&kv, &storage, &fence, "n3", &coordinators, |_| {}).await;

    for (uuid, name) in [("vm-v1", "v1"), ("vm-v2", "v2")] {
        let vm = VmRecord::new(name, "n1").with_state(VmState::Start);
        kv.put_json(&paths::domain(uuid), &vm).await.unwrap();
    }
    settle(4).await;
    assert!(n1.hypervisor.is_running("vm-v1"));
    assert!(n1.hypervisor.is_running("vm-v2"));

    // Flush n1: both VMs live-migrate away.
    let flush = submit_task(&kv, TaskRequest::FlushNode { node: "n1".into() }).await;
    settle(10).await;

    assert_eq!(task_status(&kv, &flush).await.0, TaskStatus::Done);
    assert_eq!(
        get_node(&kv, "n1").await.domain_state,
        DomainState::Flushed
    );
    for uuid in ["vm-v1", "vm-v2"] {
        let vm = get_vm(&kv, uuid).await;
        assert_ne!(vm.node, "n1");
        assert_eq!(vm.state, VmState::Start);
        assert_eq!(vm.previous_node.as_deref(), Some("n1"));
        assert!(!n1.hypervisor.is_running(uuid));
    }

    // Flush completeness: nothing left running on n1.
    let leftovers = kv
        .list_json::<VmRecord>(paths::DOMAINS)
        .await
        .unwrap()
        .into_iter()
        .filter(|(_, vm, _)| vm.node == "n1" && vm.state == VmState::Start)
        .count();
    assert_eq!(leftovers, 0);

    // Unflush: the VMs come home and the breadcrumbs clear.
    let unflush = submit_task(&kv, TaskRequest::UnflushNode { node: "n1".into() }).await;
    settle(15).await;

    assert_eq!(task_status(&kv, &unflush).await.0, TaskStatus::Done);
    assert_eq!(get_node(&kv, "n1").await.domain_state, DomainState::Ready);
    for uuid in ["vm-v1", "vm-v2"] {
        let vm = get_vm(&kv, uuid).await;
        assert_eq!(vm.node, "n1");
        assert_eq!(vm.state, VmState::Start);
        assert_eq!(vm.previous_node, None);
        assert!(n1.hypervisor.is_running(uuid));
    }

    for node in [n1, n2, n3] {
        if let Some(daemon) = node.daemon {
            daemon.shutdown().await;
        }
    }
}

/// A VM whose node limit excludes every other node is stopped during a
/// flush, with an error task recording the decision.
#[tokio::test(start_paused = true)]
async fn test_flush_stops_unplaceable_vm() {
    let kv = MemoryKv::new();
    let storage = Arc::new(MockStorage::new());
    let fence = Arc::new(MockFence::new());
    let coordinators = ["n1", "n2"];

    let n1 = spawn_node(&kv, &storage, &fence, "n1", &coordinators, |_| {}).await;
    let n2 = spawn_node(&kv, &storage, &fence, "n2", &coordinators, |_| {}).await;

    let mut pinned = VmRecord::new("pinned", "n1").with_state(VmState::Start);
    pinned.meta.node_limit = vec!["n1".to_string()];
    kv.put_json(&paths::domain("vm-pinned"), &pinned)
        .await
        .unwrap();
    settle(4).await;
    assert!(n1.hypervisor.is_running("vm-pinned"));

    let flush = submit_task(&kv, TaskRequest::FlushNode { node: "n1".into() }).await;
    settle(10).await;

    assert_eq!(task_status(&kv, &flush).await.0, TaskStatus::Done);
    assert_eq!(
        get_node(&kv, "n1").await.domain_state,
        DomainState::Flushed
    );

    let vm = get_vm(&kv, "vm-pinned").await;
    assert_eq!(vm.node, "n1");
    assert_eq!(vm.state, VmState::Stop);
    assert!(!n1.hypervisor.is_running("vm-pinned"));

    // The decision is recorded as a failed error-report task.
    let error_reports = kv
        .list_json::<TaskRecord>(paths::TASKS)
        .await
        .unwrap()
        .into_iter()
        .filter(|(_, task, _)| {
            task.status == TaskStatus::Failed
                && matches!(&task.request, TaskRequest::ErrorReport { subject } if subject == "pinned")
        })
        .count();
    assert_eq!(error_reports, 1);

    for node in [n1, n2] {
        if let Some(daemon) = node.daemon {
            daemon.shutdown().await;
        }
    }
}

/// Scenario D: migrate, force-migrate, then unmigrate returns the VM to
/// its original node, with the breadcrumb surviving the forced hop.
#[tokio::test(start_paused = true)]
async fn test_migrate_force_migrate_unmigrate() {
    let kv = MemoryKv::new();
    let storage = Arc::new(MockStorage::new());
    let fence = Arc::new(MockFence::new());
    let coordinators = ["n1", "n2", "n3"];

    let n1 = spawn_node(&kv, &storage, &fence, "n1", &coordinators, |_| {}).await;
    let n2 = spawn_node(&kv, &storage, &fence, "n2", &coordinators, |_| {}).await;
    let n3 = spawn_node(&kv, &storage, &fence, "n3", &coordinators, |_| {}).await;

    let v1 = VmRecord::new("v1", "n1").with_state(VmState::Start);
    kv.put_json(&paths::domain("vm-v1"), &v1).await.unwrap();
    settle(4).await;
    assert!(n1.hypervisor.is_running("vm-v1"));

    // Tracked migrate to n2.
    let migrate = submit_task(
        &kv,
        TaskRequest::MigrateVm {
            uuid: "vm-v1".into(),
            target: Some("n2".into()),
            force: false,
        },
    )
    .await;
    settle(8).await;
    assert_eq!(task_status(&kv, &migrate).await.0, TaskStatus::Done);
    let vm = get_vm(&kv, "vm-v1").await;
    assert_eq!(vm.node, "n2");
    assert_eq!(vm.previous_node.as_deref(), Some("n1"));
    assert!(n2.hypervisor.is_running("vm-v1"));

    // Forced migrate to n3 leaves the original breadcrumb alone.
    let force = submit_task(
        &kv,
        TaskRequest::MigrateVm {
            uuid: "vm-v1".into(),
            target: Some("n3".into()),
            force: true,
        },
    )
    .await;
    settle(8).await;
    assert_eq!(task_status(&kv, &force).await.0, TaskStatus::Done);
    let vm = get_vm(&kv, "vm-v1").await;
    assert_eq!(vm.node, "n3");
    assert_eq!(vm.previous_node.as_deref(), Some("n1"));
    assert!(n3.hypervisor.is_running("vm-v1"));

    // Unmigrate returns it home.
    let unmigrate = submit_task(&kv, TaskRequest::UnmigrateVm { uuid: "vm-v1".into() }).await;
    settle(8).await;
    assert_eq!(task_status(&kv, &unmigrate).await.0, TaskStatus::Done);
    let vm = get_vm(&kv, "vm-v1").await;
    assert_eq!(vm.node, "n1");
    assert_eq!(vm.state, VmState::Start);
    assert!(n1.hypervisor.is_running("vm-v1"));

    for node in [n1, n2, n3] {
        if let Some(daemon) = node.daemon {
            daemon.shutdown().await;
        }
    }
}

/// Scenario E: a guest that ignores the shutdown signal is forced off
/// after `vm_shutdown_timeout`, and the record lands at stop.
#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_forces_stop() {
    let kv = MemoryKv::new();
    let storage = Arc::new(MockStorage::new());
    let fence = Arc::new(MockFence::new());

    let n1 = spawn_node(&kv, &storage, &fence, "n1", &["n1"], |_| {}).await;

    let v1 = VmRecord::new("v1", "n1").with_state(VmState::Start);
    kv.put_json(&paths::domain("vm-v1"), &v1).await.unwrap();
    settle(4).await;
    assert!(n1.hypervisor.is_running("vm-v1"));

    // The guest will sit on the ACPI signal forever.
    n1.hypervisor.ignore_shutdown("vm-v1");

    let (mut vm, version) = kv
        .get_json::<VmRecord>(&paths::domain("vm-v1"))
        .await
        .unwrap()
        .unwrap();
    vm.state = VmState::Shutdown;
    kv.cas_json(&paths::domain("vm-v1"), Some(version), &vm)
        .await
        .unwrap();

    // Default vm_shutdown_timeout is 180s; well before that the VM must
    // still be up, well after it must be forced off.
    settle(30).await;
    assert!(n1.hypervisor.is_running("vm-v1"));

    settle(200).await;
    assert!(!n1.hypervisor.is_running("vm-v1"));
    assert_eq!(get_vm(&kv, "vm-v1").await.state, VmState::Stop);

    if let Some(daemon) = n1.daemon {
        daemon.shutdown().await;
    }
}

/// Scenario F: a wedged health probe is reported as timed out while the
/// keepalive keeps publishing on schedule.
struct WedgedProbe;

#[async_trait]
impl HealthPlugin for WedgedProbe {
    fn name(&self) -> &str {
        "wedged"
    }

    async fn run(
        &self,
        _deadline: Duration,
        _coordinator_state: CoordinatorState,
    ) -> PluginResult {
        tokio::time::sleep(Duration::from_secs(10)).await;
        PluginResult::degraded(99, "never returned in time")
    }
}

#[tokio::test(start_paused = true)]
async fn test_health_plugin_timeout_does_not_stall_keepalive() {
    let kv = MemoryKv::new();
    let storage = Arc::new(MockStorage::new());
    let fence = Arc::new(MockFence::new());

    let mut config = test_config("n1", &["n1"]);
    config.plugin_directory = "/nonexistent/pvc-test-plugins".to_string();

    let hypervisor = Arc::new(MockHypervisor::new());
    let network = Arc::new(MockNetwork::new());
    let daemon = Daemon::start(
        config,
        Arc::new(kv.clone()),
        DriverSet {
            hypervisor: hypervisor as Arc<dyn HypervisorDriver>,
            network: network as Arc<dyn NetworkDriver>,
            storage: Arc::clone(&storage) as Arc<dyn StorageDriver>,
            fence: Arc::clone(&fence) as Arc<dyn FenceDriver>,
            extra_plugins: vec![Arc::new(WedgedProbe)],
        },
    )
    .await
    .unwrap();

    settle(10).await;
    let first = get_node(&kv, "n1").await;

    settle(10).await;
    let second = get_node(&kv, "n1").await;

    // Keepalives kept landing despite the wedged probe.
    assert!(second.keepalive_ts > first.keepalive_ts);

    // The probe is reported as timed out and excluded from the delta.
    let wedged = second
        .plugin_results
        .iter()
        .find(|r| r.name == "wedged")
        .expect("wedged probe should be reported");
    assert!(wedged.timed_out);
    assert_eq!(wedged.message, "timed_out");

    let reported: u32 = second
        .plugin_results
        .iter()
        .filter(|r| !r.timed_out)
        .map(|r| r.delta)
        .sum();
    assert_eq!(second.health_delta, reported);

    daemon.shutdown().await;
}

/// Suicide safety: with `suicide_intervals = 0` no failure reboots the
/// host; with it armed, the reset fires only after the configured misses.
#[tokio::test(start_paused = true)]
async fn test_suicide_safety() {
    // Disarmed: publish failures never touch the fence driver.
    {
        let kv = MemoryKv::new();
        let storage = Arc::new(MockStorage::new());
        let fence = Arc::new(MockFence::new());
        let n1 = spawn_node(&kv, &storage, &fence, "n1", &["n1"], |config| {
            config.fencing.suicide_intervals = 0;
        })
        .await;

        settle(3).await;
        kv.set_available(false);
        settle(20).await;

        assert!(fence.fenced_nodes().is_empty());
        n1.daemon.unwrap().abort();
    }

    // Armed: the self-reset fires after the configured miss count.
    {
        let kv = MemoryKv::new();
        let storage = Arc::new(MockStorage::new());
        let fence = Arc::new(MockFence::new());
        let n1 = spawn_node(&kv, &storage, &fence, "n1", &["n1"], |config| {
            config.fencing.suicide_intervals = 3;
        })
        .await;

        settle(3).await;
        assert!(fence.fenced_nodes().is_empty());

        kv.set_available(false);
        settle(20).await;

        assert_eq!(fence.fenced_nodes(), vec!["n1".to_string()]);
        n1.daemon.unwrap().abort();
    }
}

/// A migration to a node that is not ready is refused.
#[tokio::test(start_paused = true)]
async fn test_migration_to_flushed_node_is_refused() {
    let kv = MemoryKv::new();
    let storage = Arc::new(MockStorage::new());
    let fence = Arc::new(MockFence::new());
    let coordinators = ["n1", "n2"];

    let n1 = spawn_node(&kv, &storage, &fence, "n1", &coordinators, |_| {}).await;
    let n2 = spawn_node(&kv, &storage, &fence, "n2", &coordinators, |_| {}).await;

    let v1 = VmRecord::new("v1", "n1").with_state(VmState::Start);
    kv.put_json(&paths::domain("vm-v1"), &v1).await.unwrap();
    settle(4).await;

    // Drain n2 so it is not a valid target.
    let flush = submit_task(&kv, TaskRequest::FlushNode { node: "n2".into() }).await;
    settle(6).await;
    assert_eq!(task_status(&kv, &flush).await.0, TaskStatus::Done);

    let migrate = submit_task(
        &kv,
        TaskRequest::MigrateVm {
            uuid: "vm-v1".into(),
            target: Some("n2".into()),
            force: false,
        },
    )
    .await;
    settle(6).await;

    let (status, message) = task_status(&kv, &migrate).await;
    assert_eq!(status, TaskStatus::Failed);
    assert!(message.contains("not eligible"));
    assert_eq!(get_vm(&kv, "vm-v1").await.node, "n1");

    for node in [n1, n2] {
        if let Some(daemon) = node.daemon {
            daemon.shutdown().await;
        }
    }
}
