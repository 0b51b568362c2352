//! Mock driver backends for testing and development.
//!
//! These simulate the hypervisor, network, storage, and fence drivers in
//! memory without touching the host. Each backend keeps an operation log
//! and supports failure injection so the coordination core can be
//! exercised end-to-end.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, instrument};

use pvc_schema::NetworkRecord;

use crate::error::{DriverError, Result};
use crate::traits::{FenceDriver, HypervisorDriver, NetworkDriver, StorageDriver};
use crate::types::{DomainRuntimeState, DomainSpec, IpmiCredentials};

// =============================================================================
// MOCK HYPERVISOR
// =============================================================================

struct MockDomain {
    spec: DomainSpec,
    state: DomainRuntimeState,
    /// Console lines produced since the last drain.
    pending_console: Vec<String>,
}

/// Mock hypervisor backend.
pub struct MockHypervisor {
    domains: RwLock<HashMap<String, MockDomain>>,
    /// Domains whose start should fail.
    fail_start: RwLock<HashSet<String>>,
    /// Domains whose guest ignores the shutdown signal.
    ignore_shutdown: RwLock<HashSet<String>>,
    operations: RwLock<Vec<String>>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self {
            domains: RwLock::new(HashMap::new()),
            fail_start: RwLock::new(HashSet::new()),
            ignore_shutdown: RwLock::new(HashSet::new()),
            operations: RwLock::new(Vec::new()),
        }
    }

    fn log(&self, op: String) {
        self.operations.write().unwrap().push(op);
    }

    /// Operation log, oldest first.
    pub fn operations(&self) -> Vec<String> {
        self.operations.read().unwrap().clone()
    }

    /// Make `start` fail for the given domain.
    pub fn fail_start(&self, uuid: &str) {
        self.fail_start.write().unwrap().insert(uuid.to_string());
    }

    /// Make the guest ignore graceful shutdown.
    pub fn ignore_shutdown(&self, uuid: &str) {
        self.ignore_shutdown
            .write()
            .unwrap()
            .insert(uuid.to_string());
    }

    /// Queue console output for a domain, as a running guest would.
    pub fn emit_console(&self, uuid: &str, line: impl Into<String>) {
        if let Some(domain) = self.domains.write().unwrap().get_mut(uuid) {
            domain.pending_console.push(line.into());
        }
    }

    pub fn is_running(&self, uuid: &str) -> bool {
        self.domains
            .read()
            .unwrap()
            .get(uuid)
            .map(|d| d.state == DomainRuntimeState::Running)
            .unwrap_or(false)
    }

    /// Simulate a host crash: all domains vanish without state updates.
    pub fn crash(&self) {
        self.domains.write().unwrap().clear();
    }
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorDriver for MockHypervisor {
    #[instrument(skip(self, spec), fields(uuid = %spec.uuid))]
    async fn define(&self, spec: &DomainSpec) -> Result<()> {
        self.log(format!("define {}", spec.uuid));
        let mut domains = self.domains.write().unwrap();
        domains.entry(spec.uuid.clone()).or_insert(MockDomain {
            spec: spec.clone(),
            state: DomainRuntimeState::Stopped,
            pending_console: Vec::new(),
        });
        Ok(())
    }

    async fn undefine(&self, uuid: &str) -> Result<()> {
        self.log(format!("undefine {}", uuid));
        let mut domains = self.domains.write().unwrap();
        match domains.get(uuid) {
            Some(d) if d.state == DomainRuntimeState::Running => Err(
                DriverError::InvalidState("domain must be stopped before undefine".into()),
            ),
            Some(_) => {
                domains.remove(uuid);
                Ok(())
            }
            None => Err(DriverError::DomainNotFound(uuid.to_string())),
        }
    }

    #[instrument(skip(self, spec), fields(uuid = %spec.uuid, name = %spec.name))]
    async fn start(&self, spec: &DomainSpec) -> Result<()> {
        self.log(format!("start {}", spec.uuid));
        if self.fail_start.read().unwrap().contains(&spec.uuid) {
            return Err(DriverError::OperationFailed(format!(
                "simulated start failure for {}",
                spec.uuid
            )));
        }
        let mut domains = self.domains.write().unwrap();
        let domain = domains.entry(spec.uuid.clone()).or_insert(MockDomain {
            spec: spec.clone(),
            state: DomainRuntimeState::Stopped,
            pending_console: Vec::new(),
        });
        if domain.state == DomainRuntimeState::Running {
            return Err(DriverError::InvalidState("domain already running".into()));
        }
        domain.state = DomainRuntimeState::Running;
        info!("Mock domain started");
        Ok(())
    }

    #[instrument(skip(self), fields(uuid = %uuid, timeout_secs = timeout.as_secs()))]
    async fn shutdown(&self, uuid: &str, timeout: Duration) -> Result<bool> {
        self.log(format!("shutdown {}", uuid));
        if !self.domains.read().unwrap().contains_key(uuid) {
            return Err(DriverError::DomainNotFound(uuid.to_string()));
        }
        if self.ignore_shutdown.read().unwrap().contains(uuid) {
            // Guest never reacts; wait out the grace period.
            tokio::time::sleep(timeout).await;
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(50).min(timeout)).await;
        let mut domains = self.domains.write().unwrap();
        let domain = domains
            .get_mut(uuid)
            .ok_or_else(|| DriverError::DomainNotFound(uuid.to_string()))?;
        domain.state = DomainRuntimeState::Stopped;
        Ok(true)
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn stop(&self, uuid: &str) -> Result<()> {
        self.log(format!("stop {}", uuid));
        let mut domains = self.domains.write().unwrap();
        let domain = domains
            .get_mut(uuid)
            .ok_or_else(|| DriverError::DomainNotFound(uuid.to_string()))?;
        domain.state = DomainRuntimeState::Stopped;
        Ok(())
    }

    #[instrument(skip(self), fields(uuid = %uuid, target = %target_addr, live = live))]
    async fn migrate(&self, uuid: &str, target_addr: &str, live: bool) -> Result<()> {
        self.log(format!("migrate {} -> {} live={}", uuid, target_addr, live));
        {
            let domains = self.domains.read().unwrap();
            let domain = domains
                .get(uuid)
                .ok_or_else(|| DriverError::DomainNotFound(uuid.to_string()))?;
            if domain.state != DomainRuntimeState::Running {
                return Err(DriverError::InvalidState("domain is not running".into()));
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The domain leaves this host; the target hypervisor picks it up.
        self.domains.write().unwrap().remove(uuid);
        info!("Mock migration complete");
        Ok(())
    }

    async fn state(&self, uuid: &str) -> Result<DomainRuntimeState> {
        let domains = self.domains.read().unwrap();
        Ok(domains
            .get(uuid)
            .map(|d| d.state)
            .unwrap_or(DomainRuntimeState::Unknown))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let domains = self.domains.read().unwrap();
        let uuids: Vec<String> = domains.keys().cloned().collect();
        debug!(count = uuids.len(), "Listed mock domains");
        Ok(uuids)
    }

    async fn drain_console(&self, uuid: &str) -> Result<Vec<String>> {
        let mut domains = self.domains.write().unwrap();
        let domain = domains
            .get_mut(uuid)
            .ok_or_else(|| DriverError::DomainNotFound(uuid.to_string()))?;
        Ok(std::mem::take(&mut domain.pending_console))
    }
}

// =============================================================================
// MOCK NETWORK
// =============================================================================

/// Mock network backend; records the host network state it would build.
pub struct MockNetwork {
    bridges: RwLock<HashSet<u32>>,
    vxlans: RwLock<HashSet<u32>>,
    /// (device, address) pairs currently bound.
    addresses: RwLock<HashSet<(String, String)>>,
    gateways: RwLock<HashSet<u32>>,
    operations: RwLock<Vec<String>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            bridges: RwLock::new(HashSet::new()),
            vxlans: RwLock::new(HashSet::new()),
            addresses: RwLock::new(HashSet::new()),
            gateways: RwLock::new(HashSet::new()),
            operations: RwLock::new(Vec::new()),
        }
    }

    fn log(&self, op: String) {
        self.operations.write().unwrap().push(op);
    }

    pub fn operations(&self) -> Vec<String> {
        self.operations.read().unwrap().clone()
    }

    pub fn has_bridge(&self, vni: u32) -> bool {
        self.bridges.read().unwrap().contains(&vni)
    }

    pub fn has_vxlan(&self, vni: u32) -> bool {
        self.vxlans.read().unwrap().contains(&vni)
    }

    pub fn bound_addresses(&self) -> Vec<(String, String)> {
        let mut addrs: Vec<_> = self.addresses.read().unwrap().iter().cloned().collect();
        addrs.sort();
        addrs
    }

    pub fn has_gateway(&self, vni: u32) -> bool {
        self.gateways.read().unwrap().contains(&vni)
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkDriver for MockNetwork {
    async fn create_bridged(&self, vni: u32, uplink: &str, mtu: u32) -> Result<()> {
        self.log(format!("create_bridged {} on {} mtu {}", vni, uplink, mtu));
        self.bridges.write().unwrap().insert(vni);
        info!(vni = vni, uplink = %uplink, "Mock bridged network created");
        Ok(())
    }

    async fn destroy_bridged(&self, vni: u32) -> Result<()> {
        self.log(format!("destroy_bridged {}", vni));
        self.bridges.write().unwrap().remove(&vni);
        Ok(())
    }

    async fn create_vxlan(&self, vni: u32, cluster_device: &str, mtu: u32) -> Result<()> {
        self.log(format!(
            "create_vxlan {} on {} mtu {}",
            vni, cluster_device, mtu
        ));
        self.vxlans.write().unwrap().insert(vni);
        info!(vni = vni, device = %cluster_device, "Mock VXLAN created");
        Ok(())
    }

    async fn destroy_vxlan(&self, vni: u32) -> Result<()> {
        self.log(format!("destroy_vxlan {}", vni));
        self.vxlans.write().unwrap().remove(&vni);
        Ok(())
    }

    async fn bind_address(&self, device: &str, address: &str) -> Result<()> {
        self.log(format!("bind {} on {}", address, device));
        self.addresses
            .write()
            .unwrap()
            .insert((device.to_string(), address.to_string()));
        Ok(())
    }

    async fn unbind_address(&self, device: &str, address: &str) -> Result<()> {
        self.log(format!("unbind {} on {}", address, device));
        self.addresses
            .write()
            .unwrap()
            .remove(&(device.to_string(), address.to_string()));
        Ok(())
    }

    async fn start_gateway(&self, record: &NetworkRecord) -> Result<()> {
        self.log(format!("start_gateway {}", record.vni));
        self.gateways.write().unwrap().insert(record.vni);
        Ok(())
    }

    async fn stop_gateway(&self, vni: u32) -> Result<()> {
        self.log(format!("stop_gateway {}", vni));
        self.gateways.write().unwrap().remove(&vni);
        Ok(())
    }
}

// =============================================================================
// MOCK STORAGE
// =============================================================================

struct MockVolume {
    size_bytes: u64,
    lock_holder: Option<String>,
    mapped: bool,
}

/// Mock storage backend with real lock semantics.
pub struct MockStorage {
    volumes: RwLock<HashMap<String, MockVolume>>,
    osds: RwLock<HashMap<u32, (String, String, f64)>>,
    /// OSD ids whose bootstrap should fail.
    fail_osds: RwLock<HashSet<u32>>,
    operations: RwLock<Vec<String>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self {
            volumes: RwLock::new(HashMap::new()),
            osds: RwLock::new(HashMap::new()),
            fail_osds: RwLock::new(HashSet::new()),
            operations: RwLock::new(Vec::new()),
        }
    }

    fn key(pool: &str, name: &str) -> String {
        format!("{}/{}", pool, name)
    }

    fn log(&self, op: String) {
        self.operations.write().unwrap().push(op);
    }

    pub fn operations(&self) -> Vec<String> {
        self.operations.read().unwrap().clone()
    }

    pub fn fail_osd(&self, id: u32) {
        self.fail_osds.write().unwrap().insert(id);
    }

    pub fn volume_size(&self, pool: &str, name: &str) -> Option<u64> {
        self.volumes
            .read()
            .unwrap()
            .get(&Self::key(pool, name))
            .map(|v| v.size_bytes)
    }

    pub fn has_osd(&self, id: u32) -> bool {
        self.osds.read().unwrap().contains_key(&id)
    }
}

impl Default for MockStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDriver for MockStorage {
    async fn create_volume(&self, pool: &str, name: &str, size_bytes: u64) -> Result<()> {
        self.log(format!("create_volume {}/{} {}", pool, name, size_bytes));
        let mut volumes = self.volumes.write().unwrap();
        let key = Self::key(pool, name);
        if volumes.contains_key(&key) {
            return Err(DriverError::OperationFailed(format!(
                "volume {} already exists",
                key
            )));
        }
        volumes.insert(
            key,
            MockVolume {
                size_bytes,
                lock_holder: None,
                mapped: false,
            },
        );
        Ok(())
    }

    async fn map_volume(&self, pool: &str, name: &str) -> Result<()> {
        self.log(format!("map_volume {}/{}", pool, name));
        let mut volumes = self.volumes.write().unwrap();
        let volume = volumes
            .get_mut(&Self::key(pool, name))
            .ok_or_else(|| DriverError::VolumeNotFound(Self::key(pool, name)))?;
        volume.mapped = true;
        Ok(())
    }

    async fn unmap_volume(&self, pool: &str, name: &str) -> Result<()> {
        self.log(format!("unmap_volume {}/{}", pool, name));
        let mut volumes = self.volumes.write().unwrap();
        let volume = volumes
            .get_mut(&Self::key(pool, name))
            .ok_or_else(|| DriverError::VolumeNotFound(Self::key(pool, name)))?;
        volume.mapped = false;
        Ok(())
    }

    async fn resize_volume(&self, pool: &str, name: &str, size_bytes: u64) -> Result<()> {
        self.log(format!("resize_volume {}/{} {}", pool, name, size_bytes));
        let mut volumes = self.volumes.write().unwrap();
        let volume = volumes
            .get_mut(&Self::key(pool, name))
            .ok_or_else(|| DriverError::VolumeNotFound(Self::key(pool, name)))?;
        if size_bytes < volume.size_bytes {
            return Err(DriverError::InvalidState(
                "volumes cannot shrink".to_string(),
            ));
        }
        volume.size_bytes = size_bytes;
        Ok(())
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        self.log(format!("delete_volume {}/{}", pool, name));
        let mut volumes = self.volumes.write().unwrap();
        let key = Self::key(pool, name);
        match volumes.get(&key) {
            Some(v) if v.lock_holder.is_some() => Err(DriverError::VolumeLocked {
                volume: key,
                holder: v.lock_holder.clone().unwrap(),
            }),
            Some(_) => {
                volumes.remove(&key);
                Ok(())
            }
            None => Err(DriverError::VolumeNotFound(key)),
        }
    }

    async fn snapshot_volume(&self, pool: &str, name: &str, snapshot: &str) -> Result<()> {
        self.log(format!("snapshot_volume {}/{}@{}", pool, name, snapshot));
        let volumes = self.volumes.read().unwrap();
        if !volumes.contains_key(&Self::key(pool, name)) {
            return Err(DriverError::VolumeNotFound(Self::key(pool, name)));
        }
        Ok(())
    }

    async fn lock_volume(&self, pool: &str, name: &str, node: &str) -> Result<()> {
        self.log(format!("lock_volume {}/{} by {}", pool, name, node));
        let mut volumes = self.volumes.write().unwrap();
        let key = Self::key(pool, name);
        let volume = volumes
            .get_mut(&key)
            .ok_or_else(|| DriverError::VolumeNotFound(key.clone()))?;
        match &volume.lock_holder {
            Some(holder) if holder != node => Err(DriverError::VolumeLocked {
                volume: key,
                holder: holder.clone(),
            }),
            _ => {
                volume.lock_holder = Some(node.to_string());
                Ok(())
            }
        }
    }

    async fn unlock_volume(&self, pool: &str, name: &str, node: &str) -> Result<()> {
        self.log(format!("unlock_volume {}/{} by {}", pool, name, node));
        let mut volumes = self.volumes.write().unwrap();
        let key = Self::key(pool, name);
        let volume = volumes
            .get_mut(&key)
            .ok_or_else(|| DriverError::VolumeNotFound(key.clone()))?;
        match &volume.lock_holder {
            Some(holder) if holder == node => {
                volume.lock_holder = None;
                Ok(())
            }
            Some(holder) => Err(DriverError::VolumeLocked {
                volume: key,
                holder: holder.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn clear_lock(&self, pool: &str, name: &str) -> Result<()> {
        self.log(format!("clear_lock {}/{}", pool, name));
        let mut volumes = self.volumes.write().unwrap();
        let volume = volumes
            .get_mut(&Self::key(pool, name))
            .ok_or_else(|| DriverError::VolumeNotFound(Self::key(pool, name)))?;
        volume.lock_holder = None;
        Ok(())
    }

    async fn lock_holder(&self, pool: &str, name: &str) -> Result<Option<String>> {
        let volumes = self.volumes.read().unwrap();
        Ok(volumes
            .get(&Self::key(pool, name))
            .and_then(|v| v.lock_holder.clone()))
    }

    async fn bootstrap_osd(&self, id: u32, node: &str, device: &str, weight: f64) -> Result<()> {
        self.log(format!("bootstrap_osd {} on {}:{}", id, node, device));
        if self.fail_osds.read().unwrap().contains(&id) {
            return Err(DriverError::OperationFailed(format!(
                "simulated OSD bootstrap failure for {}",
                id
            )));
        }
        self.osds
            .write()
            .unwrap()
            .insert(id, (node.to_string(), device.to_string(), weight));
        Ok(())
    }
}

// =============================================================================
// MOCK FENCE
// =============================================================================

/// Mock fence backend; records which nodes were reset.
pub struct MockFence {
    fenced: RwLock<Vec<String>>,
    fail_nodes: RwLock<HashSet<String>>,
}

impl MockFence {
    pub fn new() -> Self {
        Self {
            fenced: RwLock::new(Vec::new()),
            fail_nodes: RwLock::new(HashSet::new()),
        }
    }

    /// Make fencing fail for a node (management controller unreachable).
    pub fn fail_node(&self, node: &str) {
        self.fail_nodes.write().unwrap().insert(node.to_string());
    }

    /// Nodes reset so far, in order.
    pub fn fenced_nodes(&self) -> Vec<String> {
        self.fenced.read().unwrap().clone()
    }
}

impl Default for MockFence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FenceDriver for MockFence {
    #[instrument(skip(self, _credentials), fields(node = %node))]
    async fn fence(&self, node: &str, _credentials: &IpmiCredentials) -> Result<()> {
        if self.fail_nodes.read().unwrap().contains(node) {
            return Err(DriverError::Unreachable(format!(
                "management controller for {} did not respond",
                node
            )));
        }
        self.fenced.write().unwrap().push(node.to_string());
        info!("Mock fence: node power reset confirmed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_domain_lifecycle() {
        let hv = MockHypervisor::new();
        let spec = DomainSpec::new("vm-1", "web1", "<domain/>");

        hv.start(&spec).await.unwrap();
        assert_eq!(
            hv.state("vm-1").await.unwrap(),
            DomainRuntimeState::Running
        );

        let stopped = hv.shutdown("vm-1", Duration::from_secs(1)).await.unwrap();
        assert!(stopped);
        assert_eq!(
            hv.state("vm-1").await.unwrap(),
            DomainRuntimeState::Stopped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_can_ignore_shutdown() {
        let hv = MockHypervisor::new();
        let spec = DomainSpec::new("vm-1", "web1", "<domain/>");
        hv.start(&spec).await.unwrap();
        hv.ignore_shutdown("vm-1");

        let stopped = hv.shutdown("vm-1", Duration::from_secs(180)).await.unwrap();
        assert!(!stopped);
        assert!(hv.is_running("vm-1"));

        hv.stop("vm-1").await.unwrap();
        assert!(!hv.is_running("vm-1"));
    }

    #[tokio::test]
    async fn test_migration_removes_domain_from_source() {
        let hv = MockHypervisor::new();
        let spec = DomainSpec::new("vm-1", "web1", "<domain/>");
        hv.start(&spec).await.unwrap();

        hv.migrate("vm-1", "10.0.0.2", true).await.unwrap();
        assert_eq!(
            hv.state("vm-1").await.unwrap(),
            DomainRuntimeState::Unknown
        );
    }

    #[tokio::test]
    async fn test_volume_lock_exclusivity() {
        let storage = MockStorage::new();
        storage.create_volume("vms", "web1_root", 1 << 30).await.unwrap();

        storage.lock_volume("vms", "web1_root", "hv1").await.unwrap();
        // Re-locking by the holder is idempotent.
        storage.lock_volume("vms", "web1_root", "hv1").await.unwrap();

        let err = storage
            .lock_volume("vms", "web1_root", "hv2")
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::VolumeLocked { .. }));

        storage.clear_lock("vms", "web1_root").await.unwrap();
        storage.lock_volume("vms", "web1_root", "hv2").await.unwrap();
        assert_eq!(
            storage.lock_holder("vms", "web1_root").await.unwrap(),
            Some("hv2".to_string())
        );
    }

    #[tokio::test]
    async fn test_fence_failure_injection() {
        let fence = MockFence::new();
        let creds = IpmiCredentials {
            hostname: "hv2-lom".into(),
            username: "admin".into(),
            password: "secret".into(),
        };

        fence.fence("hv2", &creds).await.unwrap();
        assert_eq!(fence.fenced_nodes(), vec!["hv2".to_string()]);

        fence.fail_node("hv3");
        assert!(fence.fence("hv3", &creds).await.is_err());
    }
}
