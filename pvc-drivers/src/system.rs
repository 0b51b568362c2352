//! System driver backends.
//!
//! These drive the real host tools: virsh for domains, iproute2 for
//! bridges and VXLANs, rbd/ceph for the replicated block store, and
//! ipmitool for out-of-band power control. Every invocation goes through
//! the bounded-deadline command runner; a slow or wedged tool surfaces as
//! an operation failure, never a stuck daemon.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use pvc_schema::NetworkRecord;

use crate::command::run_command;
use crate::error::{DriverError, Result};
use crate::traits::{FenceDriver, HypervisorDriver, NetworkDriver, StorageDriver};
use crate::types::{
    DomainRuntimeState, DomainSpec, IpmiCredentials, FENCE_DEADLINE, NETWORK_OP_DEADLINE,
    STORAGE_OP_DEADLINE, VM_MIGRATE_DEADLINE, VM_START_DEADLINE,
};

const DOMSTATE_POLL_INTERVAL: Duration = Duration::from_secs(2);

// =============================================================================
// HYPERVISOR (virsh)
// =============================================================================

/// Libvirt backend driven through virsh.
pub struct SystemHypervisor {
    uri: String,
    /// Directory holding per-domain console logs, one `<uuid>.log` each.
    console_dir: PathBuf,
    /// Read offsets into the console logs.
    console_offsets: Mutex<HashMap<String, u64>>,
}

impl SystemHypervisor {
    pub fn new(uri: impl Into<String>, console_dir: impl Into<PathBuf>) -> Self {
        let uri = uri.into();
        info!(uri = %uri, "Creating virsh hypervisor backend");
        Self {
            uri,
            console_dir: console_dir.into(),
            console_offsets: Mutex::new(HashMap::new()),
        }
    }

    async fn virsh(&self, args: &[&str], deadline: Duration) -> Result<String> {
        let mut full = vec!["-c", self.uri.as_str()];
        full.extend_from_slice(args);
        Ok(run_command("virsh", &full, deadline).await?.stdout)
    }

    /// Write the definition to a scratch file for virsh to consume.
    async fn spool_definition(&self, spec: &DomainSpec) -> Result<PathBuf> {
        let path = std::env::temp_dir().join(format!("pvc-domain-{}.xml", spec.uuid));
        tokio::fs::write(&path, &spec.definition_xml)
            .await
            .map_err(|e| DriverError::OperationFailed(format!("spool definition: {}", e)))?;
        Ok(path)
    }
}

#[async_trait]
impl HypervisorDriver for SystemHypervisor {
    async fn define(&self, spec: &DomainSpec) -> Result<()> {
        let path = self.spool_definition(spec).await?;
        self.virsh(&["define", &path.to_string_lossy()], VM_START_DEADLINE)
            .await?;
        Ok(())
    }

    async fn undefine(&self, uuid: &str) -> Result<()> {
        self.virsh(&["undefine", uuid], VM_START_DEADLINE).await?;
        Ok(())
    }

    async fn start(&self, spec: &DomainSpec) -> Result<()> {
        let path = self.spool_definition(spec).await?;
        // `create` instantiates a transient domain straight from the
        // definition; the cluster record is the durable copy.
        self.virsh(&["create", &path.to_string_lossy()], VM_START_DEADLINE)
            .await?;
        Ok(())
    }

    async fn shutdown(&self, uuid: &str, timeout: Duration) -> Result<bool> {
        self.virsh(&["shutdown", uuid], NETWORK_OP_DEADLINE).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DOMSTATE_POLL_INTERVAL).await;
            match self.state(uuid).await? {
                DomainRuntimeState::Stopped | DomainRuntimeState::Unknown => return Ok(true),
                _ => continue,
            }
        }
        Ok(false)
    }

    async fn stop(&self, uuid: &str) -> Result<()> {
        self.virsh(&["destroy", uuid], VM_START_DEADLINE).await?;
        Ok(())
    }

    async fn migrate(&self, uuid: &str, target_addr: &str, live: bool) -> Result<()> {
        let target_uri = format!("qemu+tcp://{}/system", target_addr);
        if live {
            self.virsh(
                &["migrate", "--live", "--p2p", uuid, &target_uri],
                VM_MIGRATE_DEADLINE,
            )
            .await?;
        } else {
            self.virsh(&["migrate", "--p2p", uuid, &target_uri], VM_MIGRATE_DEADLINE)
                .await?;
        }
        Ok(())
    }

    async fn state(&self, uuid: &str) -> Result<DomainRuntimeState> {
        let output = match self.virsh(&["domstate", uuid], NETWORK_OP_DEADLINE).await {
            Ok(out) => out,
            // virsh exits non-zero for unknown domains.
            Err(DriverError::CommandFailed { .. }) => return Ok(DomainRuntimeState::Unknown),
            Err(e) => return Err(e),
        };
        Ok(match output.trim() {
            "running" => DomainRuntimeState::Running,
            "paused" => DomainRuntimeState::Paused,
            "shut off" | "shutdown" => DomainRuntimeState::Stopped,
            "crashed" => DomainRuntimeState::Crashed,
            other => {
                debug!(uuid = %uuid, state = %other, "Unrecognized domstate");
                DomainRuntimeState::Unknown
            }
        })
    }

    async fn list(&self) -> Result<Vec<String>> {
        let output = self
            .virsh(&["list", "--all", "--uuid"], NETWORK_OP_DEADLINE)
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn drain_console(&self, uuid: &str) -> Result<Vec<String>> {
        let path = self.console_dir.join(format!("{}.log", uuid));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(DriverError::OperationFailed(format!(
                    "read console log {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let mut offsets = self.console_offsets.lock().unwrap();
        let offset = offsets.entry(uuid.to_string()).or_insert(0);
        // Log rotation resets the offset.
        if *offset > content.len() as u64 {
            *offset = 0;
        }
        let fresh = &content[*offset as usize..];
        *offset = content.len() as u64;
        Ok(fresh.lines().map(String::from).collect())
    }
}

// =============================================================================
// NETWORK (iproute2 + dnsmasq service units)
// =============================================================================

/// Host network backend driven through iproute2. Gateway dispatchers are
/// templated service units, one instance per managed network.
pub struct SystemNetwork;

impl SystemNetwork {
    pub fn new() -> Self {
        Self
    }

    fn vlan_device(vni: u32) -> String {
        format!("vlan{}", vni)
    }

    fn bridge_device(vni: u32) -> String {
        crate::types::bridge_device(vni)
    }

    fn vxlan_device(vni: u32) -> String {
        format!("vxlan{}", vni)
    }
}

impl Default for SystemNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkDriver for SystemNetwork {
    async fn create_bridged(&self, vni: u32, uplink: &str, mtu: u32) -> Result<()> {
        let vlan = Self::vlan_device(vni);
        let bridge = Self::bridge_device(vni);
        let vni_str = vni.to_string();
        let mtu_str = mtu.to_string();

        run_command(
            "ip",
            &[
                "link", "add", "link", uplink, "name", &vlan, "type", "vlan", "id", &vni_str,
            ],
            NETWORK_OP_DEADLINE,
        )
        .await?;
        run_command(
            "ip",
            &["link", "add", &bridge, "type", "bridge"],
            NETWORK_OP_DEADLINE,
        )
        .await?;
        run_command(
            "ip",
            &["link", "set", &vlan, "master", &bridge],
            NETWORK_OP_DEADLINE,
        )
        .await?;
        for device in [vlan.as_str(), bridge.as_str()] {
            run_command(
                "ip",
                &["link", "set", device, "mtu", &mtu_str, "up"],
                NETWORK_OP_DEADLINE,
            )
            .await?;
        }
        info!(vni = vni, uplink = %uplink, "Bridged network configured");
        Ok(())
    }

    async fn destroy_bridged(&self, vni: u32) -> Result<()> {
        let vlan = Self::vlan_device(vni);
        let bridge = Self::bridge_device(vni);
        run_command("ip", &["link", "del", &bridge], NETWORK_OP_DEADLINE).await?;
        run_command("ip", &["link", "del", &vlan], NETWORK_OP_DEADLINE).await?;
        Ok(())
    }

    async fn create_vxlan(&self, vni: u32, cluster_device: &str, mtu: u32) -> Result<()> {
        let vxlan = Self::vxlan_device(vni);
        let bridge = Self::bridge_device(vni);
        let vni_str = vni.to_string();
        let mtu_str = mtu.to_string();

        run_command(
            "ip",
            &[
                "link", "add", &vxlan, "type", "vxlan", "id", &vni_str, "dev", cluster_device,
                "nolearning",
            ],
            NETWORK_OP_DEADLINE,
        )
        .await?;
        run_command(
            "ip",
            &["link", "add", &bridge, "type", "bridge"],
            NETWORK_OP_DEADLINE,
        )
        .await?;
        run_command(
            "ip",
            &["link", "set", &vxlan, "master", &bridge],
            NETWORK_OP_DEADLINE,
        )
        .await?;
        for device in [vxlan.as_str(), bridge.as_str()] {
            run_command(
                "ip",
                &["link", "set", device, "mtu", &mtu_str, "up"],
                NETWORK_OP_DEADLINE,
            )
            .await?;
        }
        info!(vni = vni, device = %cluster_device, "Managed network configured");
        Ok(())
    }

    async fn destroy_vxlan(&self, vni: u32) -> Result<()> {
        let vxlan = Self::vxlan_device(vni);
        let bridge = Self::bridge_device(vni);
        run_command("ip", &["link", "del", &bridge], NETWORK_OP_DEADLINE).await?;
        run_command("ip", &["link", "del", &vxlan], NETWORK_OP_DEADLINE).await?;
        Ok(())
    }

    async fn bind_address(&self, device: &str, address: &str) -> Result<()> {
        match run_command(
            "ip",
            &["address", "add", address, "dev", device],
            NETWORK_OP_DEADLINE,
        )
        .await
        {
            Ok(_) => Ok(()),
            // Already bound is convergence, not failure.
            Err(DriverError::CommandFailed { stderr, .. })
                if stderr.contains("File exists") =>
            {
                debug!(device = %device, address = %address, "Address already bound");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn unbind_address(&self, device: &str, address: &str) -> Result<()> {
        match run_command(
            "ip",
            &["address", "del", address, "dev", device],
            NETWORK_OP_DEADLINE,
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(DriverError::CommandFailed { stderr, .. })
                if stderr.contains("Cannot assign") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn start_gateway(&self, record: &NetworkRecord) -> Result<()> {
        let unit = format!("pvc-dnsmasq@{}.service", record.vni);
        run_command("systemctl", &["start", &unit], NETWORK_OP_DEADLINE).await?;
        info!(vni = record.vni, "Gateway dispatcher started");
        Ok(())
    }

    async fn stop_gateway(&self, vni: u32) -> Result<()> {
        let unit = format!("pvc-dnsmasq@{}.service", vni);
        if let Err(e) = run_command("systemctl", &["stop", &unit], NETWORK_OP_DEADLINE).await {
            warn!(vni = vni, error = %e, "Gateway dispatcher stop failed");
        }
        Ok(())
    }
}

// =============================================================================
// STORAGE (rbd / ceph)
// =============================================================================

/// Replicated block store backend driven through rbd and ceph-volume.
pub struct SystemStorage;

impl SystemStorage {
    pub fn new() -> Self {
        Self
    }

    fn image(pool: &str, name: &str) -> String {
        format!("{}/{}", pool, name)
    }
}

impl Default for SystemStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDriver for SystemStorage {
    async fn create_volume(&self, pool: &str, name: &str, size_bytes: u64) -> Result<()> {
        let image = Self::image(pool, name);
        let size = format!("{}B", size_bytes);
        run_command(
            "rbd",
            &["create", "--size", &size, &image],
            STORAGE_OP_DEADLINE,
        )
        .await?;
        Ok(())
    }

    async fn map_volume(&self, pool: &str, name: &str) -> Result<()> {
        run_command("rbd", &["map", &Self::image(pool, name)], STORAGE_OP_DEADLINE).await?;
        Ok(())
    }

    async fn unmap_volume(&self, pool: &str, name: &str) -> Result<()> {
        run_command(
            "rbd",
            &["unmap", &Self::image(pool, name)],
            STORAGE_OP_DEADLINE,
        )
        .await?;
        Ok(())
    }

    async fn resize_volume(&self, pool: &str, name: &str, size_bytes: u64) -> Result<()> {
        let size = format!("{}B", size_bytes);
        run_command(
            "rbd",
            &["resize", "--size", &size, &Self::image(pool, name)],
            STORAGE_OP_DEADLINE,
        )
        .await?;
        Ok(())
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        run_command("rbd", &["rm", &Self::image(pool, name)], STORAGE_OP_DEADLINE).await?;
        Ok(())
    }

    async fn snapshot_volume(&self, pool: &str, name: &str, snapshot: &str) -> Result<()> {
        let snap = format!("{}@{}", Self::image(pool, name), snapshot);
        run_command("rbd", &["snap", "create", &snap], STORAGE_OP_DEADLINE).await?;
        Ok(())
    }

    async fn lock_volume(&self, pool: &str, name: &str, node: &str) -> Result<()> {
        if let Some(holder) = self.lock_holder(pool, name).await? {
            if holder != node {
                return Err(DriverError::VolumeLocked {
                    volume: Self::image(pool, name),
                    holder,
                });
            }
            return Ok(());
        }
        run_command(
            "rbd",
            &["lock", "add", &Self::image(pool, name), node],
            STORAGE_OP_DEADLINE,
        )
        .await?;
        Ok(())
    }

    async fn unlock_volume(&self, pool: &str, name: &str, node: &str) -> Result<()> {
        let image = Self::image(pool, name);
        let output = run_command(
            "rbd",
            &["lock", "ls", "--format", "json", &image],
            STORAGE_OP_DEADLINE,
        )
        .await?;
        // `rbd lock ls` reports [{"id": <cookie>, "locker": <client>, ...}].
        let locks: Vec<serde_json::Value> =
            serde_json::from_str(&output.stdout).unwrap_or_default();
        for lock in locks {
            let id = lock.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            let locker = lock
                .get("locker")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if id == node {
                run_command(
                    "rbd",
                    &["lock", "rm", &image, id, locker],
                    STORAGE_OP_DEADLINE,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn clear_lock(&self, pool: &str, name: &str) -> Result<()> {
        let image = Self::image(pool, name);
        let output = run_command(
            "rbd",
            &["lock", "ls", "--format", "json", &image],
            STORAGE_OP_DEADLINE,
        )
        .await?;
        let locks: Vec<serde_json::Value> =
            serde_json::from_str(&output.stdout).unwrap_or_default();
        for lock in locks {
            let id = lock.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            let locker = lock
                .get("locker")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            run_command(
                "rbd",
                &["lock", "rm", &image, id, locker],
                STORAGE_OP_DEADLINE,
            )
            .await?;
        }
        info!(volume = %image, "Cleared stale volume locks");
        Ok(())
    }

    async fn lock_holder(&self, pool: &str, name: &str) -> Result<Option<String>> {
        let output = run_command(
            "rbd",
            &["lock", "ls", "--format", "json", &Self::image(pool, name)],
            STORAGE_OP_DEADLINE,
        )
        .await?;
        let locks: Vec<serde_json::Value> =
            serde_json::from_str(&output.stdout).unwrap_or_default();
        Ok(locks
            .first()
            .and_then(|l| l.get("id"))
            .and_then(|v| v.as_str())
            .map(String::from))
    }

    async fn bootstrap_osd(&self, id: u32, node: &str, device: &str, weight: f64) -> Result<()> {
        run_command(
            "ceph-volume",
            &["lvm", "create", "--data", device],
            STORAGE_OP_DEADLINE,
        )
        .await?;
        let osd = format!("osd.{}", id);
        let weight_str = weight.to_string();
        run_command(
            "ceph",
            &["osd", "crush", "set", &osd, &weight_str, &format!("host={}", node)],
            STORAGE_OP_DEADLINE,
        )
        .await?;
        info!(osd_id = id, device = %device, "OSD bootstrapped");
        Ok(())
    }
}

// =============================================================================
// FENCE (ipmitool)
// =============================================================================

/// Out-of-band fence backend driven through ipmitool.
pub struct SystemFence;

impl SystemFence {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemFence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FenceDriver for SystemFence {
    async fn fence(&self, node: &str, credentials: &IpmiCredentials) -> Result<()> {
        let base = [
            "-I",
            "lanplus",
            "-H",
            credentials.hostname.as_str(),
            "-U",
            credentials.username.as_str(),
            "-P",
            credentials.password.as_str(),
        ];

        let mut reset = base.to_vec();
        reset.extend_from_slice(&["chassis", "power", "reset"]);
        run_command("ipmitool", &reset, FENCE_DEADLINE).await?;

        // A reset only counts once the controller confirms the chassis
        // came back on.
        let mut status = base.to_vec();
        status.extend_from_slice(&["chassis", "power", "status"]);
        let output = run_command("ipmitool", &status, FENCE_DEADLINE).await?;
        if output.stdout.contains("on") {
            info!(node = %node, "Fence confirmed: chassis power is on after reset");
            Ok(())
        } else {
            Err(DriverError::OperationFailed(format!(
                "power status after reset of {}: {}",
                node,
                output.stdout.trim()
            )))
        }
    }
}
