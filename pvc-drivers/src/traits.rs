//! Core driver abstraction traits.
//!
//! Callers apply the operation-class deadlines from [`crate::types`] when
//! invoking these; a deadline miss is an operation failure surfaced in
//! the originating task record, never a daemon failure.

use async_trait::async_trait;
use std::time::Duration;

use pvc_schema::NetworkRecord;

use crate::error::Result;
use crate::types::{DomainRuntimeState, DomainSpec, IpmiCredentials};

/// Hypervisor abstraction: starts, stops, and migrates domains given an
/// opaque definition. Live migration runs over the cluster network.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Register the domain definition without starting it.
    async fn define(&self, spec: &DomainSpec) -> Result<()>;

    /// Remove the domain definition. The domain must not be running.
    async fn undefine(&self, uuid: &str) -> Result<()>;

    /// Start a domain from its definition.
    async fn start(&self, spec: &DomainSpec) -> Result<()>;

    /// Graceful shutdown. Returns true if the guest powered off within
    /// `timeout`, false if it ignored the signal.
    async fn shutdown(&self, uuid: &str, timeout: Duration) -> Result<bool>;

    /// Immediate power-off.
    async fn stop(&self, uuid: &str) -> Result<()>;

    /// Migrate a running domain to the peer at `target_addr`. With
    /// `live = false` the domain is stopped first and restarted by the
    /// target's controller.
    async fn migrate(&self, uuid: &str, target_addr: &str, live: bool) -> Result<()>;

    /// Current runtime state of a domain.
    async fn state(&self, uuid: &str) -> Result<DomainRuntimeState>;

    /// UUIDs of all domains present on this host.
    async fn list(&self) -> Result<Vec<String>>;

    /// New console output since the previous drain, oldest first.
    async fn drain_console(&self, uuid: &str) -> Result<Vec<String>>;
}

/// Host network abstraction: bridges, VXLAN tunnels, address binding,
/// and per-network gateway services.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Create an 802.1q VLAN + Linux bridge for a bridged network.
    async fn create_bridged(&self, vni: u32, uplink: &str, mtu: u32) -> Result<()>;

    async fn destroy_bridged(&self, vni: u32) -> Result<()>;

    /// Create a VXLAN tunnel on the cluster device for a managed network.
    async fn create_vxlan(&self, vni: u32, cluster_device: &str, mtu: u32) -> Result<()>;

    async fn destroy_vxlan(&self, vni: u32) -> Result<()>;

    /// Bind an address (floating IP or managed-network gateway) to a
    /// local device.
    async fn bind_address(&self, device: &str, address: &str) -> Result<()>;

    async fn unbind_address(&self, device: &str, address: &str) -> Result<()>;

    /// Start the DHCP/DNS dispatcher for a managed network. Primary only.
    async fn start_gateway(&self, record: &NetworkRecord) -> Result<()>;

    async fn stop_gateway(&self, vni: u32) -> Result<()>;
}

/// Replicated block store abstraction. Lock operations pin a volume to
/// its using node; only the fence controller may break a lock.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn create_volume(&self, pool: &str, name: &str, size_bytes: u64) -> Result<()>;

    async fn map_volume(&self, pool: &str, name: &str) -> Result<()>;

    async fn unmap_volume(&self, pool: &str, name: &str) -> Result<()>;

    async fn resize_volume(&self, pool: &str, name: &str, size_bytes: u64) -> Result<()>;

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()>;

    async fn snapshot_volume(&self, pool: &str, name: &str, snapshot: &str) -> Result<()>;

    /// Take the exclusive lock for `node`. Fails if another node holds it.
    async fn lock_volume(&self, pool: &str, name: &str, node: &str) -> Result<()>;

    /// Release the lock held by `node`.
    async fn unlock_volume(&self, pool: &str, name: &str, node: &str) -> Result<()>;

    /// Break the lock regardless of holder. Fence controller only.
    async fn clear_lock(&self, pool: &str, name: &str) -> Result<()>;

    async fn lock_holder(&self, pool: &str, name: &str) -> Result<Option<String>>;

    /// Bootstrap an OSD on a local device and record its weight.
    async fn bootstrap_osd(&self, id: u32, node: &str, device: &str, weight: f64) -> Result<()>;
}

/// Out-of-band power control via the node's management controller.
#[async_trait]
pub trait FenceDriver: Send + Sync {
    /// Power-reset the node. Success means the management controller
    /// confirmed a clean reset.
    async fn fence(&self, node: &str, credentials: &IpmiCredentials) -> Result<()>;
}
