//! # PVC Schema
//!
//! Shared record types for every entity in the cluster key-value tree,
//! plus the tree layout itself. Every daemon component and external
//! client (API, CLI, provisioner) speaks these types; the KV store only
//! ever sees their JSON serialization.

pub mod network;
pub mod node;
pub mod paths;
pub mod storage;
pub mod task;
pub mod vm;

pub use network::{AclRule, DhcpRange, NetworkRecord, NetworkType, StaticLease};
pub use node::{
    CoordinatorState, DaemonState, DomainState, NodeAddresses, NodeRecord, NodeRole, PluginReport,
};
pub use storage::{OsdRecord, OsdState, PoolRecord, SnapshotRecord, VolumeRecord};
pub use task::{TaskRecord, TaskRequest, TaskStatus};
pub use vm::{MigrationMethod, TargetSelector, VmMeta, VmRecord, VmState, VolumeRef};
