//! Shared driver types and operation-class deadlines.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Deadline for starting a VM.
pub const VM_START_DEADLINE: Duration = Duration::from_secs(60);

/// Deadline for a live migration.
pub const VM_MIGRATE_DEADLINE: Duration = Duration::from_secs(300);

/// Deadline for a storage operation (create/resize/delete/snapshot/lock).
pub const STORAGE_OP_DEADLINE: Duration = Duration::from_secs(120);

/// Deadline for a host network change.
pub const NETWORK_OP_DEADLINE: Duration = Duration::from_secs(60);

/// Deadline for a single fence attempt.
pub const FENCE_DEADLINE: Duration = Duration::from_secs(30);

/// What the hypervisor driver needs to instantiate a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSpec {
    pub uuid: String,
    pub name: String,
    /// Opaque domain definition; the core never interprets it.
    pub definition_xml: String,
}

impl DomainSpec {
    pub fn new(
        uuid: impl Into<String>,
        name: impl Into<String>,
        definition_xml: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            definition_xml: definition_xml.into(),
        }
    }
}

/// Actual runtime state of a domain as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainRuntimeState {
    Running,
    Stopped,
    Paused,
    Crashed,
    Unknown,
}

/// Name of the Linux bridge carrying a network's VNI. Shared between the
/// network controller (which binds gateway addresses to it) and the
/// system backend (which creates it).
pub fn bridge_device(vni: u32) -> String {
    format!("vmbr{}", vni)
}

/// Management-controller credentials for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpmiCredentials {
    pub hostname: String,
    pub username: String,
    pub password: String,
}
