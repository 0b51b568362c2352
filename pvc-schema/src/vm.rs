//! Virtual machine records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Desired state of a VM, written by external clients and consumed by the
/// placement controller on the owning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Start,
    Stop,
    Restart,
    Shutdown,
    Disable,
    Migrate,
    Unmigrate,
    Provision,
    Fail,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmState::Start => "start",
            VmState::Stop => "stop",
            VmState::Restart => "restart",
            VmState::Shutdown => "shutdown",
            VmState::Disable => "disable",
            VmState::Migrate => "migrate",
            VmState::Unmigrate => "unmigrate",
            VmState::Provision => "provision",
            VmState::Fail => "fail",
        };
        write!(f, "{}", s)
    }
}

/// How a VM may be moved between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMethod {
    /// Live migration over the cluster network.
    #[default]
    Live,
    /// The guest cannot survive live migration; stop here, start there.
    Shutdown,
}

/// Target-selection algorithm for placement decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetSelector {
    /// Least memory allocated to running VMs.
    #[default]
    Mem,
    /// Least memory allocated plus provisioned (powered-off) VM memory.
    Memprov,
    /// Least system load.
    Load,
    /// Least vCPUs allocated.
    Vcpus,
    /// Fewest VMs.
    Vms,
}

impl std::fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TargetSelector::Mem => "mem",
            TargetSelector::Memprov => "memprov",
            TargetSelector::Load => "load",
            TargetSelector::Vcpus => "vcpus",
            TargetSelector::Vms => "vms",
        };
        write!(f, "{}", s)
    }
}

/// Reference to a block volume backing a VM disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    pub pool: String,
    pub name: String,
}

/// Placement metadata attached to a VM.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VmMeta {
    /// Nodes this VM may run on; empty means any.
    #[serde(default)]
    pub node_limit: Vec<String>,
    /// Per-VM selector override; falls back to the cluster default.
    #[serde(default)]
    pub selector: Option<TargetSelector>,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub migration_method: MigrationMethod,
}

/// The `domains/<uuid>` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    /// Opaque domain definition (XML blob) handed to the hypervisor driver.
    pub definition: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: VmMeta,
    pub state: VmState,
    /// Current owning node.
    pub node: String,
    /// Set while `state == migrate`; names the node the VM came from.
    #[serde(default)]
    pub previous_node: Option<String>,
    /// Set when the last migrate used `force`; an unmigrate then leaves
    /// `previous_node` in place.
    #[serde(default)]
    pub migration_forced: bool,
    /// Migration serialization token, `source:target`, CAS-claimed by the
    /// source node while a transfer for this VM is in flight.
    #[serde(default)]
    pub migrating: Option<String>,
    /// Block volumes backing this VM's disks; each carries an exclusive
    /// lock bound to the running node.
    #[serde(default)]
    pub volumes: Vec<VolumeRef>,
    /// Maximum memory in MiB, used for allocation accounting and the
    /// memprov selector.
    pub memory_mib: u64,
    pub vcpus: u32,
}

impl VmRecord {
    pub fn new(name: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: String::new(),
            profile: None,
            tags: Vec::new(),
            meta: VmMeta::default(),
            state: VmState::Stop,
            node: node.into(),
            previous_node: None,
            migration_forced: false,
            migrating: None,
            volumes: Vec::new(),
            memory_mib: 2048,
            vcpus: 2,
        }
    }

    pub fn with_state(mut self, state: VmState) -> Self {
        self.state = state;
        self
    }

    pub fn with_memory(mut self, memory_mib: u64) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    pub fn with_definition(mut self, xml: impl Into<String>) -> Self {
        self.definition = xml.into();
        self
    }

    pub fn with_volume(mut self, pool: impl Into<String>, name: impl Into<String>) -> Self {
        self.volumes.push(VolumeRef {
            pool: pool.into(),
            name: name.into(),
        });
        self
    }

    /// Whether `node` is an allowed placement for this VM.
    pub fn node_allowed(&self, node: &str) -> bool {
        self.meta.node_limit.is_empty() || self.meta.node_limit.iter().any(|n| n == node)
    }

    /// The selector used for this VM, given the cluster default.
    pub fn selector_or(&self, default: TargetSelector) -> TargetSelector {
        self.meta.selector.unwrap_or(default)
    }
}

/// Generate a fresh VM uuid.
pub fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_allowed() {
        let mut vm = VmRecord::new("web1", "hv1");
        assert!(vm.node_allowed("hv1"));
        assert!(vm.node_allowed("hv9"));

        vm.meta.node_limit = vec!["hv1".into(), "hv2".into()];
        assert!(vm.node_allowed("hv2"));
        assert!(!vm.node_allowed("hv9"));
    }

    #[test]
    fn test_selector_fallback() {
        let mut vm = VmRecord::new("web1", "hv1");
        assert_eq!(vm.selector_or(TargetSelector::Load), TargetSelector::Load);
        vm.meta.selector = Some(TargetSelector::Vms);
        assert_eq!(vm.selector_or(TargetSelector::Load), TargetSelector::Vms);
    }

    #[test]
    fn test_record_round_trip() {
        let vm = VmRecord::new("web1", "hv1")
            .with_state(VmState::Start)
            .with_memory(4096)
            .with_vcpus(4);
        let json = serde_json::to_string(&vm).unwrap();
        let back: VmRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "web1");
        assert_eq!(back.state, VmState::Start);
        assert_eq!(back.memory_mib, 4096);
    }
}
