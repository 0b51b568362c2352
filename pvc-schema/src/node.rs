//! Node identity and runtime state records.

use serde::{Deserialize, Serialize};

/// Role of a node, fixed at bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Eligible to hold the primary lease and run cluster-wide services.
    Coordinator,
    /// Runs VMs only.
    Hypervisor,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Coordinator => write!(f, "coordinator"),
            NodeRole::Hypervisor => write!(f, "hypervisor"),
        }
    }
}

/// Daemon lifecycle state.
///
/// A node self-transitions stop -> init -> run during startup. `dead` is
/// written only by the primary's fencer when the peer is stale, and
/// `fenced` only after the fence driver confirms a power reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Stop,
    Init,
    Run,
    Dead,
    Fenced,
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DaemonState::Stop => "stop",
            DaemonState::Init => "init",
            DaemonState::Run => "run",
            DaemonState::Dead => "dead",
            DaemonState::Fenced => "fenced",
        };
        write!(f, "{}", s)
    }
}

/// Coordinator role state.
///
/// `takeover` and `relinquish` are transient values published during
/// primary transitions so health plugins can suppress spurious alarms
/// while cluster services move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorState {
    Primary,
    Secondary,
    None,
    Takeover,
    Relinquish,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CoordinatorState::Primary => "primary",
            CoordinatorState::Secondary => "secondary",
            CoordinatorState::None => "none",
            CoordinatorState::Takeover => "takeover",
            CoordinatorState::Relinquish => "relinquish",
        };
        write!(f, "{}", s)
    }
}

/// Domain hosting state: whether this node accepts and runs VMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Ready,
    Flushing,
    Flushed,
    Unflushing,
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DomainState::Ready => "ready",
            DomainState::Flushing => "flushing",
            DomainState::Flushed => "flushed",
            DomainState::Unflushing => "unflushing",
        };
        write!(f, "{}", s)
    }
}

/// Per-network addresses of a node, published once at startup under
/// `nodes/<name>/addrs`. Peers use the cluster address for live
/// migration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeAddresses {
    pub upstream: String,
    pub cluster: String,
    pub storage: String,
}

/// Result of one health plugin run, published with the keepalive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginReport {
    pub name: String,
    /// Health points deducted by this plugin (0 = healthy).
    pub delta: u32,
    pub message: String,
    /// Set when the plugin exceeded its share of the keepalive budget;
    /// a timed-out plugin contributes no delta.
    pub timed_out: bool,
}

/// The `nodes/<name>` record: identity plus runtime telemetry.
///
/// The owning daemon is the sole writer, except for `daemon_state` and
/// `coordinator_state` which the primary force-changes during fencing and
/// role transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub role: NodeRole,
    pub daemon_state: DaemonState,
    pub coordinator_state: CoordinatorState,
    pub domain_state: DomainState,
    /// Epoch-milliseconds of the last keepalive publish. Peers never
    /// compare this against their own clocks; staleness is judged from
    /// locally observed change times.
    pub keepalive_ts: i64,
    pub load: f64,
    /// Memory figures in MiB.
    pub mem_total: u64,
    pub mem_used: u64,
    pub mem_allocated: u64,
    pub vcpus_allocated: u32,
    pub vm_count: u32,
    /// Sum of plugin deltas; node health is `100 - health_delta`.
    pub health_delta: u32,
    #[serde(default)]
    pub plugin_results: Vec<PluginReport>,
}

impl NodeRecord {
    /// A freshly bootstrapped record for a node that has not yet started.
    pub fn new(role: NodeRole) -> Self {
        Self {
            role,
            daemon_state: DaemonState::Stop,
            coordinator_state: CoordinatorState::None,
            domain_state: DomainState::Ready,
            keepalive_ts: 0,
            load: 0.0,
            mem_total: 0,
            mem_used: 0,
            mem_allocated: 0,
            vcpus_allocated: 0,
            vm_count: 0,
            health_delta: 0,
            plugin_results: Vec::new(),
        }
    }

    /// Node health percentage derived from the plugin deltas.
    pub fn health(&self) -> u32 {
        100u32.saturating_sub(self.health_delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_saturates() {
        let mut record = NodeRecord::new(NodeRole::Hypervisor);
        record.health_delta = 250;
        assert_eq!(record.health(), 0);
        record.health_delta = 30;
        assert_eq!(record.health(), 70);
    }

    #[test]
    fn test_state_serialization_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&DaemonState::Run).unwrap(),
            "\"run\""
        );
        assert_eq!(
            serde_json::to_string(&CoordinatorState::Takeover).unwrap(),
            "\"takeover\""
        );
        assert_eq!(
            serde_json::to_string(&DomainState::Unflushing).unwrap(),
            "\"unflushing\""
        );
    }
}
