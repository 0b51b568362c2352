//! Configuration management for the node daemon.
//!
//! The per-node document is YAML; every section has defaults so a minimal
//! file only names the node and its coordinators. Validation enforces the
//! combinations the cluster refuses to run with.

use anyhow::{Context as AnyhowContext, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use pvc_drivers::IpmiCredentials;
use pvc_schema::{NodeRole, TargetSelector};

use crate::cli::Args;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity
    pub node: NodeIdentityConfig,
    /// Cluster topology: coordinators and the three physical networks
    pub cluster: ClusterConfig,
    /// Timer intervals
    pub timers: TimerConfig,
    /// Fencing behaviour
    pub fencing: FencingConfig,
    /// Placement defaults
    pub migration: MigrationConfig,
    /// Logging toggles and bounded buffers
    pub logging: LoggingConfig,
    /// Directory scanned for armed health probes
    pub plugin_directory: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeIdentityConfig::default(),
            cluster: ClusterConfig::default(),
            timers: TimerConfig::default(),
            fencing: FencingConfig::default(),
            migration: MigrationConfig::default(),
            logging: LoggingConfig::default(),
            plugin_directory: "/etc/pvc/plugins".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref name) = args.node_name {
            self.node.name = Some(name.clone());
        }
        self
    }

    /// Reject configurations the cluster must not run with.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.coordinators.is_empty() {
            return Err(anyhow::anyhow!("cluster.coordinators must not be empty"));
        }
        if self.node.role == NodeRole::Coordinator
            && !self.cluster.coordinators.contains(&self.node_name())
        {
            return Err(anyhow::anyhow!(
                "node {} has role coordinator but is not listed in cluster.coordinators",
                self.node_name()
            ));
        }
        // Migrating VMs off a peer whose fence failed is only survivable
        // if that peer is guaranteed to have reset itself.
        if self.fencing.actions.failed_fence == FenceAction::Migrate
            && self.fencing.suicide_intervals == 0
        {
            return Err(anyhow::anyhow!(
                "fencing.actions.failed_fence=migrate requires fencing.suicide_intervals > 0"
            ));
        }
        if self.timers.keepalive_interval == 0 {
            return Err(anyhow::anyhow!("timers.keepalive_interval must be > 0"));
        }
        if self.fencing.fence_intervals == 0 {
            return Err(anyhow::anyhow!("fencing.fence_intervals must be > 0"));
        }
        Ok(())
    }

    /// Node name: configured, or the host name.
    pub fn node_name(&self) -> String {
        self.node.name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.timers.keepalive_interval)
    }

    pub fn vm_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.timers.vm_shutdown_timeout)
    }

    /// Age at which a peer becomes suspect.
    pub fn suspect_age(&self) -> Duration {
        self.keepalive_interval() * self.fencing.fence_intervals
    }

    /// Age at which a peer is confirmed dead. The extra six ticks are the
    /// saving throw beyond `fence_intervals`.
    pub fn dead_age(&self) -> Duration {
        self.keepalive_interval() * (self.fencing.fence_intervals + 6)
    }

    /// Whether cluster and storage collapse onto one device and address;
    /// the floating IP is then bound once.
    pub fn collapsed_cluster_storage(&self) -> bool {
        let c = &self.cluster.networks.cluster;
        let s = &self.cluster.networks.storage;
        c.device == s.device && c.address == s.address
    }

    /// The floating (device, address) pairs the primary binds, deduplicated
    /// for collapsed networks.
    pub fn floating_addresses(&self) -> Vec<(String, String)> {
        let nets = &self.cluster.networks;
        let mut out = vec![(
            nets.upstream.device.clone(),
            nets.upstream.floating_ip.clone(),
        )];
        out.push((nets.cluster.device.clone(), nets.cluster.floating_ip.clone()));
        if !self.collapsed_cluster_storage() {
            out.push((nets.storage.device.clone(), nets.storage.floating_ip.clone()));
        }
        out.retain(|(_, addr)| !addr.is_empty());
        out.dedup();
        out
    }

    pub fn ipmi_credentials(&self) -> IpmiCredentials {
        IpmiCredentials {
            hostname: self.fencing.ipmi.hostname.clone(),
            username: self.fencing.ipmi.username.clone(),
            password: self.fencing.ipmi.password.clone(),
        }
    }
}

/// Node identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeIdentityConfig {
    /// Node name (host name if not set)
    pub name: Option<String>,
    /// coordinator | hypervisor
    pub role: NodeRole,
}

impl Default for NodeIdentityConfig {
    fn default() -> Self {
        Self {
            name: None,
            role: NodeRole::Coordinator,
        }
    }
}

/// Cluster topology.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Names of the coordinator nodes (hosts of the KV service)
    pub coordinators: Vec<String>,
    pub networks: ClusterNetworks,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            coordinators: Vec::new(),
            networks: ClusterNetworks::default(),
        }
    }
}

/// The three physical networks every node attaches to.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ClusterNetworks {
    pub upstream: NetworkLink,
    pub cluster: NetworkLink,
    pub storage: NetworkLink,
}

/// One physical network attachment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkLink {
    pub device: String,
    pub mtu: u32,
    /// This node's address on the network, CIDR form
    pub address: String,
    /// Address the primary binds, CIDR form
    pub floating_ip: String,
}

impl Default for NetworkLink {
    fn default() -> Self {
        Self {
            device: String::new(),
            mtu: 1500,
            address: String::new(),
            floating_ip: String::new(),
        }
    }
}

/// Timer intervals, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub keepalive_interval: u64,
    pub vm_shutdown_timeout: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: 5,
            vm_shutdown_timeout: 180,
        }
    }
}

/// Fencing behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FencingConfig {
    /// Missed keepalives before a peer is suspect
    pub fence_intervals: u32,
    /// Missed self-publishes before the node hard-resets itself;
    /// 0 disables the suicide path entirely
    pub suicide_intervals: u32,
    pub actions: FenceActions,
    pub ipmi: IpmiConfig,
}

impl Default for FencingConfig {
    fn default() -> Self {
        Self {
            fence_intervals: 6,
            suicide_intervals: 0,
            actions: FenceActions::default(),
            ipmi: IpmiConfig::default(),
        }
    }
}

/// What to do after a fence attempt.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FenceActions {
    pub successful_fence: FenceAction,
    pub failed_fence: FenceAction,
}

impl Default for FenceActions {
    fn default() -> Self {
        Self {
            successful_fence: FenceAction::Migrate,
            failed_fence: FenceAction::None,
        }
    }
}

/// Post-fence action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FenceAction {
    /// Recover the peer's VMs onto surviving nodes
    Migrate,
    /// Leave the peer's VMs down
    None,
}

/// Management-controller access for this node.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct IpmiConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

/// Placement defaults.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MigrationConfig {
    /// Cluster-wide default selector; VMs may override per-record
    pub target_selector: TargetSelector,
}

/// Logging toggles and bounded buffers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Maximum console log lines retained per VM
    pub console_log_lines: usize,
    /// When set, a JSON copy of the log is appended here
    pub json_log_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            console_log_lines: 1000,
            json_log_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(node: &str) -> Config {
        let mut config = Config::default();
        config.node.name = Some(node.to_string());
        config.cluster.coordinators = vec![node.to_string()];
        config
    }

    #[test]
    fn test_defaults_are_sane() {
        let config = minimal("hv1");
        assert!(config.validate().is_ok());
        assert_eq!(config.timers.keepalive_interval, 5);
        assert_eq!(config.timers.vm_shutdown_timeout, 180);
        assert_eq!(config.fencing.fence_intervals, 6);
        assert_eq!(config.fencing.suicide_intervals, 0);
        assert_eq!(config.dead_age(), Duration::from_secs(5 * 12));
    }

    #[test]
    fn test_failed_fence_migrate_requires_suicide() {
        let mut config = minimal("hv1");
        config.fencing.actions.failed_fence = FenceAction::Migrate;
        assert!(config.validate().is_err());

        config.fencing.suicide_intervals = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_coordinator_must_be_listed() {
        let mut config = minimal("hv1");
        config.cluster.coordinators = vec!["hv2".to_string()];
        assert!(config.validate().is_err());

        config.node.role = NodeRole::Hypervisor;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_collapsed_networks_bind_floating_once() {
        let mut config = minimal("hv1");
        let nets = &mut config.cluster.networks;
        nets.upstream.device = "eth0".into();
        nets.upstream.floating_ip = "192.0.2.10/24".into();
        nets.cluster.device = "eth1".into();
        nets.cluster.address = "10.0.1.1/24".into();
        nets.cluster.floating_ip = "10.0.1.254/24".into();
        nets.storage.device = "eth1".into();
        nets.storage.address = "10.0.1.1/24".into();
        nets.storage.floating_ip = "10.0.1.254/24".into();

        assert!(config.collapsed_cluster_storage());
        let floating = config.floating_addresses();
        assert_eq!(floating.len(), 2);

        // Separate storage network gets its own binding.
        config.cluster.networks.storage.address = "10.0.2.1/24".into();
        config.cluster.networks.storage.device = "eth2".into();
        config.cluster.networks.storage.floating_ip = "10.0.2.254/24".into();
        assert!(!config.collapsed_cluster_storage());
        assert_eq!(config.floating_addresses().len(), 3);
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
node:
  name: hv1
  role: coordinator
cluster:
  coordinators: [hv1, hv2, hv3]
  networks:
    upstream:
      device: eth0
      floating_ip: 192.0.2.10/24
timers:
  keepalive_interval: 5
fencing:
  fence_intervals: 6
  actions:
    successful_fence: migrate
    failed_fence: none
migration:
  target_selector: memprov
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.node_name(), "hv1");
        assert_eq!(config.cluster.coordinators.len(), 3);
        assert_eq!(
            config.migration.target_selector,
            TargetSelector::Memprov
        );
        assert!(config.validate().is_ok());
    }
}
