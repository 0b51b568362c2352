//! Network records.

use serde::{Deserialize, Serialize};

/// Network type: VLAN-bridged onto the uplink, or VXLAN-managed with a
/// cluster-owned gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Bridged,
    Managed,
}

/// DHCP lease range for a managed network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpRange {
    pub enabled: bool,
    pub start: String,
    pub end: String,
}

/// A fixed address assignment keyed by MAC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticLease {
    pub mac: String,
    pub ip: String,
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Firewall rule applied at the network gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclRule {
    /// `in` or `out` relative to the network.
    pub direction: String,
    /// Evaluation order, ascending.
    pub order: u32,
    pub description: String,
    pub rule: String,
}

/// The `networks/<vni>` record. The VNI is the key and must be unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub vni: u32,
    #[serde(rename = "type")]
    pub net_type: NetworkType,
    pub description: String,
    /// IPv4 subnet in CIDR form, when configured.
    #[serde(default)]
    pub ip4_network: Option<String>,
    /// Gateway address; for managed networks, held by the primary only.
    #[serde(default)]
    pub ip4_gateway: Option<String>,
    #[serde(default)]
    pub ip6_network: Option<String>,
    #[serde(default)]
    pub ip6_gateway: Option<String>,
    #[serde(default)]
    pub dhcp4: Option<DhcpRange>,
    #[serde(default)]
    pub static_leases: Vec<StaticLease>,
    #[serde(default)]
    pub acls: Vec<AclRule>,
}

impl NetworkRecord {
    pub fn bridged(vni: u32, description: impl Into<String>) -> Self {
        Self {
            vni,
            net_type: NetworkType::Bridged,
            description: description.into(),
            ip4_network: None,
            ip4_gateway: None,
            ip6_network: None,
            ip6_gateway: None,
            dhcp4: None,
            static_leases: Vec::new(),
            acls: Vec::new(),
        }
    }

    pub fn managed(
        vni: u32,
        description: impl Into<String>,
        ip4_network: impl Into<String>,
        ip4_gateway: impl Into<String>,
    ) -> Self {
        Self {
            vni,
            net_type: NetworkType::Managed,
            description: description.into(),
            ip4_network: Some(ip4_network.into()),
            ip4_gateway: Some(ip4_gateway.into()),
            ip6_network: None,
            ip6_gateway: None,
            dhcp4: None,
            static_leases: Vec::new(),
            acls: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tag_serialization() {
        let net = NetworkRecord::bridged(200, "lab");
        let json = serde_json::to_string(&net).unwrap();
        assert!(json.contains("\"type\":\"bridged\""));

        let net = NetworkRecord::managed(300, "tenant", "10.30.0.0/24", "10.30.0.1");
        let back: NetworkRecord =
            serde_json::from_str(&serde_json::to_string(&net).unwrap()).unwrap();
        assert_eq!(back.net_type, NetworkType::Managed);
        assert_eq!(back.ip4_gateway.as_deref(), Some("10.30.0.1"));
    }
}
