//! Layout of the cluster key-value tree.
//!
//! All durable state lives under a single root; these helpers are the only
//! place path strings are assembled, so the schema can evolve in one spot.
//!
//! ```text
//! cluster/config/...                      static, operator-managed
//! nodes/<name>                            NodeRecord
//! domains/<uuid>                          VmRecord
//! domains/<uuid>/console                  console log ring
//! networks/<vni>                          NetworkRecord
//! storage/osd/<id>                        OsdRecord
//! storage/pool/<name>                     PoolRecord
//! storage/volume/<pool>/<name>            VolumeRecord
//! storage/snapshot/<pool>/<vol>/<snap>    SnapshotRecord
//! tasks/<uuid>                            TaskRecord
//! election/primary                        leader-election path
//! ```

/// Prefix for operator-managed static configuration.
pub const CLUSTER_CONFIG: &str = "cluster/config";

/// Prefix for node records (trailing slash, for recursive watches).
pub const NODES: &str = "nodes/";

/// Prefix for VM records.
pub const DOMAINS: &str = "domains/";

/// Prefix for network records.
pub const NETWORKS: &str = "networks/";

/// Prefix for all storage records.
pub const STORAGE: &str = "storage/";

/// Prefix for task records.
pub const TASKS: &str = "tasks/";

/// The leader-election path for the primary coordinator lease.
pub const PRIMARY_ELECTION: &str = "election/primary";

pub fn node(name: &str) -> String {
    format!("nodes/{}", name)
}

/// Ephemeral presence key; vanishes with the daemon's session.
pub fn node_alive(name: &str) -> String {
    format!("nodes/{}/alive", name)
}

/// Management-controller credentials, published by the node at startup so
/// the primary's fencer can reach its controller.
pub fn node_ipmi(name: &str) -> String {
    format!("nodes/{}/ipmi", name)
}

/// Per-network addresses, published at startup; migration peers read the
/// cluster address from here.
pub fn node_addrs(name: &str) -> String {
    format!("nodes/{}/addrs", name)
}

pub fn domain(uuid: &str) -> String {
    format!("domains/{}", uuid)
}

/// Console log ring for a VM; lives beneath the VM record.
pub fn domain_console(uuid: &str) -> String {
    format!("domains/{}/console", uuid)
}

pub fn network(vni: u32) -> String {
    format!("networks/{}", vni)
}

pub fn osd(id: u32) -> String {
    format!("storage/osd/{}", id)
}

pub fn pool(name: &str) -> String {
    format!("storage/pool/{}", name)
}

pub fn volume(pool: &str, name: &str) -> String {
    format!("storage/volume/{}/{}", pool, name)
}

pub fn snapshot(pool: &str, volume: &str, name: &str) -> String {
    format!("storage/snapshot/{}/{}/{}", pool, volume, name)
}

pub fn task(uuid: &str) -> String {
    format!("tasks/{}", uuid)
}

/// Extract the node name from a `nodes/<name>` path.
pub fn node_name(path: &str) -> Option<&str> {
    path.strip_prefix("nodes/").filter(|rest| !rest.contains('/'))
}

/// Extract the VM uuid from a `domains/<uuid>` path. Returns `None` for
/// sub-keys such as the console ring.
pub fn domain_uuid(path: &str) -> Option<&str> {
    path.strip_prefix("domains/")
        .filter(|rest| !rest.contains('/'))
}

/// Extract the uuid from a `domains/<uuid>/console` path.
pub fn console_uuid(path: &str) -> Option<&str> {
    path.strip_prefix("domains/")?.strip_suffix("/console")
}

/// Extract the VNI from a `networks/<vni>` path.
pub fn network_vni(path: &str) -> Option<u32> {
    path.strip_prefix("networks/")?.parse().ok()
}

/// Extract the task uuid from a `tasks/<uuid>` path.
pub fn task_uuid(path: &str) -> Option<&str> {
    path.strip_prefix("tasks/").filter(|rest| !rest.contains('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_round_trips() {
        assert_eq!(node_name(&node("hv1")), Some("hv1"));
        assert_eq!(domain_uuid(&domain("abc-123")), Some("abc-123"));
        assert_eq!(console_uuid(&domain_console("abc-123")), Some("abc-123"));
        assert_eq!(network_vni(&network(100)), Some(100));
        assert_eq!(task_uuid(&task("t-1")), Some("t-1"));
    }

    #[test]
    fn test_console_is_not_a_domain_record() {
        assert_eq!(domain_uuid(&domain_console("abc-123")), None);
        assert_eq!(console_uuid(&domain("abc-123")), None);
    }

    #[test]
    fn test_node_name_rejects_subkeys() {
        assert_eq!(node_name("nodes/hv1/extra"), None);
    }
}
