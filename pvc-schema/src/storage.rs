//! Replicated block storage records.

use serde::{Deserialize, Serialize};

/// OSD lifecycle state as tracked in the cluster tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsdState {
    Bootstrapping,
    Up,
    Down,
    Failed,
}

/// The `storage/osd/<id>` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsdRecord {
    pub id: u32,
    /// Node hosting the OSD's backing device.
    pub node: String,
    pub device: String,
    pub weight: f64,
    pub state: OsdState,
}

/// The `storage/pool/<name>` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    pub name: String,
    pub replicas: u32,
    #[serde(default)]
    pub volume_count: u32,
}

/// The `storage/volume/<pool>/<name>` record.
///
/// A running VM holds an exclusive lock on each of its volumes; the lock
/// names the node currently using the volume and must be cleared before
/// any other node may open it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub pool: String,
    pub name: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub lock_holder: Option<String>,
}

impl VolumeRecord {
    pub fn new(pool: impl Into<String>, name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
            size_bytes,
            lock_holder: None,
        }
    }
}

/// The `storage/snapshot/<pool>/<volume>/<name>` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub pool: String,
    pub volume: String,
    pub name: String,
}
