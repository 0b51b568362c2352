//! Task records: the request/response envelopes through which external
//! clients ask the cluster to perform work that crosses node boundaries.
//!
//! Tasks are an inbox. A controller claims a task by compare-and-setting
//! `claimed_by`, then advances `status` as the work proceeds. Every
//! externally triggered operation is answered through its task record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Administrative request carried by a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskRequest {
    /// Drain a node: live-migrate every owned VM away, then mark flushed.
    FlushNode { node: String },
    /// Return a flushed node to service and migrate its VMs back.
    UnflushNode { node: String },
    /// Trackable migration; records `previous_node` for later unmigrate.
    MigrateVm {
        uuid: String,
        /// Explicit target, or `None` to let the selector choose.
        target: Option<String>,
        #[serde(default)]
        force: bool,
    },
    /// Return a migrated VM to its previous node.
    UnmigrateVm { uuid: String },
    /// Permanent move; no `previous_node` tracking.
    MoveVm {
        uuid: String,
        target: Option<String>,
    },
    AddOsd {
        id: u32,
        node: String,
        device: String,
        weight: f64,
    },
    CreateVolume {
        pool: String,
        name: String,
        size_bytes: u64,
    },
    ResizeVolume {
        pool: String,
        name: String,
        size_bytes: u64,
    },
    DeleteVolume {
        pool: String,
        name: String,
    },
    SnapshotVolume {
        pool: String,
        name: String,
        snapshot: String,
    },
    /// Emitted by the cluster itself when a reconciliation step fails
    /// outside any client-initiated task (e.g. a VM start failure).
    ErrorReport { subject: String },
}

/// Task lifecycle status, visible to the requesting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Accepted,
    Running,
    Done,
    Failed,
}

/// The `tasks/<uuid>` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub request: TaskRequest,
    /// Node that claimed the task, set via compare-and-set.
    #[serde(default)]
    pub claimed_by: Option<String>,
    pub status: TaskStatus,
    /// Human-readable progress or failure message.
    #[serde(default)]
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(request: TaskRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            request,
            claimed_by: None,
            status: TaskStatus::Accepted,
            message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, TaskStatus::Accepted | TaskStatus::Running)
    }

    /// Advance the status with a message, refreshing `updated_at`.
    pub fn advance(&mut self, status: TaskStatus, message: impl Into<String>) {
        self.status = status;
        self.message = message.into();
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_tag_format() {
        let task = TaskRecord::new(TaskRequest::FlushNode { node: "hv1".into() });
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"op\":\"flush_node\""));

        let back: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request, TaskRequest::FlushNode { node: "hv1".into() });
        assert_eq!(back.status, TaskStatus::Accepted);
        assert!(back.is_open());
    }

    #[test]
    fn test_advance_closes_task() {
        let mut task = TaskRecord::new(TaskRequest::UnmigrateVm { uuid: "u1".into() });
        task.advance(TaskStatus::Done, "returned to hv1");
        assert!(!task.is_open());
        assert_eq!(task.message, "returned to hv1");
    }
}
