//! Node state machine.
//!
//! Owns this node's `daemon_state`, `coordinator_state`, and
//! `domain_state` and the legality of their transitions. Every local
//! transition funnels through here before being published to the node
//! record; the only writers that bypass this machine are the primary's
//! fencer and role transitions, which force-change *peer* records.

use std::sync::RwLock;

use tracing::info;

use pvc_common::ClusterError;
use pvc_kv::{KvStore, KvStoreExt};
use pvc_schema::{paths, CoordinatorState, DaemonState, DomainState, NodeRecord, NodeRole};

/// Snapshot of the three state fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub daemon_state: DaemonState,
    pub coordinator_state: CoordinatorState,
    pub domain_state: DomainState,
}

/// Whether a node may move its own daemon state from `from` to `to`.
///
/// `dead` and `fenced` are absent on purpose: a node never writes those
/// to itself.
pub fn daemon_transition_valid(from: DaemonState, to: DaemonState) -> bool {
    matches!(
        (from, to),
        (DaemonState::Stop, DaemonState::Init)
            | (DaemonState::Init, DaemonState::Run)
            | (DaemonState::Run, DaemonState::Stop)
            // A previously fenced node boots back through init.
            | (DaemonState::Dead, DaemonState::Init)
            | (DaemonState::Fenced, DaemonState::Init)
    )
}

/// Domain-state transitions: ready <-> flushing -> flushed -> unflushing -> ready.
pub fn domain_transition_valid(from: DomainState, to: DomainState) -> bool {
    matches!(
        (from, to),
        (DomainState::Ready, DomainState::Flushing)
            | (DomainState::Flushing, DomainState::Ready)
            | (DomainState::Flushing, DomainState::Flushed)
            | (DomainState::Flushed, DomainState::Unflushing)
            | (DomainState::Unflushing, DomainState::Ready)
    )
}

/// Coordinator-state transitions, including the transient takeover and
/// relinquish phases the primary passes through.
pub fn coordinator_transition_valid(from: CoordinatorState, to: CoordinatorState) -> bool {
    matches!(
        (from, to),
        (CoordinatorState::None, CoordinatorState::Secondary)
            | (CoordinatorState::Secondary, CoordinatorState::None)
            | (CoordinatorState::Secondary, CoordinatorState::Takeover)
            | (CoordinatorState::Takeover, CoordinatorState::Primary)
            | (CoordinatorState::Primary, CoordinatorState::Relinquish)
            | (CoordinatorState::Relinquish, CoordinatorState::Secondary)
    )
}

/// The state machine for this node.
pub struct NodeState {
    name: String,
    role: NodeRole,
    inner: RwLock<StateSnapshot>,
}

impl NodeState {
    pub fn new(name: impl Into<String>, role: NodeRole) -> Self {
        Self {
            name: name.into(),
            role,
            inner: RwLock::new(StateSnapshot {
                daemon_state: DaemonState::Stop,
                coordinator_state: CoordinatorState::None,
                domain_state: DomainState::Ready,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn snapshot(&self) -> StateSnapshot {
        *self.inner.read().unwrap()
    }

    /// Adopt the state found in an existing node record at startup. The
    /// daemon itself always restarts from `stop`; the domain state
    /// (flushed nodes stay flushed across restarts) is preserved.
    pub fn adopt(&self, record: &NodeRecord) {
        let mut inner = self.inner.write().unwrap();
        inner.domain_state = record.domain_state;
    }

    /// Move the daemon state, validating the transition, and publish.
    pub async fn transition_daemon(
        &self,
        kv: &dyn KvStore,
        to: DaemonState,
    ) -> Result<(), ClusterError> {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.daemon_state == to {
                return Ok(());
            }
            if !daemon_transition_valid(inner.daemon_state, to) {
                return Err(ClusterError::Invalid(format!(
                    "illegal daemon_state transition {} -> {}",
                    inner.daemon_state, to
                )));
            }
            info!(from = %inner.daemon_state, to = %to, "Daemon state transition");
            inner.daemon_state = to;
        }
        self.publish(kv).await
    }

    /// Move the domain state, validating the transition, and publish.
    pub async fn transition_domain(
        &self,
        kv: &dyn KvStore,
        to: DomainState,
    ) -> Result<(), ClusterError> {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.domain_state == to {
                return Ok(());
            }
            if !domain_transition_valid(inner.domain_state, to) {
                return Err(ClusterError::Invalid(format!(
                    "illegal domain_state transition {} -> {}",
                    inner.domain_state, to
                )));
            }
            info!(from = %inner.domain_state, to = %to, "Domain state transition");
            inner.domain_state = to;
        }
        self.publish(kv).await
    }

    /// Move the coordinator state and publish. Hypervisor-role nodes are
    /// pinned to `none`.
    pub async fn transition_coordinator(
        &self,
        kv: &dyn KvStore,
        to: CoordinatorState,
    ) -> Result<(), ClusterError> {
        if self.role == NodeRole::Hypervisor {
            return Err(ClusterError::Invalid(
                "hypervisor-role nodes hold no coordinator state".into(),
            ));
        }
        {
            let mut inner = self.inner.write().unwrap();
            if inner.coordinator_state == to {
                return Ok(());
            }
            if !coordinator_transition_valid(inner.coordinator_state, to) {
                return Err(ClusterError::Invalid(format!(
                    "illegal coordinator_state transition {} -> {}",
                    inner.coordinator_state, to
                )));
            }
            info!(from = %inner.coordinator_state, to = %to, "Coordinator state transition");
            inner.coordinator_state = to;
        }
        self.publish(kv).await
    }

    /// Write the current state fields into the node record, preserving
    /// the telemetry fields the keepalive engine owns.
    pub async fn publish(&self, kv: &dyn KvStore) -> Result<(), ClusterError> {
        let snapshot = self.snapshot();
        let path = paths::node(&self.name);

        let mut record = match kv.get_json::<NodeRecord>(&path).await? {
            Some((record, _)) => record,
            None => NodeRecord::new(self.role),
        };
        record.daemon_state = snapshot.daemon_state;
        record.coordinator_state = snapshot.coordinator_state;
        record.domain_state = snapshot.domain_state;
        kv.put_json(&path, &record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_daemon_transition_table() {
        assert!(daemon_transition_valid(DaemonState::Stop, DaemonState::Init));
        assert!(daemon_transition_valid(DaemonState::Init, DaemonState::Run));
        assert!(daemon_transition_valid(DaemonState::Run, DaemonState::Stop));
        assert!(daemon_transition_valid(DaemonState::Fenced, DaemonState::Init));

        // A node never writes dead or fenced to itself.
        assert!(!daemon_transition_valid(DaemonState::Run, DaemonState::Dead));
        assert!(!daemon_transition_valid(DaemonState::Run, DaemonState::Fenced));
        assert!(!daemon_transition_valid(DaemonState::Stop, DaemonState::Run));
    }

    #[test]
    fn test_domain_transition_table() {
        assert!(domain_transition_valid(DomainState::Ready, DomainState::Flushing));
        assert!(domain_transition_valid(DomainState::Flushing, DomainState::Flushed));
        assert!(domain_transition_valid(DomainState::Flushing, DomainState::Ready));
        assert!(domain_transition_valid(DomainState::Flushed, DomainState::Unflushing));
        assert!(domain_transition_valid(DomainState::Unflushing, DomainState::Ready));

        assert!(!domain_transition_valid(DomainState::Ready, DomainState::Flushed));
        assert!(!domain_transition_valid(DomainState::Flushed, DomainState::Ready));
    }

    #[test]
    fn test_coordinator_transition_table() {
        assert!(coordinator_transition_valid(
            CoordinatorState::Secondary,
            CoordinatorState::Takeover
        ));
        assert!(coordinator_transition_valid(
            CoordinatorState::Takeover,
            CoordinatorState::Primary
        ));
        assert!(coordinator_transition_valid(
            CoordinatorState::Primary,
            CoordinatorState::Relinquish
        ));

        // No shortcut straight to primary.
        assert!(!coordinator_transition_valid(
            CoordinatorState::Secondary,
            CoordinatorState::Primary
        ));
        assert!(!coordinator_transition_valid(
            CoordinatorState::None,
            CoordinatorState::Primary
        ));
    }

    #[tokio::test]
    async fn test_transitions_publish_to_kv() {
        let kv = Arc::new(pvc_kv::MemoryKv::new());
        let state = NodeState::new("hv1", NodeRole::Coordinator);

        state
            .transition_daemon(kv.as_ref(), DaemonState::Init)
            .await
            .unwrap();
        state
            .transition_daemon(kv.as_ref(), DaemonState::Run)
            .await
            .unwrap();

        let (record, _) = kv
            .get_json::<NodeRecord>(&paths::node("hv1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.daemon_state, DaemonState::Run);

        let err = state
            .transition_daemon(kv.as_ref(), DaemonState::Fenced)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_hypervisor_role_has_no_coordinator_state() {
        let kv = Arc::new(pvc_kv::MemoryKv::new());
        let state = NodeState::new("hv9", NodeRole::Hypervisor);
        let err = state
            .transition_coordinator(kv.as_ref(), CoordinatorState::Secondary)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Invalid(_)));
    }
}
