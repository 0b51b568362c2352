//! In-process KV backend.
//!
//! Implements the full [`KvStore`](crate::KvStore) contract against a
//! versioned in-memory map: linearizable per-key operations, recursive
//! watches, TTL sessions with ephemeral keys, and FIFO leader election.
//! This backend runs in `--dev` mode and underneath the test suite; the
//! production deployment points the same trait at the external
//! coordination service hosted on the coordinator set.
//!
//! Test hooks (`set_available`, `kill_session`) simulate the two failure
//! classes the facade distinguishes: recoverable disconnection and fatal
//! session loss.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{KvError, Result};
use crate::{KvStore, LeadershipHandle, SessionHandle, Versioned, WatchEvent, WatchStream};

const EVENT_QUEUE_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    version: u64,
    /// Set for ephemeral keys; the owning session.
    session: Option<u64>,
}

struct SessionState {
    ttl: Duration,
    last_heartbeat: Instant,
    expired_tx: watch::Sender<bool>,
}

struct Candidate {
    id: u64,
    session: u64,
    identity: String,
    leader_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, Entry>,
    next_version: u64,
    next_session: u64,
    next_candidate: u64,
    sessions: HashMap<u64, SessionState>,
    /// Election queues, head = current leader.
    elections: HashMap<String, Vec<Candidate>>,
}

struct Shared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<WatchEvent>,
    available_tx: watch::Sender<bool>,
}

/// The in-memory store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryKv {
    shared: Arc<Shared>,
}

impl MemoryKv {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        let (available_tx, _) = watch::channel(true);
        info!("Creating in-memory KV backend");
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                events,
                available_tx,
            }),
        }
    }

    /// Simulate connection loss/recovery. While unavailable every
    /// operation fails and session heartbeats stop, so sessions expire
    /// after their TTL.
    pub fn set_available(&self, available: bool) {
        info!(available = available, "KV availability changed");
        let _ = self.shared.available_tx.send(available);
    }

    /// Forcibly expire a session, as if its heartbeats were lost.
    pub fn kill_session(&self, session_id: u64) {
        let mut inner = self.shared.inner.lock().unwrap();
        Shared::expire_session(&mut inner, &self.shared.events, session_id);
    }

    /// Snapshot of the whole tree, for invariant checks in tests.
    pub fn dump(&self) -> Vec<(String, String)> {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .data
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    fn check_available(&self) -> Result<()> {
        if *self.shared.available_tx.borrow() {
            Ok(())
        } else {
            Err(KvError::Unavailable)
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn bump(inner: &mut Inner) -> u64 {
        inner.next_version += 1;
        inner.next_version
    }

    fn emit_put(events: &broadcast::Sender<WatchEvent>, path: &str, value: &str, version: u64) {
        let _ = events.send(WatchEvent {
            path: path.to_string(),
            value: Some(Versioned {
                value: value.to_string(),
                version,
            }),
            version,
        });
    }

    fn emit_delete(events: &broadcast::Sender<WatchEvent>, path: &str, version: u64) {
        let _ = events.send(WatchEvent {
            path: path.to_string(),
            value: None,
            version,
        });
    }

    fn write(
        inner: &mut Inner,
        events: &broadcast::Sender<WatchEvent>,
        path: &str,
        value: &str,
        session: Option<u64>,
    ) -> u64 {
        let version = Self::bump(inner);
        inner.data.insert(
            path.to_string(),
            Entry {
                value: value.to_string(),
                version,
                session,
            },
        );
        Self::emit_put(events, path, value, version);
        version
    }

    fn remove(inner: &mut Inner, events: &broadcast::Sender<WatchEvent>, path: &str) -> bool {
        if inner.data.remove(path).is_some() {
            let version = Self::bump(inner);
            Self::emit_delete(events, path, version);
            true
        } else {
            false
        }
    }

    /// Remove a session and everything bound to it: ephemeral keys go
    /// away, its candidacies are withdrawn, and any leadership it held
    /// passes on.
    fn expire_session(inner: &mut Inner, events: &broadcast::Sender<WatchEvent>, session_id: u64) {
        let Some(state) = inner.sessions.remove(&session_id) else {
            return;
        };
        warn!(session_id = session_id, "KV session expired");
        let _ = state.expired_tx.send(true);

        let ephemeral: Vec<String> = inner
            .data
            .iter()
            .filter(|(_, e)| e.session == Some(session_id))
            .map(|(k, _)| k.clone())
            .collect();
        for path in ephemeral {
            Self::remove(inner, events, &path);
        }

        let paths: Vec<String> = inner.elections.keys().cloned().collect();
        for path in paths {
            Self::withdraw_candidates(inner, events, &path, |c| c.session == session_id);
        }
    }

    /// Remove matching candidates from one election queue, promoting the
    /// next in line when the head is removed.
    fn withdraw_candidates<F>(
        inner: &mut Inner,
        events: &broadcast::Sender<WatchEvent>,
        path: &str,
        predicate: F,
    ) where
        F: Fn(&Candidate) -> bool,
    {
        let Some(queue) = inner.elections.get_mut(path) else {
            return;
        };
        let head_removed = queue.first().map(|c| predicate(c)).unwrap_or(false);
        queue.retain(|c| {
            if predicate(c) {
                let _ = c.leader_tx.send(false);
                false
            } else {
                true
            }
        });

        if head_removed {
            let next = inner
                .elections
                .get(path)
                .and_then(|q| q.first())
                .map(|c| (c.identity.clone(), c.session));
            match next {
                Some((identity, session)) => {
                    debug!(path = %path, leader = %identity, "Leadership passed to next candidate");
                    Self::write(inner, events, path, &identity, Some(session));
                    if let Some(c) = inner.elections.get(path).and_then(|q| q.first()) {
                        let _ = c.leader_tx.send(true);
                    }
                }
                None => {
                    Self::remove(inner, events, path);
                }
            }
        }

        if inner
            .elections
            .get(path)
            .map(|q| q.is_empty())
            .unwrap_or(false)
        {
            inner.elections.remove(path);
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, path: &str) -> Result<Option<Versioned>> {
        self.check_available()?;
        let inner = self.shared.inner.lock().unwrap();
        Ok(inner.data.get(path).map(|e| Versioned {
            value: e.value.clone(),
            version: e.version,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        self.check_available()?;
        let inner = self.shared.inner.lock().unwrap();
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| {
                (
                    k.clone(),
                    Versioned {
                        value: e.value.clone(),
                        version: e.version,
                    },
                )
            })
            .collect())
    }

    async fn put(&self, path: &str, value: &str) -> Result<u64> {
        self.check_available()?;
        let mut inner = self.shared.inner.lock().unwrap();
        Ok(Shared::write(
            &mut inner,
            &self.shared.events,
            path,
            value,
            None,
        ))
    }

    async fn cas(&self, path: &str, expected: Option<u64>, value: &str) -> Result<u64> {
        self.check_available()?;
        let mut inner = self.shared.inner.lock().unwrap();
        let actual = inner.data.get(path).map(|e| e.version);
        if actual != expected {
            return Err(KvError::CasMismatch {
                path: path.to_string(),
                expected,
                actual,
            });
        }
        Ok(Shared::write(
            &mut inner,
            &self.shared.events,
            path,
            value,
            None,
        ))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_available()?;
        let mut inner = self.shared.inner.lock().unwrap();
        if Shared::remove(&mut inner, &self.shared.events, path) {
            Ok(())
        } else {
            Err(KvError::NotFound(path.to_string()))
        }
    }

    async fn watch(&self, prefix: &str, recursive: bool) -> Result<WatchStream> {
        Ok(WatchStream::new(
            self.shared.events.subscribe(),
            prefix,
            recursive,
        ))
    }

    async fn session(&self, ttl: Duration) -> Result<SessionHandle> {
        self.check_available()?;
        let (expired_tx, expired_rx) = watch::channel(false);
        let (close_tx, close_rx) = oneshot::channel();

        let id = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.next_session += 1;
            let id = inner.next_session;
            inner.sessions.insert(
                id,
                SessionState {
                    ttl,
                    last_heartbeat: Instant::now(),
                    expired_tx,
                },
            );
            id
        };
        debug!(session_id = id, ttl_secs = ttl.as_secs(), "Session opened");

        // Heartbeat at ttl/3; a heartbeat only lands while the store is
        // available, so a long disconnection expires the session.
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(ttl / 3);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut close_rx = close_rx;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let mut inner = shared.inner.lock().unwrap();
                        let Some(state) = inner.sessions.get_mut(&id) else {
                            break;
                        };
                        if *shared.available_tx.borrow() {
                            state.last_heartbeat = Instant::now();
                        } else if state.last_heartbeat.elapsed() >= state.ttl {
                            Shared::expire_session(&mut inner, &shared.events, id);
                            break;
                        }
                    }
                    _ = &mut close_rx => {
                        let mut inner = shared.inner.lock().unwrap();
                        Shared::expire_session(&mut inner, &shared.events, id);
                        break;
                    }
                }
            }
        });

        Ok(SessionHandle::new(id, ttl, expired_rx, close_tx))
    }

    async fn put_ephemeral(
        &self,
        session: &SessionHandle,
        path: &str,
        value: &str,
    ) -> Result<u64> {
        self.check_available()?;
        let mut inner = self.shared.inner.lock().unwrap();
        if !inner.sessions.contains_key(&session.id()) {
            return Err(KvError::SessionExpired);
        }
        Ok(Shared::write(
            &mut inner,
            &self.shared.events,
            path,
            value,
            Some(session.id()),
        ))
    }

    async fn acquire_leader(
        &self,
        session: &SessionHandle,
        path: &str,
        identity: &str,
    ) -> Result<LeadershipHandle> {
        self.check_available()?;
        let (leader_tx, leader_rx) = watch::channel(false);
        let (release_tx, release_rx) = oneshot::channel();

        let candidate_id = {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.sessions.contains_key(&session.id()) {
                return Err(KvError::SessionExpired);
            }
            inner.next_candidate += 1;
            let candidate_id = inner.next_candidate;

            let queue = inner.elections.entry(path.to_string()).or_default();
            let first = queue.is_empty();
            queue.push(Candidate {
                id: candidate_id,
                session: session.id(),
                identity: identity.to_string(),
                leader_tx,
            });
            if first {
                debug!(path = %path, leader = %identity, "Leadership granted");
                let session_id = session.id();
                Shared::write(
                    &mut inner,
                    &self.shared.events,
                    path,
                    identity,
                    Some(session_id),
                );
                if let Some(c) = inner.elections.get(path).and_then(|q| q.first()) {
                    let _ = c.leader_tx.send(true);
                }
            }
            candidate_id
        };

        let shared = Arc::clone(&self.shared);
        let path = path.to_string();
        tokio::spawn(async move {
            // Fires on explicit release and on handle drop alike.
            let _ = release_rx.await;
            let mut inner = shared.inner.lock().unwrap();
            Shared::withdraw_candidates(&mut inner, &shared.events, &path, |c| {
                c.id == candidate_id
            });
        });

        Ok(LeadershipHandle::new(leader_rx, release_tx))
    }

    fn availability(&self) -> watch::Receiver<bool> {
        self.shared.available_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KvStoreExt;

    #[tokio::test]
    async fn test_put_get_versions_increase() {
        let kv = MemoryKv::new();
        let v1 = kv.put("nodes/hv1", "a").await.unwrap();
        let v2 = kv.put("nodes/hv1", "b").await.unwrap();
        assert!(v2 > v1);

        let current = kv.get("nodes/hv1").await.unwrap().unwrap();
        assert_eq!(current.value, "b");
        assert_eq!(current.version, v2);
        assert!(kv.get("nodes/hv2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cas_create_and_conflict() {
        let kv = MemoryKv::new();
        let v1 = kv.cas("tasks/t1", None, "req").await.unwrap();

        // Stale create attempt fails.
        let err = kv.cas("tasks/t1", None, "req2").await.unwrap_err();
        assert!(matches!(err, KvError::CasMismatch { .. }));

        // CAS on the right version succeeds.
        kv.cas("tasks/t1", Some(v1), "claimed").await.unwrap();

        // CAS on the old version now fails.
        let err = kv.cas("tasks/t1", Some(v1), "again").await.unwrap_err();
        assert!(matches!(err, KvError::CasMismatch { .. }));
    }

    #[tokio::test]
    async fn test_list_is_prefix_scoped_and_sorted() {
        let kv = MemoryKv::new();
        kv.put("domains/b", "2").await.unwrap();
        kv.put("domains/a", "1").await.unwrap();
        kv.put("networks/100", "n").await.unwrap();

        let entries = kv.list("domains/").await.unwrap();
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["domains/a", "domains/b"]);
    }

    #[tokio::test]
    async fn test_watch_delivers_and_dedups() {
        let kv = MemoryKv::new();
        let mut stream = kv.watch("domains/", true).await.unwrap();

        kv.put("domains/a", "1").await.unwrap();
        kv.put("networks/100", "n").await.unwrap();
        kv.put("domains/a", "2").await.unwrap();
        kv.delete("domains/a").await.unwrap();

        let first = stream.recv().await.unwrap();
        assert_eq!(first.path, "domains/a");
        assert_eq!(first.value.as_ref().unwrap().value, "1");

        let second = stream.recv().await.unwrap();
        assert_eq!(second.value.as_ref().unwrap().value, "2");

        let third = stream.recv().await.unwrap();
        assert!(third.value.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_blocks_operations() {
        let kv = MemoryKv::new();
        kv.put("nodes/hv1", "x").await.unwrap();
        kv.set_available(false);

        assert!(matches!(
            kv.get("nodes/hv1").await.unwrap_err(),
            KvError::Unavailable
        ));
        assert!(matches!(
            kv.put("nodes/hv1", "y").await.unwrap_err(),
            KvError::Unavailable
        ));

        kv.set_available(true);
        assert_eq!(kv.get("nodes/hv1").await.unwrap().unwrap().value, "x");
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expires_while_unavailable() {
        let kv = MemoryKv::new();
        let session = kv.session(Duration::from_secs(9)).await.unwrap();
        kv.put_ephemeral(&session, "nodes/hv1/alive", "1")
            .await
            .unwrap();

        // Heartbeats keep the session alive indefinitely while connected.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!session.is_expired());

        kv.set_available(false);
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(session.is_expired());

        kv.set_available(true);
        assert!(kv.get("nodes/hv1/alive").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_election_fifo_and_failover() {
        let kv = MemoryKv::new();
        let s1 = kv.session(Duration::from_secs(10)).await.unwrap();
        let s2 = kv.session(Duration::from_secs(10)).await.unwrap();

        let h1 = kv
            .acquire_leader(&s1, "election/primary", "coord1")
            .await
            .unwrap();
        let mut h2 = kv
            .acquire_leader(&s2, "election/primary", "coord2")
            .await
            .unwrap();

        assert!(h1.is_leader());
        assert!(!h2.is_leader());
        assert_eq!(
            kv.get("election/primary").await.unwrap().unwrap().value,
            "coord1"
        );

        // Killing the leader's session passes the lease in arrival order.
        kv.kill_session(s1.id());
        let mut rx = h2.watch();
        rx.changed().await.unwrap();
        assert!(h2.is_leader());
        assert_eq!(
            kv.get("election/primary").await.unwrap().unwrap().value,
            "coord2"
        );

        // Releasing the last candidate clears the election key.
        h2.release();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(kv.get("election/primary").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let kv = MemoryKv::new();
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Rec {
            n: u32,
        }

        let v = kv.put_json("x", &Rec { n: 7 }).await.unwrap();
        let (rec, version) = kv.get_json::<Rec>("x").await.unwrap().unwrap();
        assert_eq!(rec.n, 7);
        assert_eq!(version, v);
    }
}
