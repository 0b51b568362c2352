//! # PVC KV Client
//!
//! Thin facade over the external linearizable key-value service that hosts
//! all durable cluster state. The daemon talks to the store exclusively
//! through the [`KvStore`] trait: get/list/put/compare-and-set/delete,
//! recursive watches, ephemeral sessions with heartbeat, and leader
//! election on a named path.
//!
//! Contract highlights:
//! - Every value carries a store-wide monotonic version; watch consumers
//!   deduplicate by it.
//! - Watches deliver at-least-once, in per-key order; cross-key order is
//!   not guaranteed. Controllers re-read on events rather than trusting
//!   event ordering.
//! - Connection loss is recoverable: [`KvStore::availability`] flips false
//!   and all writers pause. Session loss is fatal to cluster membership
//!   and triggers a controlled daemon restart.
//!
//! The in-process [`MemoryKv`] backend implements the full contract and
//! backs the `--dev` mode and the test suite.

pub mod error;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::debug;

pub use error::{KvError, Result};
pub use memory::MemoryKv;

/// A value with its store version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub version: u64,
}

/// A single change notification. `value` is `None` when the key was
/// deleted; `version` is the store version of the change itself.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: String,
    pub value: Option<Versioned>,
    pub version: u64,
}

/// Filtered, deduplicated stream of [`WatchEvent`]s for one prefix.
///
/// Built on a broadcast queue: a consumer that lags far enough loses the
/// oldest events, which is safe because every controller re-reads the
/// record on notification.
pub struct WatchStream {
    rx: broadcast::Receiver<WatchEvent>,
    prefix: String,
    recursive: bool,
    last_seen: std::collections::HashMap<String, u64>,
}

impl WatchStream {
    pub(crate) fn new(rx: broadcast::Receiver<WatchEvent>, prefix: &str, recursive: bool) -> Self {
        Self {
            rx,
            prefix: prefix.to_string(),
            recursive,
            last_seen: std::collections::HashMap::new(),
        }
    }

    fn matches(&self, path: &str) -> bool {
        if self.recursive {
            path.starts_with(&self.prefix)
        } else {
            path == self.prefix
        }
    }

    /// Next matching event; `None` when the store has shut down.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if !self.matches(&event.path) {
                        continue;
                    }
                    // At-least-once delivery: drop stale duplicates.
                    if let Some(&seen) = self.last_seen.get(&event.path) {
                        if event.version <= seen {
                            continue;
                        }
                    }
                    self.last_seen.insert(event.path.clone(), event.version);
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        prefix = %self.prefix,
                        skipped = skipped,
                        "Watch stream lagged, continuing"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Handle to an ephemeral session.
///
/// The store heartbeats the session at ttl/3 while the connection is up.
/// When the session expires, every ephemeral key bound to it disappears
/// and any leadership it backed is lost; `expired()` flips true. Dropping
/// the handle closes the session gracefully.
pub struct SessionHandle {
    id: u64,
    ttl: Duration,
    expired: watch::Receiver<bool>,
    close: Option<oneshot::Sender<()>>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: u64,
        ttl: Duration,
        expired: watch::Receiver<bool>,
        close: oneshot::Sender<()>,
    ) -> Self {
        Self {
            id,
            ttl,
            expired,
            close: Some(close),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Watch channel that flips true when the session is lost.
    pub fn expired(&self) -> watch::Receiver<bool> {
        self.expired.clone()
    }

    pub fn is_expired(&self) -> bool {
        *self.expired.borrow()
    }

    /// Close the session, removing its ephemeral keys.
    pub fn close(&mut self) {
        if let Some(tx) = self.close.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle to a leader-election candidacy.
///
/// `watch()` observes leadership grants and losses. Dropping the handle
/// (or calling `release`) withdraws the candidacy; a released leadership
/// passes to the next candidate in arrival order.
pub struct LeadershipHandle {
    is_leader: watch::Receiver<bool>,
    release: Option<oneshot::Sender<()>>,
}

impl LeadershipHandle {
    pub(crate) fn new(is_leader: watch::Receiver<bool>, release: oneshot::Sender<()>) -> Self {
        Self {
            is_leader,
            release: Some(release),
        }
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.is_leader.clone()
    }

    pub fn is_leader(&self) -> bool {
        *self.is_leader.borrow()
    }

    /// Relinquish leadership (or withdraw the pending candidacy).
    pub fn release(&mut self) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for LeadershipHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// The store facade. All operations are linearizable per key.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Versioned>>;

    /// All keys under `prefix`, sorted by path.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;

    /// Unconditional write. Returns the new version.
    async fn put(&self, path: &str, value: &str) -> Result<u64>;

    /// Compare-and-set on the version stamp. `expected = None` means the
    /// key must not exist (create). Returns the new version.
    async fn cas(&self, path: &str, expected: Option<u64>, value: &str) -> Result<u64>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Change notifications for `prefix`; `recursive` matches the whole
    /// subtree, otherwise the exact key.
    async fn watch(&self, prefix: &str, recursive: bool) -> Result<WatchStream>;

    /// Open an ephemeral session with the given TTL.
    async fn session(&self, ttl: Duration) -> Result<SessionHandle>;

    /// Write a key bound to `session`; it vanishes when the session dies.
    async fn put_ephemeral(&self, session: &SessionHandle, path: &str, value: &str)
        -> Result<u64>;

    /// Join the leader election at `path`. The current leader's identity
    /// is readable at `path` itself.
    async fn acquire_leader(
        &self,
        session: &SessionHandle,
        path: &str,
        identity: &str,
    ) -> Result<LeadershipHandle>;

    /// Connection state. False while reconnecting; all controllers pause
    /// writes until it returns true.
    fn availability(&self) -> watch::Receiver<bool>;
}

/// Typed JSON helpers over the raw string contract.
#[async_trait]
pub trait KvStoreExt: KvStore {
    async fn get_json<T: DeserializeOwned + Send>(&self, path: &str) -> Result<Option<(T, u64)>> {
        match self.get(path).await? {
            Some(versioned) => {
                let value = serde_json::from_str(&versioned.value).map_err(|e| {
                    KvError::Decode {
                        path: path.to_string(),
                        source: e,
                    }
                })?;
                Ok(Some((value, versioned.version)))
            }
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize + Sync>(&self, path: &str, value: &T) -> Result<u64> {
        let encoded = serde_json::to_string(value).map_err(KvError::Encode)?;
        self.put(path, &encoded).await
    }

    async fn cas_json<T: Serialize + Sync>(
        &self,
        path: &str,
        expected: Option<u64>,
        value: &T,
    ) -> Result<u64> {
        let encoded = serde_json::to_string(value).map_err(KvError::Encode)?;
        self.cas(path, expected, &encoded).await
    }

    /// List and decode every entry under `prefix` that parses as `T`.
    /// Entries of other shapes under the same prefix (e.g. console rings
    /// under the domain tree) are skipped.
    async fn list_json<T: DeserializeOwned + Send>(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, T, u64)>> {
        let entries = self.list(prefix).await?;
        let mut decoded = Vec::with_capacity(entries.len());
        for (path, versioned) in entries {
            match serde_json::from_str(&versioned.value) {
                Ok(value) => decoded.push((path, value, versioned.version)),
                Err(e) => {
                    debug!(path = %path, error = %e, "Skipping non-decoding entry in list");
                }
            }
        }
        Ok(decoded)
    }
}

#[async_trait]
impl<S: KvStore + ?Sized> KvStoreExt for S {}
