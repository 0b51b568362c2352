//! Event dispatcher.
//!
//! The central bus: multiplexes the recursive KV watches and the internal
//! reconcile timer onto bounded per-controller channels. Controllers
//! treat every event as a hint to re-read; a dropped event is therefore
//! harmless (the next tick reconciles fully), which is why the dispatcher
//! never blocks on a slow consumer.
//!
//! The reconcile timer is the dispatcher's lifeline: a watch stream that
//! ends (or never opened) only costs change-notification latency, because
//! ticks keep flowing to every controller. The loop itself ends only on
//! the shutdown signal or when the KV handle itself is gone, and the two
//! are logged apart.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use pvc_kv::{KvStore, WatchStream};
use pvc_schema::paths;

/// Capacity of each controller's event queue.
const QUEUE_DEPTH: usize = 64;

/// A change hint delivered to a controller.
#[derive(Debug, Clone)]
pub enum Event {
    /// A VM record changed.
    Domain(String),
    /// A network record changed.
    Network(u32),
    /// A storage record changed; carries the full path.
    Storage(String),
    /// A task record changed.
    Task(String),
    /// A node record changed.
    Node(String),
    /// Periodic reconcile tick.
    Tick,
    /// KV connection state changed.
    Availability(bool),
}

/// Per-controller inbound queues.
pub struct Subscriptions {
    pub placement: mpsc::Sender<Event>,
    pub network: mpsc::Sender<Event>,
    pub storage: mpsc::Sender<Event>,
    pub tasks: mpsc::Sender<Event>,
}

/// Create a controller queue.
pub fn channel() -> (mpsc::Sender<Event>, mpsc::Receiver<Event>) {
    mpsc::channel(QUEUE_DEPTH)
}

fn forward(target: &mpsc::Sender<Event>, event: Event) {
    if let Err(e) = target.try_send(event) {
        // Full queue: the controller will catch up on its next tick.
        debug!(error = %e, "Controller queue full, dropping event hint");
    }
}

/// Open one recursive watch, degrading to tick-only coverage on failure.
async fn open_watch(kv: &Arc<dyn KvStore>, prefix: &str) -> Option<WatchStream> {
    match kv.watch(prefix, true).await {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(prefix = %prefix, error = %e, "Cannot open watch, relying on ticks");
            None
        }
    }
}

/// A watch stream ended. Drop it and carry on: the subtree loses change
/// notifications, not reconciliation.
fn retire_watch(stream: &mut Option<WatchStream>, prefix: &str) {
    warn!(prefix = %prefix, "Watch stream closed, relying on ticks for this subtree");
    *stream = None;
}

/// Run the dispatcher until shutdown. One long-lived task per daemon.
pub async fn run(
    kv: Arc<dyn KvStore>,
    tick_interval: std::time::Duration,
    subs: Subscriptions,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut domains = open_watch(&kv, paths::DOMAINS).await;
    let mut networks = open_watch(&kv, paths::NETWORKS).await;
    let mut storage = open_watch(&kv, paths::STORAGE).await;
    let mut tasks = open_watch(&kv, paths::TASKS).await;
    let mut nodes = open_watch(&kv, paths::NODES).await;

    let mut availability = kv.availability();
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(tick_secs = tick_interval.as_secs(), "Event dispatcher running");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                forward(&subs.placement, Event::Tick);
                forward(&subs.network, Event::Tick);
                forward(&subs.storage, Event::Tick);
                forward(&subs.tasks, Event::Tick);
            }
            changed = availability.changed() => {
                if changed.is_err() {
                    // The store handle itself is gone; without it there is
                    // nothing left to dispatch. This is not a clean stop.
                    error!("Event dispatcher stopping: KV availability channel closed");
                    break;
                }
                let available = *availability.borrow();
                info!(available = available, "KV availability changed");
                forward(&subs.placement, Event::Availability(available));
                forward(&subs.network, Event::Availability(available));
                forward(&subs.storage, Event::Availability(available));
                forward(&subs.tasks, Event::Availability(available));
            }
            event = recv_opt(&mut domains) => {
                match event {
                    Some(event) => {
                        if let Some(uuid) = paths::domain_uuid(&event.path) {
                            forward(&subs.placement, Event::Domain(uuid.to_string()));
                        }
                    }
                    None => retire_watch(&mut domains, paths::DOMAINS),
                }
            }
            event = recv_opt(&mut networks) => {
                match event {
                    Some(event) => {
                        if let Some(vni) = paths::network_vni(&event.path) {
                            forward(&subs.network, Event::Network(vni));
                        }
                    }
                    None => retire_watch(&mut networks, paths::NETWORKS),
                }
            }
            event = recv_opt(&mut storage) => {
                match event {
                    Some(event) => forward(&subs.storage, Event::Storage(event.path)),
                    None => retire_watch(&mut storage, paths::STORAGE),
                }
            }
            event = recv_opt(&mut tasks) => {
                match event {
                    Some(event) => {
                        if let Some(uuid) = paths::task_uuid(&event.path) {
                            forward(&subs.tasks, Event::Task(uuid.to_string()));
                        }
                    }
                    None => retire_watch(&mut tasks, paths::TASKS),
                }
            }
            event = recv_opt(&mut nodes) => {
                match event {
                    Some(event) => {
                        if let Some(name) = paths::node_name(&event.path) {
                            forward(&subs.placement, Event::Node(name.to_string()));
                        }
                    }
                    None => retire_watch(&mut nodes, paths::NODES),
                }
            }
            _ = shutdown.recv() => {
                info!("Event dispatcher shutting down");
                break;
            }
        }
    }
}

/// Receive from an optional stream; a missing stream pends forever so the
/// select arm simply never fires.
async fn recv_opt(stream: &mut Option<WatchStream>) -> Option<pvc_kv::WatchEvent> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}
