//! Network controller.
//!
//! Watches the network table and converges the local host: an 802.1q
//! VLAN + bridge on the uplink for every bridged network, a VXLAN for
//! every managed network. While this node holds the primary lease it also
//! owns each managed network's gateway address and DHCP/DNS dispatcher;
//! both are released the moment the lease goes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use pvc_drivers::bridge_device;
use pvc_kv::{KvStore, KvStoreExt};
use pvc_schema::{paths, NetworkRecord, NetworkType};

use crate::daemon::Context;
use crate::dispatch::Event;

pub struct NetworkController {
    ctx: Arc<Context>,
    primary_rx: watch::Receiver<bool>,
    /// Networks converged on this host.
    local: StdMutex<HashMap<u32, NetworkType>>,
    /// Managed networks whose gateway this node currently hosts.
    gateways: StdMutex<HashSet<u32>>,
}

impl NetworkController {
    pub fn new(ctx: Arc<Context>, primary_rx: watch::Receiver<bool>) -> Self {
        Self {
            ctx,
            primary_rx,
            local: StdMutex::new(HashMap::new()),
            gateways: StdMutex::new(HashSet::new()),
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<Event>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Network controller running");
        let mut primary_rx = self.primary_rx.clone();
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(Event::Network(_)) | Some(Event::Tick) | Some(Event::Availability(true)) => {
                            self.reconcile().await;
                        }
                        Some(_) => {}
                        None => {
                            warn!("Network controller stopping: event channel closed");
                            break;
                        }
                    }
                }
                changed = primary_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // Gateways move with the lease.
                    self.reconcile().await;
                }
                _ = shutdown.recv() => {
                    info!("Network controller shutting down");
                    break;
                }
            }
        }

        // Never hold gateway resources past shutdown.
        self.release_gateways().await;
    }

    async fn reconcile(&self) {
        if !*self.ctx.kv.availability().borrow() {
            return;
        }

        let records = match self.ctx.kv.list_json::<NetworkRecord>(paths::NETWORKS).await {
            Ok(records) => records,
            Err(e) => {
                debug!(error = %e, "Cannot list network table");
                return;
            }
        };
        let desired: HashMap<u32, NetworkRecord> = records
            .into_iter()
            .filter_map(|(path, record, _)| paths::network_vni(&path).map(|vni| (vni, record)))
            .collect();

        let known: HashMap<u32, NetworkType> = self.local.lock().unwrap().clone();

        // New networks.
        for (vni, record) in &desired {
            if known.contains_key(vni) {
                continue;
            }
            let created = match record.net_type {
                NetworkType::Bridged => {
                    let uplink = &self.ctx.config.cluster.networks.upstream;
                    self.ctx
                        .network
                        .create_bridged(*vni, &uplink.device, uplink.mtu)
                        .await
                }
                NetworkType::Managed => {
                    let cluster = &self.ctx.config.cluster.networks.cluster;
                    self.ctx
                        .network
                        .create_vxlan(*vni, &cluster.device, cluster.mtu)
                        .await
                }
            };
            match created {
                Ok(()) => {
                    info!(vni = vni, kind = ?record.net_type, "Network converged");
                    self.local.lock().unwrap().insert(*vni, record.net_type);
                }
                Err(e) => {
                    warn!(vni = vni, error = %e, "Network create failed");
                }
            }
        }

        // Removed networks.
        for (vni, net_type) in &known {
            if desired.contains_key(vni) {
                continue;
            }
            self.stop_gateway(*vni, None).await;
            let destroyed = match net_type {
                NetworkType::Bridged => self.ctx.network.destroy_bridged(*vni).await,
                NetworkType::Managed => self.ctx.network.destroy_vxlan(*vni).await,
            };
            match destroyed {
                Ok(()) => {
                    info!(vni = vni, "Network removed");
                    self.local.lock().unwrap().remove(vni);
                }
                Err(e) => {
                    warn!(vni = vni, error = %e, "Network teardown failed");
                }
            }
        }

        // Gateway ownership follows the primary lease. Exactly one node
        // holds a managed network's gateway at any time.
        let primary = *self.primary_rx.borrow();
        for (vni, record) in &desired {
            if record.net_type != NetworkType::Managed {
                continue;
            }
            let holding = self.gateways.lock().unwrap().contains(vni);
            if primary && !holding {
                self.start_gateway(*vni, record).await;
            } else if !primary && holding {
                self.stop_gateway(*vni, record.ip4_gateway.as_deref()).await;
            }
        }
    }

    async fn start_gateway(&self, vni: u32, record: &NetworkRecord) {
        if let Some(gateway) = &record.ip4_gateway {
            if let Err(e) = self
                .ctx
                .network
                .bind_address(&bridge_device(vni), gateway)
                .await
            {
                warn!(vni = vni, error = %e, "Gateway address bind failed");
                return;
            }
        }
        match self.ctx.network.start_gateway(record).await {
            Ok(()) => {
                info!(vni = vni, "Gateway services started");
                self.gateways.lock().unwrap().insert(vni);
            }
            Err(e) => {
                warn!(vni = vni, error = %e, "Gateway dispatcher start failed");
            }
        }
    }

    async fn stop_gateway(&self, vni: u32, gateway: Option<&str>) {
        if !self.gateways.lock().unwrap().remove(&vni) {
            return;
        }
        if let Err(e) = self.ctx.network.stop_gateway(vni).await {
            warn!(vni = vni, error = %e, "Gateway dispatcher stop failed");
        }
        if let Some(gateway) = gateway {
            if let Err(e) = self
                .ctx
                .network
                .unbind_address(&bridge_device(vni), gateway)
                .await
            {
                warn!(vni = vni, error = %e, "Gateway address unbind failed");
            }
        }
        info!(vni = vni, "Gateway services stopped");
    }

    /// Stop every gateway this node still holds (shutdown / lease loss).
    async fn release_gateways(&self) {
        let held: Vec<u32> = self.gateways.lock().unwrap().iter().copied().collect();
        for vni in held {
            let gateway = match self
                .ctx
                .kv
                .get_json::<NetworkRecord>(&paths::network(vni))
                .await
            {
                Ok(Some((record, _))) => record.ip4_gateway,
                _ => None,
            };
            self.stop_gateway(vni, gateway.as_deref()).await;
        }
    }
}
