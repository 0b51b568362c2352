//! Storage controller.
//!
//! Converges local OSDs against the storage table and executes volume
//! operations on behalf of the task controller. Every storage command is
//! synchronous through the driver: the cluster record and the task reply
//! advance only after the driver has returned success. OSD failures
//! surface as cluster-health decrements (via the osd probe reading the
//! table), never as blocking errors for the node itself.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use pvc_common::ClusterError;
use pvc_drivers::STORAGE_OP_DEADLINE;
use pvc_kv::{KvStore, KvStoreExt};
use pvc_schema::{paths, OsdRecord, OsdState, SnapshotRecord, VolumeRecord};

use crate::daemon::Context;
use crate::dispatch::Event;

pub struct StorageController {
    ctx: Arc<Context>,
}

impl StorageController {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    fn name(&self) -> &str {
        &self.ctx.node_name
    }

    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<Event>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Storage controller running");
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(Event::Storage(_)) | Some(Event::Tick) | Some(Event::Availability(true)) => {
                            self.reconcile().await;
                        }
                        Some(_) => {}
                        None => {
                            warn!("Storage controller stopping: event channel closed");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Storage controller shutting down");
                    break;
                }
            }
        }
    }

    /// Bootstrap any OSD record assigned to this node that is still
    /// waiting, e.g. written directly by an external client.
    async fn reconcile(&self) {
        if !*self.ctx.kv.availability().borrow() {
            return;
        }

        let osds = match self
            .ctx
            .kv
            .list_json::<OsdRecord>(&format!("{}osd/", paths::STORAGE))
            .await
        {
            Ok(osds) => osds,
            Err(e) => {
                debug!(error = %e, "Cannot list OSD table");
                return;
            }
        };

        for (_, osd, _) in osds {
            if osd.node == self.name() && osd.state == OsdState::Bootstrapping {
                let _ = self
                    .bootstrap_osd(osd.id, &osd.node, &osd.device, osd.weight)
                    .await;
            }
        }
    }

    /// Bootstrap an OSD on this node and record the outcome. A driver
    /// failure marks the record failed and degrades health, nothing more.
    pub async fn bootstrap_osd(
        &self,
        id: u32,
        node: &str,
        device: &str,
        weight: f64,
    ) -> Result<(), ClusterError> {
        if node != self.name() {
            return Err(ClusterError::Invalid(format!(
                "OSD {} belongs on {}, not {}",
                id, node, self.name()
            )));
        }

        let result = timeout(
            STORAGE_OP_DEADLINE,
            self.ctx.storage.bootstrap_osd(id, node, device, weight),
        )
        .await;

        let (state, outcome) = match result {
            Ok(Ok(())) => (OsdState::Up, Ok(())),
            Ok(Err(e)) => {
                warn!(osd_id = id, error = %e, "OSD bootstrap failed");
                (
                    OsdState::Failed,
                    Err(ClusterError::Invalid(format!("OSD {} bootstrap: {}", id, e))),
                )
            }
            Err(_) => {
                warn!(osd_id = id, "OSD bootstrap timed out");
                (
                    OsdState::Failed,
                    Err(ClusterError::Transient(format!(
                        "OSD {} bootstrap timed out",
                        id
                    ))),
                )
            }
        };

        let record = OsdRecord {
            id,
            node: node.to_string(),
            device: device.to_string(),
            weight,
            state,
        };
        if let Err(e) = self.ctx.kv.put_json(&paths::osd(id), &record).await {
            error!(osd_id = id, error = %e, "Cannot write OSD record");
        }
        if state == OsdState::Up {
            info!(osd_id = id, device = %device, weight = weight, "OSD up");
        }
        outcome
    }

    pub async fn create_volume(
        &self,
        pool: &str,
        name: &str,
        size_bytes: u64,
    ) -> Result<(), ClusterError> {
        self.driver_call(
            "create",
            pool,
            name,
            self.ctx.storage.create_volume(pool, name, size_bytes),
        )
        .await?;

        let record = VolumeRecord::new(pool, name, size_bytes);
        self.ctx
            .kv
            .put_json(&paths::volume(pool, name), &record)
            .await?;
        info!(volume = %format!("{}/{}", pool, name), size_bytes = size_bytes, "Volume created");
        Ok(())
    }

    pub async fn resize_volume(
        &self,
        pool: &str,
        name: &str,
        size_bytes: u64,
    ) -> Result<(), ClusterError> {
        self.driver_call(
            "resize",
            pool,
            name,
            self.ctx.storage.resize_volume(pool, name, size_bytes),
        )
        .await?;

        let path = paths::volume(pool, name);
        if let Some((mut record, version)) = self.ctx.kv.get_json::<VolumeRecord>(&path).await? {
            record.size_bytes = size_bytes;
            self.ctx.kv.cas_json(&path, Some(version), &record).await?;
        }
        info!(volume = %format!("{}/{}", pool, name), size_bytes = size_bytes, "Volume resized");
        Ok(())
    }

    pub async fn delete_volume(&self, pool: &str, name: &str) -> Result<(), ClusterError> {
        // A held lock means a VM is still using the volume.
        if let Ok(Some(holder)) = self.ctx.storage.lock_holder(pool, name).await {
            return Err(ClusterError::Invalid(format!(
                "volume {}/{} is locked by {}",
                pool, name, holder
            )));
        }

        self.driver_call("delete", pool, name, self.ctx.storage.delete_volume(pool, name))
            .await?;

        match self.ctx.kv.delete(&paths::volume(pool, name)).await {
            Ok(()) => {}
            Err(pvc_kv::KvError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(volume = %format!("{}/{}", pool, name), "Volume deleted");
        Ok(())
    }

    pub async fn snapshot_volume(
        &self,
        pool: &str,
        name: &str,
        snapshot: &str,
    ) -> Result<(), ClusterError> {
        self.driver_call(
            "snapshot",
            pool,
            name,
            self.ctx.storage.snapshot_volume(pool, name, snapshot),
        )
        .await?;

        let record = SnapshotRecord {
            pool: pool.to_string(),
            volume: name.to_string(),
            name: snapshot.to_string(),
        };
        self.ctx
            .kv
            .put_json(&paths::snapshot(pool, name, snapshot), &record)
            .await?;
        info!(
            snapshot = %format!("{}/{}@{}", pool, name, snapshot),
            "Snapshot created"
        );
        Ok(())
    }

    /// Run one driver future under the storage deadline, classifying the
    /// failure modes.
    async fn driver_call<F>(
        &self,
        op: &str,
        pool: &str,
        name: &str,
        call: F,
    ) -> Result<(), ClusterError>
    where
        F: std::future::Future<Output = pvc_drivers::Result<()>>,
    {
        match timeout(STORAGE_OP_DEADLINE, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ClusterError::Invalid(format!(
                "volume {} {}/{}: {}",
                op, pool, name, e
            ))),
            Err(_) => Err(ClusterError::Transient(format!(
                "volume {} {}/{} timed out",
                op, pool, name
            ))),
        }
    }
}
