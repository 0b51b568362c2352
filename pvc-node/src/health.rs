//! Health plugin host.
//!
//! Probes implement [`HealthPlugin`] with three contract points: `setup`,
//! `run(deadline, coordinator_state)`, and `cleanup`. The probe set is
//! compiled in; the configured plugin directory arms probes by name (an
//! empty or missing directory arms every builtin). Each keepalive runs
//! all armed probes inside one shared 2-second budget; a probe that
//! overruns its share is recorded as timed out and contributes no delta.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use pvc_kv::{KvStore, KvStoreExt};
use pvc_schema::{paths, CoordinatorState, OsdRecord, OsdState, PluginReport};

/// Total budget for one keepalive's plugin pass.
pub const PLUGIN_BUDGET: Duration = Duration::from_secs(2);

/// Result of one plugin run.
#[derive(Debug, Clone)]
pub struct PluginResult {
    /// Health points to deduct; 0 means healthy.
    pub delta: u32,
    pub message: String,
    /// Free-form structured detail, published alongside the report.
    pub data: serde_json::Value,
}

impl PluginResult {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            delta: 0,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn degraded(delta: u32, message: impl Into<String>) -> Self {
        Self {
            delta,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }
}

/// A health probe.
#[async_trait]
pub trait HealthPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// One-time initialization at daemon start.
    async fn setup(&self) {}

    /// Execute the probe. `deadline` is the remaining share of the
    /// keepalive budget; `coordinator_state` lets probes suppress alarms
    /// that are expected during takeover/relinquish transitions.
    async fn run(&self, deadline: Duration, coordinator_state: CoordinatorState) -> PluginResult;

    /// One-time teardown at daemon stop.
    async fn cleanup(&self) {}
}

/// Host that arms and runs the probes.
pub struct PluginHost {
    plugins: Vec<Arc<dyn HealthPlugin>>,
}

impl PluginHost {
    /// Arm probes according to the plugin directory: a file named after a
    /// probe arms it. A missing directory arms everything.
    pub fn discover(plugin_dir: &str, available: Vec<Arc<dyn HealthPlugin>>) -> Self {
        let armed_names: Option<Vec<String>> = std::fs::read_dir(plugin_dir)
            .ok()
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect()
            });

        let plugins: Vec<Arc<dyn HealthPlugin>> = match &armed_names {
            Some(names) => available
                .into_iter()
                .filter(|p| names.iter().any(|n| n == p.name()))
                .collect(),
            None => available,
        };

        info!(
            count = plugins.len(),
            armed = ?plugins.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            "Health probes armed"
        );
        Self { plugins }
    }

    /// Arm an explicit probe set (used by tests and `--dev`).
    pub fn with_plugins(plugins: Vec<Arc<dyn HealthPlugin>>) -> Self {
        Self { plugins }
    }

    pub async fn setup_all(&self) {
        for plugin in &self.plugins {
            plugin.setup().await;
        }
    }

    pub async fn cleanup_all(&self) {
        for plugin in &self.plugins {
            plugin.cleanup().await;
        }
    }

    /// Run every armed probe inside `budget`. Probes run concurrently,
    /// each in its own bounded worker, so one wedged probe cannot starve
    /// the rest or delay the keepalive publish.
    pub async fn run_all(
        &self,
        budget: Duration,
        coordinator_state: CoordinatorState,
    ) -> Vec<PluginReport> {
        let runs = self.plugins.iter().map(|plugin| {
            let plugin = Arc::clone(plugin);
            async move {
                match timeout(budget, plugin.run(budget, coordinator_state)).await {
                    Ok(result) => {
                        debug!(
                            plugin = plugin.name(),
                            delta = result.delta,
                            message = %result.message,
                            "Plugin completed"
                        );
                        PluginReport {
                            name: plugin.name().to_string(),
                            delta: result.delta,
                            message: result.message,
                            timed_out: false,
                        }
                    }
                    Err(_) => {
                        warn!(plugin = plugin.name(), "Plugin timed out");
                        PluginReport {
                            name: plugin.name().to_string(),
                            delta: 0,
                            message: "timed_out".to_string(),
                            timed_out: true,
                        }
                    }
                }
            }
        });

        futures::future::join_all(runs).await
    }

    /// Sum the deltas of the probes that completed.
    pub fn health_delta(reports: &[PluginReport]) -> u32 {
        reports
            .iter()
            .filter(|r| !r.timed_out)
            .map(|r| r.delta)
            .sum()
    }
}

// =============================================================================
// BUILTIN PROBES
// =============================================================================

/// System load probe: deducts when the 1-minute load average exceeds the
/// logical core count.
pub struct LoadProbe;

#[async_trait]
impl HealthPlugin for LoadProbe {
    fn name(&self) -> &str {
        "load"
    }

    async fn run(&self, _deadline: Duration, _coordinator_state: CoordinatorState) -> PluginResult {
        let load = sysinfo::System::load_average().one;
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;

        if load > cores * 2.0 {
            PluginResult::degraded(25, format!("load {:.2} is over 2x core count", load))
        } else if load > cores {
            PluginResult::degraded(10, format!("load {:.2} exceeds core count", load))
        } else {
            PluginResult::healthy(format!("load {:.2} ok", load))
        }
    }
}

/// KV connectivity probe. Suppressed during primary transitions, where a
/// brief availability blip is expected.
pub struct KvProbe {
    availability: watch::Receiver<bool>,
}

impl KvProbe {
    pub fn new(availability: watch::Receiver<bool>) -> Self {
        Self { availability }
    }
}

#[async_trait]
impl HealthPlugin for KvProbe {
    fn name(&self) -> &str {
        "kv"
    }

    async fn run(&self, _deadline: Duration, coordinator_state: CoordinatorState) -> PluginResult {
        if matches!(
            coordinator_state,
            CoordinatorState::Takeover | CoordinatorState::Relinquish
        ) {
            return PluginResult::healthy("suppressed during role transition");
        }
        if *self.availability.borrow() {
            PluginResult::healthy("KV store reachable")
        } else {
            PluginResult::degraded(50, "KV store unreachable")
        }
    }
}

/// OSD probe: deducts for every OSD on this node that is down or failed.
pub struct OsdProbe {
    kv: Arc<dyn KvStore>,
    node: String,
}

impl OsdProbe {
    pub fn new(kv: Arc<dyn KvStore>, node: impl Into<String>) -> Self {
        Self {
            kv,
            node: node.into(),
        }
    }
}

#[async_trait]
impl HealthPlugin for OsdProbe {
    fn name(&self) -> &str {
        "osd"
    }

    async fn run(&self, _deadline: Duration, _coordinator_state: CoordinatorState) -> PluginResult {
        let osds = match self
            .kv
            .list_json::<OsdRecord>(&format!("{}osd/", paths::STORAGE))
            .await
        {
            Ok(osds) => osds,
            Err(e) => return PluginResult::degraded(5, format!("cannot read OSD table: {}", e)),
        };

        let bad: Vec<u32> = osds
            .iter()
            .filter(|(_, osd, _)| {
                osd.node == self.node && matches!(osd.state, OsdState::Down | OsdState::Failed)
            })
            .map(|(_, osd, _)| osd.id)
            .collect();

        if bad.is_empty() {
            PluginResult::healthy("all local OSDs up")
        } else {
            PluginResult::degraded(10 * bad.len() as u32, format!("OSDs degraded: {:?}", bad))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SleepyProbe;

    #[async_trait]
    impl HealthPlugin for SleepyProbe {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn run(&self, _deadline: Duration, _cs: CoordinatorState) -> PluginResult {
            tokio::time::sleep(Duration::from_secs(10)).await;
            PluginResult::degraded(99, "should never be reported")
        }
    }

    struct FlatProbe {
        delta: u32,
    }

    #[async_trait]
    impl HealthPlugin for FlatProbe {
        fn name(&self) -> &str {
            "flat"
        }

        async fn run(&self, _deadline: Duration, _cs: CoordinatorState) -> PluginResult {
            PluginResult::degraded(self.delta, "flat")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_plugin_times_out_without_poisoning_the_pass() {
        let host = PluginHost::with_plugins(vec![
            Arc::new(SleepyProbe),
            Arc::new(FlatProbe { delta: 7 }),
        ]);

        let reports = host
            .run_all(PLUGIN_BUDGET, CoordinatorState::Secondary)
            .await;

        assert_eq!(reports.len(), 2);
        assert!(reports[0].timed_out);
        assert_eq!(reports[0].message, "timed_out");

        // The sleeper does not starve the other probe.
        assert!(!reports[1].timed_out);
        assert_eq!(reports[1].delta, 7);

        // Only completed probes contribute to the delta.
        assert_eq!(PluginHost::health_delta(&reports), 7);
    }

    #[tokio::test]
    async fn test_deltas_accumulate() {
        let host = PluginHost::with_plugins(vec![
            Arc::new(FlatProbe { delta: 7 }),
            Arc::new(FlatProbe { delta: 5 }),
        ]);

        let reports = host
            .run_all(PLUGIN_BUDGET, CoordinatorState::Secondary)
            .await;
        assert_eq!(PluginHost::health_delta(&reports), 12);
    }

    #[tokio::test]
    async fn test_kv_probe_suppressed_during_takeover() {
        let (tx, rx) = watch::channel(false);
        let probe = KvProbe::new(rx);

        let result = probe
            .run(PLUGIN_BUDGET, CoordinatorState::Secondary)
            .await;
        assert_eq!(result.delta, 50);

        let result = probe.run(PLUGIN_BUDGET, CoordinatorState::Takeover).await;
        assert_eq!(result.delta, 0);

        drop(tx);
    }
}
