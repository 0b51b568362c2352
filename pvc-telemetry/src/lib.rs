//! # PVC Telemetry
//!
//! Feeds the keepalive publish: every tick the node reports its load and
//! memory pressure in the units the node record carries (load average,
//! MiB). Facts that cannot change while the daemon runs (host name, OS,
//! CPU topology) are gathered once at startup and logged, not re-sampled.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::System;

const MIB: u64 = 1024 * 1024;

/// Host properties fixed for the lifetime of the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostFacts {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
    pub cpu_model: String,
    /// Logical CPUs; the ceiling the load average is judged against.
    pub cpu_count: usize,
}

/// One keepalive tick's worth of host telemetry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HostSample {
    /// 1-minute load average, published as the node's `load`.
    pub load_1min: f64,
    /// Physical memory in MiB.
    pub mem_total_mib: u64,
    /// Memory in use in MiB, kernel caches excluded.
    pub mem_used_mib: u64,
    /// Aggregate CPU busy percentage since the previous sample.
    pub cpu_busy_pct: f32,
}

/// Samples the host for the keepalive engine.
///
/// The sysinfo state is kept behind a mutex so the collector can be
/// shared; CPU usage figures are deltas, so one owner sampling on a
/// steady cadence gives the meaningful numbers.
pub struct TelemetryCollector {
    system: Mutex<System>,
    facts: HostFacts,
}

impl TelemetryCollector {
    pub fn new() -> Self {
        let system = System::new_all();

        let cpu_model = system
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        let facts = HostFacts {
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os: System::name().unwrap_or_else(|| "unknown".to_string()),
            kernel: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
            cpu_model,
            cpu_count: system.cpus().len(),
        };

        Self {
            system: Mutex::new(system),
            facts,
        }
    }

    /// The once-collected host facts.
    pub fn facts(&self) -> &HostFacts {
        &self.facts
    }

    /// Refresh and take one sample.
    pub fn sample(&self) -> HostSample {
        let mut system = self.system.lock().unwrap();
        system.refresh_memory();
        system.refresh_cpu_usage();

        let cpus = system.cpus();
        let cpu_busy_pct = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpus.len() as f32
        };

        HostSample {
            load_1min: System::load_average().one,
            mem_total_mib: system.total_memory() / MIB,
            mem_used_mib: system.used_memory() / MIB,
            cpu_busy_pct,
        }
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_is_plausible() {
        let collector = TelemetryCollector::new();
        let sample = collector.sample();

        assert!(sample.mem_total_mib > 0);
        assert!(sample.mem_used_mib <= sample.mem_total_mib);
        assert!(sample.load_1min >= 0.0);
    }

    #[test]
    fn test_facts_are_stable() {
        let collector = TelemetryCollector::new();
        let first = collector.facts().clone();
        collector.sample();
        assert_eq!(collector.facts().hostname, first.hostname);
        assert_eq!(collector.facts().cpu_count, first.cpu_count);
    }
}
