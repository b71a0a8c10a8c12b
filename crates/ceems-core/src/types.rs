//! Core type definitions for CEEMS

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Map of metric sub-field name to value.
///
/// Ordered so that serialized output is stable across runs: two updater
/// passes over identical inputs produce byte-identical documents.
pub type MetricMap = BTreeMap<String, f64>;

/// Names of the per-unit aggregate metric maps, as they appear both in the
/// unit model and in updater query configuration.
pub const METRIC_MAP_NAMES: &[&str] = &[
    "avg_cpu_usage",
    "avg_cpu_mem_usage",
    "total_cpu_energy_usage_kwh",
    "total_cpu_emissions_gms",
    "avg_gpu_usage",
    "avg_gpu_mem_usage",
    "total_gpu_energy_usage_kwh",
    "total_gpu_emissions_gms",
    "total_io_write_stats",
    "total_io_read_stats",
    "total_ingress_stats",
    "total_outgress_stats",
];

/// A single compute unit (batch job, container) tracked end-to-end.
///
/// Timestamps are millisecond epochs. `total_time` always carries at least
/// `walltime`, `alloc_cputime`, `alloc_cpumemtime`, `alloc_gputime` and
/// `alloc_gpumemtime`; the aggregate maps are filled in by updaters and stay
/// empty until then.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Unit identifier, unique within its cluster
    pub uuid: String,

    /// Cluster this unit ran on
    #[serde(default)]
    pub cluster_id: String,

    /// Start time (ms since epoch)
    #[serde(default)]
    pub started_at: i64,

    /// End time (ms since epoch)
    #[serde(default)]
    pub ended_at: i64,

    /// Consumed time metrics (walltime and allocation times)
    #[serde(default)]
    pub total_time: MetricMap,

    /// Average CPU usage
    #[serde(default, skip_serializing_if = "MetricMap::is_empty")]
    pub avg_cpu_usage: MetricMap,

    /// Average CPU memory usage
    #[serde(default, skip_serializing_if = "MetricMap::is_empty")]
    pub avg_cpu_mem_usage: MetricMap,

    /// Total CPU energy usage in kWh
    #[serde(default, skip_serializing_if = "MetricMap::is_empty")]
    pub total_cpu_energy_usage_kwh: MetricMap,

    /// Total CPU emissions in grams of CO2 equivalent
    #[serde(default, skip_serializing_if = "MetricMap::is_empty")]
    pub total_cpu_emissions_gms: MetricMap,

    /// Average GPU usage
    #[serde(default, skip_serializing_if = "MetricMap::is_empty")]
    pub avg_gpu_usage: MetricMap,

    /// Average GPU memory usage
    #[serde(default, skip_serializing_if = "MetricMap::is_empty")]
    pub avg_gpu_mem_usage: MetricMap,

    /// Total GPU energy usage in kWh
    #[serde(default, skip_serializing_if = "MetricMap::is_empty")]
    pub total_gpu_energy_usage_kwh: MetricMap,

    /// Total GPU emissions in grams of CO2 equivalent
    #[serde(default, skip_serializing_if = "MetricMap::is_empty")]
    pub total_gpu_emissions_gms: MetricMap,

    /// Total IO write statistics
    #[serde(default, skip_serializing_if = "MetricMap::is_empty")]
    pub total_io_write_stats: MetricMap,

    /// Total IO read statistics
    #[serde(default, skip_serializing_if = "MetricMap::is_empty")]
    pub total_io_read_stats: MetricMap,

    /// Total ingress statistics
    #[serde(default, skip_serializing_if = "MetricMap::is_empty")]
    pub total_ingress_stats: MetricMap,

    /// Total outgress statistics
    #[serde(default, skip_serializing_if = "MetricMap::is_empty")]
    pub total_outgress_stats: MetricMap,

    /// Set to 1 when the unit is excluded from metric enrichment
    #[serde(default)]
    pub ignore: u8,
}

impl Unit {
    /// Walltime of the unit in seconds, 0 when absent.
    pub fn walltime(&self) -> f64 {
        self.total_time.get("walltime").copied().unwrap_or(0.0)
    }

    /// Mutable access to an aggregate metric map by its wire name.
    ///
    /// Returns `None` for unknown names; `total_time` is deliberately not
    /// reachable here since updaters never rewrite consumed time.
    pub fn metric_map_mut(&mut self, name: &str) -> Option<&mut MetricMap> {
        match name {
            "avg_cpu_usage" => Some(&mut self.avg_cpu_usage),
            "avg_cpu_mem_usage" => Some(&mut self.avg_cpu_mem_usage),
            "total_cpu_energy_usage_kwh" => Some(&mut self.total_cpu_energy_usage_kwh),
            "total_cpu_emissions_gms" => Some(&mut self.total_cpu_emissions_gms),
            "avg_gpu_usage" => Some(&mut self.avg_gpu_usage),
            "avg_gpu_mem_usage" => Some(&mut self.avg_gpu_mem_usage),
            "total_gpu_energy_usage_kwh" => Some(&mut self.total_gpu_energy_usage_kwh),
            "total_gpu_emissions_gms" => Some(&mut self.total_gpu_emissions_gms),
            "total_io_write_stats" => Some(&mut self.total_io_write_stats),
            "total_io_read_stats" => Some(&mut self.total_io_read_stats),
            "total_ingress_stats" => Some(&mut self.total_ingress_stats),
            "total_outgress_stats" => Some(&mut self.total_outgress_stats),
            _ => None,
        }
    }

    /// Clear every aggregate metric map, leaving consumed time in place.
    pub fn clear_metric_maps(&mut self) {
        for name in METRIC_MAP_NAMES {
            if let Some(map) = self.metric_map_mut(name) {
                map.clear();
            }
        }
    }
}

/// A named partition of backends and ownership records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster identifier
    pub id: String,

    /// Updater instances allowed to enrich this cluster's units
    #[serde(default)]
    pub updaters: Vec<String>,
}

/// Units of one cluster, as handed to updaters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterUnits {
    /// The owning cluster
    pub cluster: Cluster,

    /// Units belonging to the cluster
    #[serde(default)]
    pub units: Vec<Unit>,
}
