//! TSDB-backed updater engine

use crate::{Instance, Result, Updater, UpdaterError};
use async_trait::async_trait;
use ceems_core::types::METRIC_MAP_NAMES;
use ceems_core::{sanitize_float, ClusterUnits, Unit};
use ceems_tsdb::{Sample, TsdbClient};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

/// Placeholder in query templates replaced by the UUID alternation.
const UUIDS_PLACEHOLDER: &str = "{{.UUIDs}}";

/// Placeholder in query templates replaced by the window length in seconds.
const DURATION_PLACEHOLDER: &str = "{{.Duration}}";

/// Kind-specific settings of a TSDB updater instance.
#[derive(Debug, Default, Deserialize)]
struct TsdbExtra {
    /// Units with walltime below this are excluded from enrichment
    #[serde(default, with = "ceems_core::config::serde_duration")]
    cutoff_duration: Duration,

    /// Metric map name -> subfield -> PromQL template
    #[serde(default)]
    queries: BTreeMap<String, BTreeMap<String, String>>,
}

/// Updater that folds TSDB aggregation queries into unit metric maps.
pub struct TsdbUpdater {
    id: String,
    client: TsdbClient,
    cutoff: Duration,
    queries: BTreeMap<String, BTreeMap<String, String>>,
}

impl TsdbUpdater {
    /// Build an updater from its instance config.
    pub fn new(instance: &Instance) -> Result<Self> {
        let extra: TsdbExtra = if instance.extra.is_null() {
            TsdbExtra::default()
        } else {
            serde_yaml::from_value(instance.extra.clone())
                .map_err(|e| UpdaterError::Configuration(format!("invalid extra config: {}", e)))?
        };

        for name in extra.queries.keys() {
            if !METRIC_MAP_NAMES.contains(&name.as_str()) {
                return Err(UpdaterError::Configuration(format!(
                    "unknown metric map {:?} in queries",
                    name
                )));
            }
        }

        Ok(Self {
            id: instance.id.clone(),
            client: TsdbClient::new(&instance.web)?,
            cutoff: extra.cutoff_duration,
            queries: extra.queries,
        })
    }

    /// Enrich one cluster's units in place.
    ///
    /// Queries run before any mutation, so a failed tick leaves the slice
    /// exactly as passed in.
    async fn update_units(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        units: &mut [Unit],
    ) -> Result<()> {
        if units.is_empty() {
            return Ok(());
        }

        let start_ms = start.timestamp_millis();
        let cutoff_secs = self.cutoff.as_secs_f64();
        let ignored: Vec<bool> = units
            .iter()
            .map(|unit| unit.walltime() < cutoff_secs)
            .collect();

        // Units that began inside the current window are left for a later
        // tick; their series are still settling in the TSDB.
        let eligible: Vec<String> = units
            .iter()
            .zip(&ignored)
            .filter(|(unit, ignored)| !**ignored && unit.started_at <= start_ms)
            .map(|(unit, _)| unit.uuid.clone())
            .collect();

        if eligible.is_empty() {
            apply_cutoff(units, &ignored);
            return Ok(());
        }

        let uuid_match = eligible
            .iter()
            .map(|uuid| regex::escape(uuid))
            .collect::<Vec<_>>()
            .join("|");
        let window = format!("{}s", (end - start).num_seconds().max(0));

        let mut queries = Vec::new();
        for (map_name, subfields) in &self.queries {
            for (field, template) in subfields {
                let expr = render_query(template, &uuid_match, &window);
                queries.push(async move {
                    let samples = self.client.query(&expr, end).await?;
                    Ok::<_, UpdaterError>((map_name.as_str(), field.as_str(), by_uuid(samples)))
                });
            }
        }
        let results = futures::future::try_join_all(queries).await?;
        debug!(
            instance = %self.id,
            queries = results.len(),
            units = eligible.len(),
            "joined TSDB aggregates"
        );

        for (index, unit) in units.iter_mut().enumerate() {
            if ignored[index] || unit.started_at > start_ms {
                continue;
            }
            for (map_name, field, values) in &results {
                if let Some(value) = values.get(&unit.uuid) {
                    if let Some(map) = unit.metric_map_mut(map_name) {
                        map.insert((*field).to_string(), sanitize_float(*value));
                    }
                }
            }
        }

        apply_cutoff(units, &ignored);
        Ok(())
    }
}

#[async_trait]
impl Updater for TsdbUpdater {
    async fn update(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        mut units: Vec<ClusterUnits>,
    ) -> Vec<ClusterUnits> {
        for cluster_units in &mut units {
            if !cluster_units
                .cluster
                .updaters
                .iter()
                .any(|id| id == &self.id)
            {
                continue;
            }
            if let Err(e) = self
                .update_units(start, end, &mut cluster_units.units)
                .await
            {
                warn!(
                    instance = %self.id,
                    cluster = %cluster_units.cluster.id,
                    error = %e,
                    "TSDB update failed, units left unchanged"
                );
            }
        }
        units
    }
}

/// Substitute template placeholders with concrete values.
fn render_query(template: &str, uuid_match: &str, window: &str) -> String {
    template
        .replace(UUIDS_PLACEHOLDER, uuid_match)
        .replace(DURATION_PLACEHOLDER, window)
}

/// Index sample values by their `uuid` label.
fn by_uuid(samples: Vec<Sample>) -> HashMap<String, f64> {
    samples
        .into_iter()
        .filter_map(|sample| {
            sample
                .labels
                .get("uuid")
                .map(|uuid| (uuid.clone(), sample.value))
        })
        .collect()
}

/// Flag cutoff units and drop any aggregates computed for them.
fn apply_cutoff(units: &mut [Unit], ignored: &[bool]) {
    for (unit, ignored) in units.iter_mut().zip(ignored) {
        if *ignored {
            unit.ignore = 1;
            unit.clear_metric_maps();
        }
    }
}
