use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Describes a fetchable metric and the topology entity types it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Entity-type keys (e.g. `node`, `peer-path`) the metric is meaningful for.
    #[serde(default, rename = "keys")]
    pub applicability_keys: BTreeSet<String>,
}

impl MetricDescriptor {
    pub fn new(id: &str, description: &str, keys: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            applicability_keys: keys.iter().map(|k| (*k).to_string()).collect(),
        }
    }

    /// Whether the metric applies to entities of the given type key.
    pub fn applies_to(&self, key: &str) -> bool {
        self.applicability_keys.contains(key)
    }

    /// Upstream statistic path for this metric.
    pub fn stat_path(&self) -> String {
        format!("/stats/{}", self.id)
    }
}

/// Builtin statistics: (id, description, applicability keys).
static BUILTIN_METRICS: &[(&str, &str, &[&str])] = &[
    ("cpu/utilization", "Average CPU utilization of the node.", &["node"]),
    ("memory/utilization", "Memory utilization of the node.", &["node"]),
    ("disk/utilization", "Disk utilization of the node.", &["node"]),
    (
        "aggregate-session/node/session-count",
        "Active sessions on the node.",
        &["node"],
    ),
    (
        "aggregate-session/node/session-arrival-rate",
        "Rate of new sessions arriving at the node.",
        &["node"],
    ),
    (
        "interface/received/bytes",
        "Bytes received on the device interface.",
        &["device-interface"],
    ),
    (
        "interface/sent/bytes",
        "Bytes sent on the device interface.",
        &["device-interface"],
    ),
    (
        "interface/received/packets",
        "Packets received on the device interface.",
        &["device-interface"],
    ),
    (
        "interface/sent/packets",
        "Packets sent on the device interface.",
        &["device-interface"],
    ),
    (
        "interface/received/error",
        "Receive errors on the device interface.",
        &["device-interface"],
    ),
    (
        "interface/sent/error",
        "Transmit errors on the device interface.",
        &["device-interface"],
    ),
    (
        "network-interface/received/bytes",
        "Bytes received on the network interface.",
        &["network-interface"],
    ),
    (
        "network-interface/sent/bytes",
        "Bytes sent on the network interface.",
        &["network-interface"],
    ),
    ("peer-path/latency", "Latency measured on the peer path.", &["peer-path"]),
    ("peer-path/jitter", "Jitter measured on the peer path.", &["peer-path"]),
    ("peer-path/loss", "Packet loss measured on the peer path.", &["peer-path"]),
    ("peer-path/mos", "Mean opinion score of the peer path.", &["peer-path"]),
    (
        "aggregate-session/service/session-count",
        "Active sessions for the service.",
        &["service"],
    ),
    (
        "aggregate-session/service/bandwidth",
        "Bandwidth used by the service.",
        &["service"],
    ),
    (
        "aggregate-session/tenant/session-count",
        "Active sessions for the tenant.",
        &["tenant"],
    ),
    (
        "aggregate-session/tenant/bandwidth",
        "Bandwidth used by the tenant.",
        &["tenant"],
    ),
    (
        "aggregate-session/service-class/session-count",
        "Active sessions for the service class.",
        &["service-class"],
    ),
    (
        "aggregate-session/service-class/bandwidth",
        "Bandwidth used by the service class.",
        &["service-class"],
    ),
    (
        "aggregate-session/service-route/session-count",
        "Active sessions using the service route.",
        &["service-route"],
    ),
    (
        "aggregate-session/service-route/bandwidth",
        "Bandwidth used by the service route.",
        &["service-route"],
    ),
    (
        "aggregate-session/service-group/session-count",
        "Active sessions for the service group.",
        &["service-group"],
    ),
    (
        "aggregate-session/service-group/bandwidth",
        "Bandwidth used by the service group.",
        &["service-group"],
    ),
];

/// Where the metric catalog comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    /// The builtin table, fetched per topology entity.
    #[default]
    Static,
    /// Metric metadata and parameter permutations queried from the conductor.
    Discovered,
}

/// An ordered collection of metric descriptors.
#[derive(Debug, Clone, Default)]
pub struct MetricCatalog {
    metrics: Vec<Arc<MetricDescriptor>>,
}

impl MetricCatalog {
    /// The builtin statistics table.
    pub fn builtin() -> Self {
        BUILTIN_METRICS
            .iter()
            .map(|(id, description, keys)| MetricDescriptor::new(id, description, keys))
            .collect()
    }

    pub fn find(&self, id: &str) -> Option<&Arc<MetricDescriptor>> {
        self.metrics.iter().find(|m| m.id == id)
    }

    /// Narrows the catalog to the given ids, in the order given.
    ///
    /// An empty selection yields an empty catalog; unknown ids are an error.
    pub fn select(&self, ids: &[String]) -> Result<Self> {
        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            match self.find(id) {
                Some(metric) => selected.push(Arc::clone(metric)),
                None => bail!("{id} is not a valid metric"),
            }
        }
        Ok(Self { metrics: selected })
    }

    /// Metrics applicable to the given entity-type key, in catalog order.
    pub fn applicable_to<'a>(
        &'a self,
        key: &'a str,
    ) -> impl Iterator<Item = &'a Arc<MetricDescriptor>> + 'a {
        self.metrics.iter().filter(move |m| m.applies_to(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MetricDescriptor>> {
        self.metrics.iter()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

impl FromIterator<MetricDescriptor> for MetricCatalog {
    fn from_iter<I: IntoIterator<Item = MetricDescriptor>>(iter: I) -> Self {
        Self {
            metrics: iter.into_iter().map(Arc::new).collect(),
        }
    }
}
