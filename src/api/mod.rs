pub mod client;
pub mod events;
pub mod topology;

use std::collections::BTreeMap;
use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::MetricDescriptor;
use crate::tags::TagSet;

pub use client::Client;
pub use events::{AuditEvent, ALARM_CATEGORY};
pub use topology::Configuration;

/// A single analytic sample.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Point {
    pub value: f64,
    #[serde(rename = "date")]
    pub time: DateTime<Utc>,
}

/// Query window expressed as upstream time-bound expressions (`now-3600`, `now`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalyticWindow {
    pub start: String,
    pub end: String,
}

/// Request body for a router metric query.
#[derive(Debug, Clone, Serialize)]
pub struct MetricRequest {
    pub id: String,
    pub transform: String,
    pub window: AnalyticWindow,
    pub filters: Vec<TagSet>,
}

impl MetricRequest {
    /// A `sum`-transformed query for one metric narrowed by a single filter.
    pub fn sum(metric: &MetricDescriptor, window: AnalyticWindow, filter: TagSet) -> Self {
        let filters = if filter.is_empty() {
            Vec::new()
        } else {
            vec![filter]
        };

        Self {
            id: metric.stat_path(),
            transform: "sum".to_string(),
            window,
            filters,
        }
    }
}

/// Conductor system information.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub version: String,
}

/// One available parameter combination for a metric on a router.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MetricPermutation {
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Typed operations of the 128T management API consumed by the extractor.
pub trait ManagementApi: Send + Sync {
    /// Fetch the running configuration (topology snapshot).
    fn get_configuration(&self) -> impl Future<Output = Result<Configuration>> + Send;

    /// Fetch conductor system information, including the software version.
    fn get_system_info(&self) -> impl Future<Output = Result<SystemInfo>> + Send;

    /// Fetch metadata for every metric the conductor exposes.
    fn get_metric_metadata(&self) -> impl Future<Output = Result<Vec<MetricDescriptor>>> + Send;

    /// Fetch the parameter combinations available for a metric on a router.
    fn get_metric_permutations(
        &self,
        router: &str,
        metric: &MetricDescriptor,
    ) -> impl Future<Output = Result<Vec<MetricPermutation>>> + Send;

    /// Query a metric on a router.
    fn get_metric(
        &self,
        router: &str,
        request: &MetricRequest,
    ) -> impl Future<Output = Result<Vec<Point>>> + Send;

    /// Fetch audit events of the given categories between `start` and `end`.
    fn get_audit_events(
        &self,
        router: &str,
        categories: &[&str],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<AuditEvent>>> + Send;

    /// Fetch alarm history from the pre-audit endpoint used by 3.1.x conductors.
    fn get_legacy_alarm_history(
        &self,
        router: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<AuditEvent>>> + Send;
}
