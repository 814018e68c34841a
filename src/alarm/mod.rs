pub mod geo;

use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use tracing::{info, warn};

use crate::api::topology::Router;
use crate::api::{AuditEvent, ManagementApi, ALARM_CATEGORY};
use crate::checkpoint::{CheckpointResolver, ALARM_RESOLUTION};
use crate::health::RunMetrics;
use crate::sink::{FieldValue, Record, TimeSeriesSink};
use crate::tags::{TagSet, ROUTER_TAG};

pub use geo::location_to_geohash;

/// Series alarm events are written under.
pub const ALARM_HISTORY_SERIES: &str = "alarm-history";

pub const NODE_TAG: &str = "node";
pub const GEOHASH_TAG: &str = "geohash";

/// Which endpoint serves alarm history for a conductor version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmProtocol {
    /// Pre-audit alarm endpoint (3.1.x and older).
    Legacy,
    /// Audit endpoint filtered to the alarm category.
    Audit,
}

impl AlarmProtocol {
    /// Selects the protocol from a version string such as `4.2.0` or `3.1.2-1.el7`.
    /// Unparseable versions use the audit endpoint.
    pub fn for_version(version: &str) -> Self {
        match parse_major_minor(version) {
            Some((major, minor)) if major < 3 || (major == 3 && minor <= 1) => {
                AlarmProtocol::Legacy
            }
            _ => AlarmProtocol::Audit,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlarmProtocol::Legacy => "legacy",
            AlarmProtocol::Audit => "audit",
        }
    }
}

fn parse_major_minor(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().trim_start_matches('v').split('.');
    let major = leading_number(parts.next()?)?;
    let minor = parts.next().and_then(leading_number).unwrap_or(0);
    Some((major, minor))
}

fn leading_number(s: &str) -> Option<u32> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().ok()
}

/// Converts events into records.
///
/// Event `i` is stamped `timestamp + i ns` so events sharing a reported time
/// stay distinct rows, in upstream order.
pub fn events_to_records(events: Vec<AuditEvent>, router: &str, geohash: &str) -> Vec<Record> {
    events
        .into_iter()
        .enumerate()
        .map(|(i, event)| {
            let tags = TagSet::new()
                .with(ROUTER_TAG, router)
                .with(NODE_TAG, event.node)
                .with(GEOHASH_TAG, geohash);

            let time = event.timestamp + Duration::nanoseconds(i as i64);
            let fields = event
                .data
                .into_iter()
                .map(|(k, v)| (k, FieldValue::from(v)));

            Record::new(time, tags, fields)
        })
        .collect()
}

/// Synchronizes the alarm history of one router into the sink.
pub struct AlarmSynchronizer<'a, A, S> {
    api: &'a A,
    sink: &'a S,
    protocol: AlarmProtocol,
    lookback: Duration,
    metrics: Option<Arc<RunMetrics>>,
}

impl<'a, A: ManagementApi, S: TimeSeriesSink> AlarmSynchronizer<'a, A, S> {
    pub fn new(api: &'a A, sink: &'a S, protocol: AlarmProtocol, lookback: Duration) -> Self {
        Self {
            api,
            sink,
            protocol,
            lookback,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fetches alarms raised since the router's checkpoint and writes them.
    /// Returns the number of records written.
    pub async fn sync_router(&self, router: &Router) -> Result<usize> {
        let scope = TagSet::new().with(ROUTER_TAG, router.name.as_str());

        let mut resolver = CheckpointResolver::new(self.sink, ALARM_RESOLUTION);
        if let Some(ref metrics) = self.metrics {
            resolver = resolver.with_metrics(Arc::clone(metrics));
        }
        let window = resolver
            .resolve_window(ALARM_HISTORY_SERIES, &scope, self.lookback)
            .await;

        let events = match self.protocol {
            AlarmProtocol::Legacy => {
                self.api
                    .get_legacy_alarm_history(&router.name, window.start, window.end)
                    .await?
            }
            AlarmProtocol::Audit => {
                self.api
                    .get_audit_events(&router.name, &[ALARM_CATEGORY], window.start, window.end)
                    .await?
            }
        };

        let seconds = window.width().num_seconds();
        if events.is_empty() {
            info!(
                router = %router.name,
                seconds,
                "no alarm history to export",
            );
            return Ok(0);
        }

        let geohash = router_geohash(router);
        let records = events_to_records(events, &router.name, &geohash);
        let written = self
            .sink
            .write_records(ALARM_HISTORY_SERIES, &records)
            .await?;

        info!(
            router = %router.name,
            seconds,
            items = written,
            protocol = self.protocol.as_str(),
            "exported alarm history",
        );

        Ok(written)
    }
}

/// Geohash of a router's location, empty when absent or unparseable.
fn router_geohash(router: &Router) -> String {
    if router.location.is_empty() {
        return String::new();
    }

    match location_to_geohash(&router.location) {
        Ok(hash) => hash,
        Err(e) => {
            warn!(
                router = %router.name,
                location = %router.location,
                error = %e,
                "error translating location to geohash",
            );
            String::new()
        }
    }
}
