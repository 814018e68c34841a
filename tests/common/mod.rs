#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

use influx_importer::api::topology::Configuration;
use influx_importer::api::{
    AuditEvent, ManagementApi, MetricPermutation, MetricRequest, Point, SystemInfo,
};
use influx_importer::catalog::{MetricCatalog, MetricDescriptor, MetricSource};
use influx_importer::extract::ExtractSettings;
use influx_importer::sink::{Record, TimeSeriesSink};
use influx_importer::tags::TagSet;

// --- Management API fake ---

#[derive(Debug, Clone)]
pub struct MetricCall {
    pub router: String,
    pub request: MetricRequest,
}

#[derive(Debug, Clone)]
pub struct AlarmCall {
    pub router: String,
    pub categories: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Default)]
pub struct FakeApi {
    pub configuration: Option<Configuration>,
    pub version: Option<String>,
    pub metadata: Vec<MetricDescriptor>,
    pub permutations: HashMap<(String, String), Vec<MetricPermutation>>,
    /// Points returned for every metric query.
    pub points: Vec<Point>,
    /// Filter strings whose metric queries fail.
    pub failing_filters: HashSet<String>,
    /// Routers whose alarm queries fail.
    pub failing_alarms: HashSet<String>,
    /// Routers whose alarm queries panic.
    pub panicking_alarms: HashSet<String>,
    pub events: HashMap<String, Vec<AuditEvent>>,
    pub metric_delay: Option<StdDuration>,

    pub metric_calls: Mutex<Vec<MetricCall>>,
    pub audit_calls: Mutex<Vec<AlarmCall>>,
    pub legacy_calls: Mutex<Vec<AlarmCall>>,
    pub system_calls: AtomicUsize,

    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeApi {
    pub fn with_config(json: &str) -> Self {
        Self {
            configuration: Some(serde_json::from_str(json).expect("valid configuration")),
            version: Some("5.4.0".to_string()),
            ..Default::default()
        }
    }

    pub fn metric_calls(&self) -> Vec<MetricCall> {
        self.metric_calls.lock().clone()
    }

    fn events_for(&self, router: &str) -> Result<Vec<AuditEvent>> {
        if self.panicking_alarms.contains(router) {
            panic!("alarm handler crashed for {router}");
        }
        if self.failing_alarms.contains(router) {
            bail!("alarm endpoint unavailable for {router}");
        }
        Ok(self.events.get(router).cloned().unwrap_or_default())
    }
}

impl ManagementApi for FakeApi {
    async fn get_configuration(&self) -> Result<Configuration> {
        match &self.configuration {
            Some(cfg) => Ok(cfg.clone()),
            None => bail!("unexpected status 503 from /api/v1/config/getJSON"),
        }
    }

    async fn get_system_info(&self) -> Result<SystemInfo> {
        self.system_calls.fetch_add(1, Ordering::SeqCst);
        match &self.version {
            Some(version) => Ok(SystemInfo {
                version: version.clone(),
            }),
            None => bail!("unexpected status 500 from /api/v1/system"),
        }
    }

    async fn get_metric_metadata(&self) -> Result<Vec<MetricDescriptor>> {
        Ok(self.metadata.clone())
    }

    async fn get_metric_permutations(
        &self,
        router: &str,
        metric: &MetricDescriptor,
    ) -> Result<Vec<MetricPermutation>> {
        match self
            .permutations
            .get(&(router.to_string(), metric.id.clone()))
        {
            Some(perms) => Ok(perms.clone()),
            None => bail!("no permutations for {} on {router}", metric.id),
        }
    }

    async fn get_metric(&self, router: &str, request: &MetricRequest) -> Result<Vec<Point>> {
        self.metric_calls.lock().push(MetricCall {
            router: router.to_string(),
            request: request.clone(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.metric_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let filter = request
            .filters
            .first()
            .map(ToString::to_string)
            .unwrap_or_default();
        if self.failing_filters.contains(&filter) {
            bail!("unexpected status 500 from /api/v1/router/{router}/metrics");
        }

        Ok(self.points.clone())
    }

    async fn get_audit_events(
        &self,
        router: &str,
        categories: &[&str],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditEvent>> {
        self.audit_calls.lock().push(AlarmCall {
            router: router.to_string(),
            categories: categories.iter().map(|c| (*c).to_string()).collect(),
            start,
            end,
        });
        self.events_for(router)
    }

    async fn get_legacy_alarm_history(
        &self,
        router: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditEvent>> {
        self.legacy_calls.lock().push(AlarmCall {
            router: router.to_string(),
            categories: Vec::new(),
            start,
            end,
        });
        self.events_for(router)
    }
}

// --- Sink fake ---

#[derive(Debug, Clone)]
pub struct PointWrite {
    pub series: String,
    pub tags: TagSet,
    pub points: Vec<Point>,
}

#[derive(Debug, Clone)]
pub struct RecordWrite {
    pub series: String,
    pub records: Vec<Record>,
}

/// In-memory sink keeping every write and answering checkpoint queries
/// from them with AND semantics over the query tags.
#[derive(Default)]
pub struct MemorySink {
    pub ping_fails: bool,
    pub query_fails: bool,
    pub point_writes: Mutex<Vec<PointWrite>>,
    pub record_writes: Mutex<Vec<RecordWrite>>,
}

impl MemorySink {
    pub fn point_writes(&self) -> Vec<PointWrite> {
        self.point_writes.lock().clone()
    }

    pub fn record_writes(&self) -> Vec<RecordWrite> {
        self.record_writes.lock().clone()
    }

    /// Seeds a metric row as if written by an earlier run.
    pub fn seed_point(&self, series: &str, tags: TagSet, time: DateTime<Utc>) {
        self.point_writes.lock().push(PointWrite {
            series: series.to_string(),
            tags,
            points: vec![Point { value: 1.0, time }],
        });
    }
}

fn matches(row_tags: &TagSet, query: &TagSet) -> bool {
    query.iter().all(|(k, v)| row_tags.get(k) == Some(v))
}

impl TimeSeriesSink for MemorySink {
    async fn ping(&self) -> Result<()> {
        if self.ping_fails {
            bail!("connection refused");
        }
        Ok(())
    }

    async fn last_recorded_time(
        &self,
        series: &str,
        tags: &TagSet,
    ) -> Result<Option<DateTime<Utc>>> {
        if self.query_fails {
            bail!("database not found");
        }

        let points = self
            .point_writes
            .lock()
            .iter()
            .filter(|w| w.series == series && matches(&w.tags, tags))
            .flat_map(|w| w.points.iter().map(|p| p.time))
            .max();
        let records = self
            .record_writes
            .lock()
            .iter()
            .filter(|w| w.series == series)
            .flat_map(|w| w.records.iter())
            .filter(|r| matches(&r.tags, tags))
            .map(|r| r.time)
            .max();

        Ok(points.max(records))
    }

    async fn write_points(&self, series: &str, tags: &TagSet, points: &[Point]) -> Result<usize> {
        self.point_writes.lock().push(PointWrite {
            series: series.to_string(),
            tags: tags.clone(),
            points: points.to_vec(),
        });
        Ok(points.len())
    }

    async fn write_records(&self, series: &str, records: &[Record]) -> Result<usize> {
        self.record_writes.lock().push(RecordWrite {
            series: series.to_string(),
            records: records.to_vec(),
        });
        Ok(records.len())
    }
}

// --- Helpers ---

pub fn settings(catalog: MetricCatalog, metrics: &[&str]) -> ExtractSettings {
    ExtractSettings {
        max_concurrent_routers: 10,
        metric_lookback: Duration::seconds(3600),
        alarm_lookback: Duration::seconds(3600),
        alarm_history: false,
        source: MetricSource::Static,
        catalog,
        metrics: metrics.iter().map(|m| (*m).to_string()).collect(),
    }
}

pub fn catalog(metrics: Vec<MetricDescriptor>) -> MetricCatalog {
    metrics.into_iter().collect()
}

/// Running configuration with routers named `R1..=Rn`, each with one node `N1`.
pub fn routers_config(n: usize) -> String {
    let routers: Vec<String> = (1..=n)
        .map(|i| format!(r#"{{"name": "R{i}", "node": [{{"name": "N1"}}]}}"#))
        .collect();
    format!(r#"{{"authority": {{"router": [{}]}}}}"#, routers.join(","))
}

/// Seconds in a `now-N` window expression.
pub fn window_seconds(request: &MetricRequest) -> i64 {
    request
        .window
        .start
        .strip_prefix("now-")
        .and_then(|n| n.parse().ok())
        .expect("relative window start")
}

// --- Log capture ---

/// Shared buffer usable as a `tracing_subscriber` writer.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.contents().lines().filter(|l| l.contains(needle)).count()
    }
}

pub struct LogCaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter(Arc::clone(&self.0))
    }
}
