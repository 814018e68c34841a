use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

use crate::api::client::MetricsCallback;

const NAMESPACE: &str = "influx_importer";

/// Prometheus metrics for a single extraction run.
///
/// All metrics use the "influx_importer" namespace. Counters are atomic so
/// router tasks update them without coordination.
pub struct RunMetrics {
    registry: Registry,

    /// Fetch items by kind (metric/alarm) and outcome (success/failure).
    pub fetches_total: IntCounterVec,
    /// Metric rows written to the sink.
    pub points_written: IntCounter,
    /// Alarm records written to the sink.
    pub alarms_written: IntCounter,
    /// Windows that fell back to the max lookback.
    pub checkpoint_defaults: IntCounter,
    /// Duration of a single fetch-and-write item.
    pub fetch_duration: Histogram,
    /// Management API requests by endpoint and status.
    pub api_requests_total: IntCounterVec,
    /// Management API request duration by endpoint.
    pub api_request_duration: HistogramVec,
    /// Router tasks currently holding a concurrency permit.
    pub active_routers: IntGauge,
    /// Highest number of router tasks active at once.
    pub peak_active_routers: IntGauge,

    active: AtomicUsize,
    peak: AtomicUsize,
}

impl RunMetrics {
    /// Creates a new run metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let fetches_total = IntCounterVec::new(
            Opts::new("fetches_total", "Fetch items by kind and outcome.").namespace(NAMESPACE),
            &["kind", "outcome"],
        )?;
        let points_written = IntCounter::with_opts(
            Opts::new("points_written_total", "Metric rows written to InfluxDB.")
                .namespace(NAMESPACE),
        )?;
        let alarms_written = IntCounter::with_opts(
            Opts::new("alarms_written_total", "Alarm records written to InfluxDB.")
                .namespace(NAMESPACE),
        )?;
        let checkpoint_defaults = IntCounter::with_opts(
            Opts::new(
                "checkpoint_defaults_total",
                "Query windows that fell back to the max lookback.",
            )
            .namespace(NAMESPACE),
        )?;
        let fetch_duration = Histogram::with_opts(
            HistogramOpts::new(
                "fetch_duration_seconds",
                "Time to fetch and write a single item.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let api_requests_total = IntCounterVec::new(
            Opts::new(
                "api_requests_total",
                "Conductor API requests by endpoint and status.",
            )
            .namespace(NAMESPACE),
            &["endpoint", "status"],
        )?;
        let api_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "api_request_duration_seconds",
                "Conductor API request duration by endpoint.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["endpoint"],
        )?;
        let active_routers = IntGauge::with_opts(
            Opts::new("active_routers", "Router tasks currently running.").namespace(NAMESPACE),
        )?;
        let peak_active_routers = IntGauge::with_opts(
            Opts::new(
                "peak_active_routers",
                "Highest number of router tasks running at once.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(fetches_total.clone()))?;
        registry.register(Box::new(points_written.clone()))?;
        registry.register(Box::new(alarms_written.clone()))?;
        registry.register(Box::new(checkpoint_defaults.clone()))?;
        registry.register(Box::new(fetch_duration.clone()))?;
        registry.register(Box::new(api_requests_total.clone()))?;
        registry.register(Box::new(api_request_duration.clone()))?;
        registry.register(Box::new(active_routers.clone()))?;
        registry.register(Box::new(peak_active_routers.clone()))?;

        Ok(Self {
            registry,
            fetches_total,
            points_written,
            alarms_written,
            checkpoint_defaults,
            fetch_duration,
            api_requests_total,
            api_request_duration,
            active_routers,
            peak_active_routers,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Marks a router task as active until the guard is dropped.
    pub fn enter_router(self: &Arc<Self>) -> RouterGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let peak = self.peak.fetch_max(now, Ordering::SeqCst).max(now);

        self.active_routers.inc();
        self.peak_active_routers.set(peak as i64);

        RouterGuard {
            metrics: Arc::clone(self),
        }
    }

    /// Highest number of router tasks active at once so far.
    pub fn peak_routers(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn record_fetch(&self, kind: &str, ok: bool, duration: Duration) {
        let outcome = if ok { "success" } else { "failure" };
        self.fetches_total.with_label_values(&[kind, outcome]).inc();
        self.fetch_duration.observe(duration.as_secs_f64());
    }

    pub fn record_checkpoint_default(&self) {
        self.checkpoint_defaults.inc();
    }

    pub fn checkpoint_defaults(&self) -> u64 {
        self.checkpoint_defaults.get()
    }

    /// Callback for the conductor client's per-request stats.
    pub fn request_callback(self: &Arc<Self>) -> MetricsCallback {
        let metrics = Arc::clone(self);
        Box::new(move |endpoint, status, duration| {
            metrics
                .api_requests_total
                .with_label_values(&[endpoint, status])
                .inc();
            metrics
                .api_request_duration
                .with_label_values(&[endpoint])
                .observe(duration.as_secs_f64());
        })
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Writes the rendered metrics for node-exporter's textfile collector.
    ///
    /// The file is replaced atomically so the collector never sees a partial write.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let text = self.render()?;
        let tmp = path.with_extension("prom.tmp");

        std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;

        Ok(())
    }
}

/// Decrements the active router count when dropped.
pub struct RouterGuard {
    metrics: Arc<RunMetrics>,
}

impl Drop for RouterGuard {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::SeqCst);
        self.metrics.active_routers.dec();
    }
}
