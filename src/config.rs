use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::catalog::{MetricCatalog, MetricSource};

/// Top-level configuration for the importer.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Scheduling configuration.
    #[serde(default)]
    pub application: ApplicationConfig,

    /// 128T conductor connection configuration.
    #[serde(default)]
    pub target: TargetConfig,

    /// InfluxDB connection configuration.
    #[serde(default)]
    pub influx: InfluxConfig,

    /// Alarm history collection configuration.
    #[serde(default)]
    pub alarm_history: AlarmHistoryConfig,

    /// Metric collection configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Run metrics output configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationConfig {
    /// Maximum number of routers queried at the same time. Default: 10.
    #[serde(default = "default_max_concurrent_routers")]
    pub max_concurrent_routers: usize,

    /// Older configuration files carried the metric lookback here.
    #[serde(default)]
    pub query_time: Option<u64>,
}

/// 128T conductor connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Fully qualified URL of the conductor (e.g., "https://10.0.1.29").
    #[serde(default)]
    pub url: String,

    /// JWT acquired by logging into the conductor.
    #[serde(default)]
    pub token: String,

    /// Per-request timeout. Default: 30s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Accept self-signed conductor certificates. Default: true.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

/// InfluxDB connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    /// InfluxDB HTTP address (e.g., "http://localhost:8086").
    #[serde(default)]
    pub address: String,

    /// Target database name.
    #[serde(default)]
    pub database: String,

    /// InfluxDB username.
    #[serde(default)]
    pub username: String,

    /// InfluxDB password.
    #[serde(default)]
    pub password: String,

    /// Per-request timeout. Default: 30s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Write body compression (none, gzip). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,
}

/// Alarm history collection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AlarmHistoryConfig {
    /// Collect alarm history. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum seconds to look back for alarms. Default: 3600.
    #[serde(default = "default_max_query_time")]
    pub max_query_time: u64,
}

/// Metric collection configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Maximum seconds to look back for metrics. Default: 3600 when neither
    /// this nor `application.query_time` is set.
    #[serde(default)]
    pub max_query_time: Option<u64>,

    /// Where the metric catalog comes from. Default: static.
    #[serde(default)]
    pub source: MetricSource,

    /// Metric ids to collect.
    #[serde(default)]
    pub enabled: Vec<String>,
}

/// Run metrics output configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    /// Write Prometheus text exposition here at the end of a run.
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_concurrent_routers() -> usize {
    10
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_max_query_time() -> u64 {
    3600
}

/// Upper bound for any lookback, ten years.
pub const MAX_QUERY_TIME_SECS: u64 = 10 * 365 * 24 * 3600;

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            application: ApplicationConfig::default(),
            target: TargetConfig::default(),
            influx: InfluxConfig::default(),
            alarm_history: AlarmHistoryConfig::default(),
            metrics: MetricsConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            max_concurrent_routers: default_max_concurrent_routers(),
            query_time: None,
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            timeout: default_request_timeout(),
            accept_invalid_certs: true,
        }
    }
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            database: String::new(),
            username: String::new(),
            password: String::new(),
            timeout: default_request_timeout(),
            compression: default_compression(),
        }
    }
}

impl Default for AlarmHistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_query_time: default_max_query_time(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.application.max_concurrent_routers == 0 {
            bail!("application.max_concurrent_routers must be greater than 0");
        }

        if self.target.url.is_empty() {
            bail!("target.url is required");
        }

        if self.target.token.is_empty() {
            bail!("target.token is required");
        }

        if self.influx.address.is_empty() {
            bail!("influx.address is required");
        }

        if self.influx.database.is_empty() {
            bail!("influx.database is required");
        }

        let compression = &self.influx.compression;
        match compression.as_str() {
            "none" | "gzip" => {}
            _ => bail!("invalid influx compression type: {compression}"),
        }

        if self.metric_lookback().is_zero() {
            bail!("metrics.max_query_time must be greater than 0 seconds");
        }

        if self.alarm_history.enabled && self.alarm_history.max_query_time == 0 {
            bail!("alarm_history.max_query_time must be greater than 0 seconds");
        }

        if self.metric_lookback().as_secs() > MAX_QUERY_TIME_SECS {
            bail!("metrics.max_query_time must not exceed {MAX_QUERY_TIME_SECS} seconds");
        }

        if self.alarm_history.max_query_time > MAX_QUERY_TIME_SECS {
            bail!("alarm_history.max_query_time must not exceed {MAX_QUERY_TIME_SECS} seconds");
        }

        // Discovered catalogs can only be checked against the conductor.
        if self.metrics.source == MetricSource::Static {
            MetricCatalog::builtin()
                .select(&self.metrics.enabled)
                .context("invalid metrics.enabled")?;
        }

        Ok(())
    }

    /// How far back metric collection may reach.
    pub fn metric_lookback(&self) -> Duration {
        let secs = self
            .metrics
            .max_query_time
            .or(self.application.query_time)
            .unwrap_or_else(default_max_query_time);
        Duration::from_secs(secs)
    }

    /// How far back alarm collection may reach.
    pub fn alarm_lookback(&self) -> Duration {
        Duration::from_secs(self.alarm_history.max_query_time)
    }
}

/// Renders a commented configuration template listing every catalog metric.
pub fn render_template(url: &str, token: &str, catalog: &MetricCatalog) -> String {
    let mut out = String::with_capacity(4096 + catalog.len() * 96);

    let _ = writeln!(out, "log_level: info");
    let _ = writeln!(out);
    let _ = writeln!(out, "application:");
    let _ = writeln!(out, "  # The maximum number of routers to query at a given time.");
    let _ = writeln!(out, "  max_concurrent_routers: 10");
    let _ = writeln!(out);
    let _ = writeln!(out, "target:");
    let _ = writeln!(
        out,
        "  # The fully qualified URL to the 128T web instance, e.g. https://10.0.1.29"
    );
    let _ = writeln!(out, "  url: \"{url}\"");
    let _ = writeln!(out, "  # The JWT acquired when logging into the 128T application.");
    let _ = writeln!(out, "  # Run `influx-importer get-token <url>` to obtain one.");
    let _ = writeln!(out, "  token: \"{token}\"");
    let _ = writeln!(out, "  timeout: 30s");
    let _ = writeln!(out);
    let _ = writeln!(out, "influx:");
    let _ = writeln!(
        out,
        "  # The address of the InfluxDB instance, typically an HTTP address."
    );
    let _ = writeln!(out, "  address: \"\"");
    let _ = writeln!(out, "  database: \"\"");
    let _ = writeln!(out, "  username: \"\"");
    let _ = writeln!(out, "  password: \"\"");
    let _ = writeln!(out, "  compression: gzip");
    let _ = writeln!(out);
    let _ = writeln!(out, "alarm_history:");
    let _ = writeln!(out, "  # Whether alarm history should be collected.");
    let _ = writeln!(out, "  enabled: true");
    let _ = writeln!(
        out,
        "  # The maximum time, in seconds, to go back and collect alarms for."
    );
    let _ = writeln!(out, "  max_query_time: 3600");
    let _ = writeln!(out);
    let _ = writeln!(out, "metrics:");
    let _ = writeln!(
        out,
        "  # The maximum time, in seconds, to go back and collect metrics for."
    );
    let _ = writeln!(out, "  max_query_time: 3600");
    let _ = writeln!(out, "  source: static");
    let _ = writeln!(out);
    let _ = writeln!(out, "  # All metrics are disabled by default.");
    let _ = writeln!(out, "  # Uncomment the desired stats to begin pulling them.");
    let _ = writeln!(
        out,
        "  # The more stats you enable the longer queries take and the more"
    );
    let _ = writeln!(out, "  # consistent burden you place on the 128T routers.");
    let _ = writeln!(out, "  enabled:");

    for metric in catalog.iter() {
        let _ = writeln!(out, "    # {}", metric.description);
        let _ = writeln!(out, "    # - {}", metric.id);
    }

    out
}
