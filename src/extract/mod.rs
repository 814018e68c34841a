use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::alarm::{AlarmProtocol, AlarmSynchronizer};
use crate::api::topology::{Authority, Router};
use crate::api::{ManagementApi, MetricRequest};
use crate::catalog::{MetricCatalog, MetricSource};
use crate::checkpoint::{CheckpointResolver, Window, METRIC_RESOLUTION};
use crate::config::Config;
use crate::health::RunMetrics;
use crate::plan::{plan_permutations, plan_router, FetchTarget};
use crate::sink::TimeSeriesSink;

/// Settings consumed by a run, derived from the validated configuration.
#[derive(Debug, Clone)]
pub struct ExtractSettings {
    pub max_concurrent_routers: usize,
    pub metric_lookback: Duration,
    pub alarm_lookback: Duration,
    pub alarm_history: bool,
    pub source: MetricSource,
    /// Table the static source selects from.
    pub catalog: MetricCatalog,
    pub metrics: Vec<String>,
}

impl ExtractSettings {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let metric_lookback =
            Duration::from_std(cfg.metric_lookback()).context("metric lookback out of range")?;
        let alarm_lookback =
            Duration::from_std(cfg.alarm_lookback()).context("alarm lookback out of range")?;

        Ok(Self {
            max_concurrent_routers: cfg.application.max_concurrent_routers,
            metric_lookback,
            alarm_lookback,
            alarm_history: cfg.alarm_history.enabled,
            source: cfg.metrics.source,
            catalog: MetricCatalog::builtin(),
            metrics: cfg.metrics.enabled.clone(),
        })
    }
}

/// Outcome counts of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub routers: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub points_written: usize,
    pub alarms_written: usize,
    /// Routers with at least one failed item, sorted.
    pub failed_routers: Vec<String>,
}

#[derive(Debug, Default)]
struct RouterReport {
    succeeded: usize,
    failed: usize,
    points: usize,
    alarms: usize,
}

/// Shared, read-only state of a run.
struct RunContext<A, S> {
    api: Arc<A>,
    sink: Arc<S>,
    settings: ExtractSettings,
    metrics: Arc<RunMetrics>,
    authority: Authority,
    service_groups: BTreeSet<String>,
    catalog: MetricCatalog,
    protocol: AlarmProtocol,
}

/// Runs one extraction over every router of the conductor.
pub struct Extractor<A, S> {
    api: Arc<A>,
    sink: Arc<S>,
    settings: ExtractSettings,
    metrics: Arc<RunMetrics>,
}

impl<A, S> Extractor<A, S>
where
    A: ManagementApi + 'static,
    S: TimeSeriesSink + 'static,
{
    pub fn new(
        api: Arc<A>,
        sink: Arc<S>,
        settings: ExtractSettings,
        metrics: Arc<RunMetrics>,
    ) -> Self {
        Self {
            api,
            sink,
            settings,
            metrics,
        }
    }

    /// Executes the run.
    ///
    /// Only setup failures (sink ping, configuration snapshot, metric catalog)
    /// are returned as errors; per-item failures are logged and counted.
    pub async fn run(&self) -> Result<RunSummary> {
        self.sink.ping().await.context("connecting to InfluxDB")?;

        let configuration = self
            .api
            .get_configuration()
            .await
            .context("retrieving 128T configuration")?;

        let catalog = self.resolve_catalog().await?;
        let protocol = self.alarm_protocol().await;

        let authority = configuration.authority;
        let service_groups = authority.service_groups();
        let routers = authority.routers.len();

        info!(
            routers,
            metrics = catalog.len(),
            source = ?self.settings.source,
            alarm_history = self.settings.alarm_history,
            "starting extraction",
        );

        let ctx = Arc::new(RunContext {
            api: Arc::clone(&self.api),
            sink: Arc::clone(&self.sink),
            settings: self.settings.clone(),
            metrics: Arc::clone(&self.metrics),
            authority,
            service_groups,
            catalog,
            protocol,
        });

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_routers));
        let mut tasks = JoinSet::new();

        for idx in 0..routers {
            let ctx = Arc::clone(&ctx);
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let name = ctx.authority.routers[idx].name.clone();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        warn!(router = %name, error = %e, "router semaphore closed");
                        return (name, RouterReport::default());
                    }
                };
                let _active = ctx.metrics.enter_router();

                // Run the router on its own task so a panic is attributed to it.
                let worker = {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        let router = &ctx.authority.routers[idx];
                        process_router(&ctx, router).await
                    })
                };

                match worker.await {
                    Ok(report) => (name, report),
                    Err(e) => {
                        warn!(router = %name, error = %e, "router task failed");
                        let report = RouterReport {
                            failed: 1,
                            ..Default::default()
                        };
                        (name, report)
                    }
                }
            });
        }

        let mut summary = RunSummary {
            routers,
            ..Default::default()
        };

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, report)) => {
                    summary.succeeded += report.succeeded;
                    summary.failed += report.failed;
                    summary.points_written += report.points;
                    summary.alarms_written += report.alarms;
                    if report.failed > 0 {
                        summary.failed_routers.push(name);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "router task join failed");
                    summary.failed += 1;
                }
            }
        }
        summary.failed_routers.sort();

        info!(
            routers = summary.routers,
            succeeded = summary.succeeded,
            failed = summary.failed,
            points = summary.points_written,
            alarms = summary.alarms_written,
            peak_active_routers = self.metrics.peak_routers(),
            "extraction complete",
        );

        Ok(summary)
    }

    async fn resolve_catalog(&self) -> Result<MetricCatalog> {
        match self.settings.source {
            MetricSource::Static => self
                .settings
                .catalog
                .select(&self.settings.metrics)
                .context("resolving metric catalog"),
            MetricSource::Discovered => {
                let discovered: MetricCatalog = self
                    .api
                    .get_metric_metadata()
                    .await
                    .context("retrieving metric metadata")?
                    .into_iter()
                    .collect();

                debug!(metrics = discovered.len(), "discovered metric catalog");

                if self.settings.metrics.is_empty() {
                    Ok(discovered)
                } else {
                    discovered
                        .select(&self.settings.metrics)
                        .context("resolving metric catalog")
                }
            }
        }
    }

    /// Looks up the conductor version once per run.
    async fn alarm_protocol(&self) -> AlarmProtocol {
        if !self.settings.alarm_history {
            return AlarmProtocol::Audit;
        }

        match self.api.get_system_info().await {
            Ok(info) => {
                let protocol = AlarmProtocol::for_version(&info.version);
                info!(
                    version = %info.version,
                    protocol = protocol.as_str(),
                    "selected alarm history protocol",
                );
                protocol
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch conductor version, using audit endpoint");
                AlarmProtocol::Audit
            }
        }
    }
}

/// Fetches every target of a router sequentially, then its alarm history.
async fn process_router<A, S>(ctx: &RunContext<A, S>, router: &Router) -> RouterReport
where
    A: ManagementApi,
    S: TimeSeriesSink,
{
    let mut report = RouterReport::default();

    let targets = match ctx.settings.source {
        MetricSource::Static => {
            plan_router(router, &ctx.authority, &ctx.service_groups, &ctx.catalog)
        }
        MetricSource::Discovered => discover_targets(ctx, router, &mut report).await,
    };

    debug!(router = %router.name, targets = targets.len(), "planned fetch targets");

    for target in &targets {
        let started = Instant::now();
        let result = export_target(ctx, &router.name, target).await;
        ctx.metrics
            .record_fetch("metric", result.is_ok(), started.elapsed());

        match result {
            Ok((points, window)) => {
                info!(
                    router = %router.name,
                    series = target.series(),
                    tags = %target.filter,
                    seconds = window.width().num_seconds(),
                    points,
                    "exported metric",
                );
                ctx.metrics.points_written.inc_by(points as u64);
                report.succeeded += 1;
                report.points += points;
            }
            Err(e) => {
                warn!(
                    router = %router.name,
                    series = target.series(),
                    tags = %target.filter,
                    error = %format!("{e:#}"),
                    "metric export failed",
                );
                report.failed += 1;
            }
        }
    }

    if ctx.settings.alarm_history {
        let started = Instant::now();
        let result = AlarmSynchronizer::new(
            ctx.api.as_ref(),
            ctx.sink.as_ref(),
            ctx.protocol,
            ctx.settings.alarm_lookback,
        )
        .with_metrics(Arc::clone(&ctx.metrics))
        .sync_router(router)
        .await;
        ctx.metrics
            .record_fetch("alarm", result.is_ok(), started.elapsed());

        match result {
            Ok(written) => {
                ctx.metrics.alarms_written.inc_by(written as u64);
                report.succeeded += 1;
                report.alarms += written;
            }
            Err(e) => {
                warn!(
                    router = %router.name,
                    error = %format!("{e:#}"),
                    "error retrieving alarm history",
                );
                report.failed += 1;
            }
        }
    }

    report
}

/// Builds targets from the permutations the router reports for each metric.
async fn discover_targets<A, S>(
    ctx: &RunContext<A, S>,
    router: &Router,
    report: &mut RouterReport,
) -> Vec<FetchTarget>
where
    A: ManagementApi,
    S: TimeSeriesSink,
{
    let mut targets = Vec::new();

    for metric in ctx.catalog.iter() {
        match ctx.api.get_metric_permutations(&router.name, metric).await {
            Ok(permutations) => {
                targets.extend(plan_permutations(&router.name, metric, &permutations));
            }
            Err(e) => {
                warn!(
                    router = %router.name,
                    series = %metric.id,
                    error = %format!("{e:#}"),
                    "permutation discovery failed, skipping metric",
                );
                report.failed += 1;
            }
        }
    }

    targets
}

/// Resolves the window of one target, fetches it and writes the points.
async fn export_target<A, S>(
    ctx: &RunContext<A, S>,
    router: &str,
    target: &FetchTarget,
) -> Result<(usize, Window)>
where
    A: ManagementApi,
    S: TimeSeriesSink,
{
    let window = CheckpointResolver::new(ctx.sink.as_ref(), METRIC_RESOLUTION)
        .with_metrics(Arc::clone(&ctx.metrics))
        .resolve_window(target.series(), &target.tags, ctx.settings.metric_lookback)
        .await;

    let request = MetricRequest::sum(
        &target.metric,
        window.to_analytic_window(),
        target.filter.clone(),
    );

    let points = ctx
        .api
        .get_metric(router, &request)
        .await
        .context("fetching metric")?;

    let written = ctx
        .sink
        .write_points(target.series(), &target.tags, &points)
        .await
        .context("writing to InfluxDB")?;

    Ok((written, window))
}
