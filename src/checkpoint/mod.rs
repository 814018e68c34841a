use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::api::AnalyticWindow;
use crate::health::RunMetrics;
use crate::sink::TimeSeriesSink;
use crate::tags::TagSet;

/// Smallest step past a checkpoint, matching the write precision of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Millisecond,
    Second,
}

impl Resolution {
    pub fn step(self) -> Duration {
        match self {
            Resolution::Millisecond => Duration::milliseconds(1),
            Resolution::Second => Duration::seconds(1),
        }
    }
}

/// Resolution of continuous metric checkpoints.
pub const METRIC_RESOLUTION: Resolution = Resolution::Millisecond;

/// Resolution of alarm history checkpoints.
pub const ALARM_RESOLUTION: Resolution = Resolution::Second;

/// Query window with `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn width(&self) -> Duration {
        self.end - self.start
    }

    /// Renders as `now-N`/`now`, N being the width rounded up to whole
    /// seconds so the rendered start never falls after `start`.
    pub fn to_analytic_window(&self) -> AnalyticWindow {
        let ms = self.width().num_milliseconds().max(0);
        AnalyticWindow {
            start: format!("now-{}", (ms + 999) / 1000),
            end: "now".to_string(),
        }
    }
}

/// Computes the lower bound of the undelivered window.
///
/// `max(last + step, now - lookback)`, never later than `now`.
pub fn lower_bound(
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lookback: Duration,
    step: Duration,
) -> DateTime<Utc> {
    let floor = now
        .checked_sub_signed(lookback)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let candidate = match last {
        Some(last) => last
            .checked_add_signed(step)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
            .max(floor),
        None => floor,
    };
    candidate.min(now)
}

/// Resolves per-series windows against the sink's last recorded times.
pub struct CheckpointResolver<'a, S> {
    sink: &'a S,
    resolution: Resolution,
    metrics: Option<Arc<RunMetrics>>,
}

impl<'a, S: TimeSeriesSink> CheckpointResolver<'a, S> {
    pub fn new(sink: &'a S, resolution: Resolution) -> Self {
        Self {
            sink,
            resolution,
            metrics: None,
        }
    }

    /// Count defaulted checkpoints on the given run metrics.
    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Window of `series`/`tags` not yet delivered, ending now.
    pub async fn resolve_window(&self, series: &str, tags: &TagSet, lookback: Duration) -> Window {
        self.resolve_window_at(series, tags, lookback, Utc::now())
            .await
    }

    /// Window of `series`/`tags` not yet delivered, ending at `now`.
    pub async fn resolve_window_at(
        &self,
        series: &str,
        tags: &TagSet,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> Window {
        let last = match self.sink.last_recorded_time(series, tags).await {
            Ok(Some(last)) => Some(last),
            Ok(None) => {
                warn!(
                    series,
                    tags = %tags,
                    lookback_secs = lookback.num_seconds(),
                    "no previous record, defaulting to max lookback",
                );
                self.record_default();
                None
            }
            Err(e) => {
                warn!(
                    series,
                    tags = %tags,
                    lookback_secs = lookback.num_seconds(),
                    error = %format!("{e:#}"),
                    "last recorded time query failed, defaulting to max lookback",
                );
                self.record_default();
                None
            }
        };

        let window = Window {
            start: lower_bound(last, now, lookback, self.resolution.step()),
            end: now,
        };

        debug!(
            series,
            tags = %tags,
            width_ms = window.width().num_milliseconds(),
            "resolved window",
        );

        window
    }

    fn record_default(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_checkpoint_default();
        }
    }
}
