use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::line::{encode_points, encode_records, Precision};
use super::{Record, TimeSeriesSink};
use crate::api::Point;
use crate::config::InfluxConfig;
use crate::tags::TagSet;

/// Precision used for continuous metric rows.
pub const METRIC_PRECISION: Precision = Precision::Milliseconds;

/// Precision used for discrete records. Synthetic nanosecond offsets must survive.
pub const RECORD_PRECISION: Precision = Precision::Nanoseconds;

/// InfluxDB 1.x HTTP sink.
pub struct InfluxSink {
    http: reqwest::Client,
    base_url: String,
    database: String,
    username: String,
    password: String,
    compression: String,
}

impl InfluxSink {
    /// Creates a new sink with the given configuration.
    pub fn new(cfg: &InfluxConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(if cfg.timeout.is_zero() {
                Duration::from_secs(30)
            } else {
                cfg.timeout
            })
            .build()
            .context("building InfluxDB HTTP client")?;

        Ok(Self {
            http,
            base_url: cfg.address.trim_end_matches('/').to_string(),
            database: cfg.database.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            compression: cfg.compression.clone(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.username.is_empty() {
            request
        } else {
            request.basic_auth(&self.username, Some(&self.password))
        }
    }

    async fn write_body(&self, body: String, precision: Precision, lines: usize) -> Result<()> {
        let raw_len = body.len();
        let compressed =
            compress(body.as_bytes(), &self.compression).context("compressing line protocol")?;

        let mut request = self
            .http
            .post(format!("{}/write", self.base_url))
            .query(&[("db", self.database.as_str()), ("precision", precision.as_str())])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(compressed);

        if let Some(encoding) = content_encoding(&self.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        let resp = self
            .authorize(request)
            .send()
            .await
            .context("sending InfluxDB write request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("InfluxDB write unexpected status {status}: {}", body.trim());
        }

        debug!(lines, bytes = raw_len, "wrote batch to InfluxDB");

        Ok(())
    }
}

impl TimeSeriesSink for InfluxSink {
    async fn ping(&self) -> Result<()> {
        let request = self.http.get(format!("{}/ping", self.base_url));
        let resp = self
            .authorize(request)
            .send()
            .await
            .with_context(|| format!("pinging InfluxDB at {}", self.base_url))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("InfluxDB ping unexpected status: {status}");
        }

        Ok(())
    }

    async fn last_recorded_time(
        &self,
        series: &str,
        tags: &TagSet,
    ) -> Result<Option<DateTime<Utc>>> {
        let query = last_recorded_query(series, tags);
        debug!(%query, "querying last recorded time");

        let request = self.http.get(format!("{}/query", self.base_url)).query(&[
            ("db", self.database.as_str()),
            ("q", query.as_str()),
            ("epoch", "ns"),
        ]);

        let resp = self
            .authorize(request)
            .send()
            .await
            .context("sending InfluxDB query")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("InfluxDB query unexpected status {status}: {}", body.trim());
        }

        let body: QueryResponse = resp.json().await.context("decoding InfluxDB query response")?;
        parse_last_time(body)
    }

    async fn write_points(&self, series: &str, tags: &TagSet, points: &[Point]) -> Result<usize> {
        let mut body = String::with_capacity(points.len() * 96);
        let lines = encode_points(&mut body, series, tags, points, METRIC_PRECISION);
        if lines == 0 {
            return Ok(0);
        }

        self.write_body(body, METRIC_PRECISION, lines).await?;
        Ok(lines)
    }

    async fn write_records(&self, series: &str, records: &[Record]) -> Result<usize> {
        let mut body = String::with_capacity(records.len() * 256);
        let lines = encode_records(&mut body, series, records, RECORD_PRECISION);
        if lines == 0 {
            return Ok(0);
        }

        self.write_body(body, RECORD_PRECISION, lines).await?;
        Ok(lines)
    }
}

// --- Query construction and parsing ---

/// `SELECT * FROM "<series>" WHERE "k" = 'v' AND ... ORDER BY time DESC LIMIT 1`
fn last_recorded_query(series: &str, tags: &TagSet) -> String {
    let mut query = String::with_capacity(64 + tags.len() * 32);
    query.push_str("SELECT * FROM ");
    push_identifier(&mut query, series);

    for (idx, (k, v)) in tags.iter().enumerate() {
        query.push_str(if idx == 0 { " WHERE " } else { " AND " });
        push_identifier(&mut query, k);
        query.push_str(" = ");
        push_literal(&mut query, v);
    }

    query.push_str(" ORDER BY time DESC LIMIT 1");
    query
}

fn push_identifier(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

fn push_literal(out: &mut String, s: &str) {
    out.push('\'');
    for c in s.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<QueryResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    series: Vec<QuerySeries>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuerySeries {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

fn parse_last_time(body: QueryResponse) -> Result<Option<DateTime<Utc>>> {
    if let Some(err) = body.error {
        bail!("InfluxDB query failed: {err}");
    }

    let Some(result) = body.results.into_iter().next() else {
        return Ok(None);
    };
    if let Some(err) = result.error {
        bail!("InfluxDB query failed: {err}");
    }

    let Some(series) = result.series.into_iter().next() else {
        return Ok(None);
    };
    let time_idx = series.columns.iter().position(|c| c == "time").unwrap_or(0);
    let Some(row) = series.values.into_iter().next() else {
        return Ok(None);
    };

    match row.get(time_idx).and_then(Value::as_i64) {
        Some(ns) => Ok(Some(Utc.timestamp_nanos(ns))),
        None => bail!("InfluxDB query returned a non-integer time column"),
    }
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}
