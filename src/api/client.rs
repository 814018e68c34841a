use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::events::{AuditEvent, LegacyAlarm};
use super::topology::Configuration;
use super::{ManagementApi, MetricPermutation, MetricRequest, Point, SystemInfo};
use crate::catalog::MetricDescriptor;
use crate::config::TargetConfig;

/// Callback type for recording API request metrics.
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// HTTP client for the 128T conductor REST API.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    token: String,
    metrics: Option<MetricsCallback>,
}

impl Client {
    /// Create a new conductor client.
    pub fn new(cfg: &TargetConfig) -> Result<Self> {
        let http = build_http_client(cfg.timeout, cfg.accept_invalid_certs)?;

        Ok(Self {
            http,
            base_url: cfg.url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    /// The callback receives (endpoint_name, status, duration).
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    /// Perform an authenticated JSON request and deserialize the response.
    async fn request_json<B, T>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let start = Instant::now();
        let endpoint = endpoint_from_path(path);
        let url = format!("{}{}", self.base_url, path);

        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .query(query);

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.record_request(endpoint, "error", start.elapsed());
                return Err(e).with_context(|| format!("requesting {path}"));
            }
        };

        let status_code = response.status();

        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request(endpoint, "error", start.elapsed());
            bail!("unexpected status {} from {}: {}", status_code, path, body);
        }

        let result = response.json::<T>().await;
        match result {
            Ok(value) => {
                self.record_request(endpoint, "success", start.elapsed());
                Ok(value)
            }
            Err(e) => {
                self.record_request(endpoint, "error", start.elapsed());
                Err(e).with_context(|| format!("decoding response from {path}"))
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        self.request_json::<(), T>(Method::GET, path, query, None)
            .await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.request_json(Method::POST, path, &[], Some(body)).await
    }
}

fn build_http_client(timeout: Duration, accept_invalid_certs: bool) -> Result<reqwest::Client> {
    let timeout = if timeout.is_zero() {
        Duration::from_secs(30)
    } else {
        timeout
    };

    reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .context("building HTTP client")
}

/// Extract a short endpoint name from an API path.
fn endpoint_from_path(path: &str) -> &'static str {
    match path {
        "/api/v1/config/getJSON" => "configuration",
        "/api/v1/system" => "system",
        "/api/v1/metrics/metadata" => "metric_metadata",
        "/api/v1/audit" => "audit",
        "/api/v1/audit/alarms" => "legacy_alarms",
        "/api/v1/login" => "login",
        p if p.starts_with("/api/v1/router/") && p.ends_with("/metrics/permutations") => {
            "metric_permutations"
        }
        p if p.starts_with("/api/v1/router/") && p.ends_with("/metrics") => "metrics",
        _ => "other",
    }
}

/// Builds `/api/v1/router/{router}/{tail..}` with every segment percent-encoded.
fn router_path(router: &str, tail: &[&str]) -> Result<String> {
    let mut url = Url::parse("http://conductor/api/v1/router").context("parsing router path")?;
    url.path_segments_mut()
        .map_err(|()| anyhow!("router path cannot be a base"))?
        .push(router)
        .extend(tail);
    Ok(url.path().to_string())
}

/// Formats an instant the way the audit endpoints expect it.
fn format_instant(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Serialize)]
struct PermutationRequest<'a> {
    id: String,
    keys: Vec<&'a str>,
}

impl ManagementApi for Client {
    async fn get_configuration(&self) -> Result<Configuration> {
        debug!("fetching running configuration");

        self.get_json("/api/v1/config/getJSON", &[("source", "running")])
            .await
            .context("fetching running configuration")
    }

    async fn get_system_info(&self) -> Result<SystemInfo> {
        debug!("fetching system information");

        self.get_json("/api/v1/system", &[])
            .await
            .context("fetching system information")
    }

    async fn get_metric_metadata(&self) -> Result<Vec<MetricDescriptor>> {
        debug!("fetching metric metadata");

        self.get_json("/api/v1/metrics/metadata", &[])
            .await
            .context("fetching metric metadata")
    }

    async fn get_metric_permutations(
        &self,
        router: &str,
        metric: &MetricDescriptor,
    ) -> Result<Vec<MetricPermutation>> {
        let path = router_path(router, &["metrics", "permutations"])?;
        let body = PermutationRequest {
            id: metric.stat_path(),
            keys: metric.applicability_keys.iter().map(String::as_str).collect(),
        };

        self.post_json(&path, &body)
            .await
            .with_context(|| format!("fetching permutations of {} on {router}", metric.id))
    }

    async fn get_metric(&self, router: &str, request: &MetricRequest) -> Result<Vec<Point>> {
        let path = router_path(router, &["metrics"])?;
        self.post_json(&path, request).await
    }

    async fn get_audit_events(
        &self,
        router: &str,
        categories: &[&str],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditEvent>> {
        let start = format_instant(start);
        let end = format_instant(end);
        let mut query = vec![
            ("router", router),
            ("start", start.as_str()),
            ("end", end.as_str()),
        ];
        query.extend(categories.iter().map(|c| ("filter", *c)));

        self.get_json("/api/v1/audit", &query)
            .await
            .with_context(|| format!("fetching audit events for {router}"))
    }

    async fn get_legacy_alarm_history(
        &self,
        router: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditEvent>> {
        let start = format_instant(start);
        let end = format_instant(end);
        let query = [("router", router), ("start", start.as_str()), ("end", end.as_str())];

        let alarms: Vec<LegacyAlarm> = self
            .get_json("/api/v1/audit/alarms", &query)
            .await
            .with_context(|| format!("fetching legacy alarm history for {router}"))?;

        Ok(alarms.into_iter().map(|a| a.into_event(router)).collect())
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: Option<String>,
}

/// Exchanges credentials for a JWT via the login endpoint.
pub async fn login(
    base_url: &str,
    username: &str,
    password: &str,
    accept_invalid_certs: bool,
) -> Result<String> {
    let http = build_http_client(Duration::from_secs(30), accept_invalid_certs)?;
    let url = format!("{}/api/v1/login", base_url.trim_end_matches('/'));

    let response = http
        .post(&url)
        .json(&LoginRequest { username, password })
        .send()
        .await
        .context("requesting login token")?;

    let status_code = response.status();
    if !status_code.is_success() {
        bail!("unexpected status {} from login", status_code);
    }

    let body: LoginResponse = response
        .json()
        .await
        .context("decoding login response")?;

    match body.token {
        Some(token) if !token.is_empty() => Ok(token),
        _ => bail!("request successful but token was empty"),
    }
}
