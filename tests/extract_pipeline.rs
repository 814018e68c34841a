mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use influx_importer::api::{MetricPermutation, Point};
use influx_importer::catalog::{MetricDescriptor, MetricSource};
use influx_importer::extract::Extractor;
use influx_importer::health::RunMetrics;
use influx_importer::tags::TagSet;

use common::{catalog, routers_config, settings, window_seconds, FakeApi, LogCapture, MemorySink};

const SINGLE_NODE: &str = r#"{"authority": {"router": [{"name": "R1", "node": [{"name": "N1"}]}]}}"#;

fn bandwidth_on_node() -> MetricDescriptor {
    MetricDescriptor::new("bandwidth", "Bandwidth.", &["node"])
}

fn metrics() -> Arc<RunMetrics> {
    Arc::new(RunMetrics::new().expect("metrics"))
}

#[tokio::test]
async fn test_bandwidth_on_empty_sink_fetches_full_lookback() {
    let now = Utc::now();
    let api = Arc::new(FakeApi {
        points: vec![
            Point { value: 10.0, time: now - Duration::seconds(120) },
            Point { value: 12.0, time: now - Duration::seconds(60) },
        ],
        ..FakeApi::with_config(SINGLE_NODE)
    });
    let sink = Arc::new(MemorySink::default());

    let extractor = Extractor::new(
        Arc::clone(&api),
        Arc::clone(&sink),
        settings(catalog(vec![bandwidth_on_node()]), &["bandwidth"]),
        metrics(),
    );
    let summary = extractor.run().await.expect("run");

    let calls = api.metric_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].router, "R1");
    assert_eq!(calls[0].request.id, "/stats/bandwidth");
    assert_eq!(calls[0].request.transform, "sum");
    assert_eq!(window_seconds(&calls[0].request), 3600);
    assert_eq!(calls[0].request.window.end, "now");
    assert_eq!(calls[0].request.filters, vec![TagSet::new().with("node", "N1")]);

    let writes = sink.point_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].series, "bandwidth");
    assert_eq!(writes[0].tags, TagSet::new().with("router", "R1").with("node", "N1"));
    assert_eq!(writes[0].points.len(), 2);

    assert_eq!(summary.routers, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.points_written, 2);
}

#[tokio::test]
async fn test_rerun_resumes_after_last_write() {
    let now = Utc::now();
    let last = now - Duration::seconds(30);
    let api = Arc::new(FakeApi {
        points: vec![Point { value: 1.0, time: last }],
        ..FakeApi::with_config(SINGLE_NODE)
    });
    let sink = Arc::new(MemorySink::default());
    let extractor = Extractor::new(
        Arc::clone(&api),
        Arc::clone(&sink),
        settings(catalog(vec![bandwidth_on_node()]), &["bandwidth"]),
        metrics(),
    );

    extractor.run().await.expect("first run");
    extractor.run().await.expect("second run");

    let calls = api.metric_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(window_seconds(&calls[0].request), 3600);

    // The second window starts 1 ms after the point written at `last`.
    let second = window_seconds(&calls[1].request);
    assert!(second < 3600);
    assert!((29..=31).contains(&second), "unexpected window now-{second}");
}

#[tokio::test]
async fn test_stale_checkpoint_is_clamped_to_lookback() {
    let api = Arc::new(FakeApi::with_config(SINGLE_NODE));
    let sink = Arc::new(MemorySink::default());
    sink.seed_point(
        "bandwidth",
        TagSet::new().with("router", "R1").with("node", "N1"),
        Utc::now() - Duration::days(2),
    );

    let extractor = Extractor::new(
        Arc::clone(&api),
        Arc::clone(&sink),
        settings(catalog(vec![bandwidth_on_node()]), &["bandwidth"]),
        metrics(),
    );
    extractor.run().await.expect("run");

    assert_eq!(window_seconds(&api.metric_calls()[0].request), 3600);
}

#[tokio::test]
async fn test_checkpoint_query_failure_defaults_to_lookback() {
    let api = Arc::new(FakeApi::with_config(SINGLE_NODE));
    let sink = Arc::new(MemorySink {
        query_fails: true,
        ..Default::default()
    });
    let run_metrics = metrics();

    let extractor = Extractor::new(
        Arc::clone(&api),
        Arc::clone(&sink),
        settings(catalog(vec![bandwidth_on_node()]), &["bandwidth"]),
        Arc::clone(&run_metrics),
    );
    let summary = extractor.run().await.expect("run");

    assert_eq!(window_seconds(&api.metric_calls()[0].request), 3600);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(run_metrics.checkpoint_defaults(), 1);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let api = Arc::new(FakeApi {
        metric_delay: Some(StdDuration::from_millis(20)),
        ..FakeApi::with_config(&routers_config(8))
    });
    let sink = Arc::new(MemorySink::default());
    let run_metrics = metrics();

    let mut cfg = settings(catalog(vec![bandwidth_on_node()]), &["bandwidth"]);
    cfg.max_concurrent_routers = 2;

    let extractor = Extractor::new(
        Arc::clone(&api),
        Arc::clone(&sink),
        cfg,
        Arc::clone(&run_metrics),
    );
    let summary = extractor.run().await.expect("run");

    assert_eq!(summary.routers, 8);
    assert_eq!(summary.succeeded, 8);
    assert_eq!(api.metric_calls().len(), 8);
    assert!(api.max_in_flight.load(Ordering::SeqCst) <= 2);
    assert!(run_metrics.peak_routers() <= 2);
    assert!(run_metrics.peak_routers() >= 1);
    assert_eq!(run_metrics.active_routers.get(), 0);
}

#[tokio::test]
async fn test_single_router_limit_serializes_routers() {
    let api = Arc::new(FakeApi {
        metric_delay: Some(StdDuration::from_millis(5)),
        ..FakeApi::with_config(&routers_config(4))
    });
    let sink = Arc::new(MemorySink::default());
    let mut cfg = settings(catalog(vec![bandwidth_on_node()]), &["bandwidth"]);
    cfg.max_concurrent_routers = 1;

    let run_metrics = metrics();
    Extractor::new(Arc::clone(&api), sink, cfg, Arc::clone(&run_metrics))
        .run()
        .await
        .expect("run");

    assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(run_metrics.peak_routers(), 1);
}

#[tokio::test]
async fn test_failed_item_is_skipped_and_reported() {
    let config = r#"{"authority": {"router": [
        {"name": "R1", "node": [{"name": "N1"}, {"name": "N2"}]},
        {"name": "R2", "node": [{"name": "N1"}]}
    ]}}"#;
    let mut api = FakeApi::with_config(config);
    api.points = vec![Point { value: 1.0, time: Utc::now() }];
    api.failing_filters.insert("node=N2".to_string());
    let api = Arc::new(api);
    let sink = Arc::new(MemorySink::default());

    let extractor = Extractor::new(
        Arc::clone(&api),
        Arc::clone(&sink),
        settings(catalog(vec![bandwidth_on_node()]), &["bandwidth"]),
        metrics(),
    );
    let summary = extractor.run().await.expect("failed items are not fatal");

    assert_eq!(api.metric_calls().len(), 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failed_routers, vec!["R1".to_string()]);
    assert_eq!(sink.point_writes().len(), 2);
}

#[tokio::test]
async fn test_every_item_logs_one_outcome_line() {
    let config = r#"{"authority": {"router": [
        {"name": "R1", "node": [{"name": "N1"}, {"name": "N2"}]}
    ]}}"#;
    let mut api = FakeApi::with_config(config);
    api.failing_filters.insert("node=N2".to_string());

    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    Extractor::new(
        Arc::new(api),
        Arc::new(MemorySink::default()),
        settings(catalog(vec![bandwidth_on_node()]), &["bandwidth"]),
        metrics(),
    )
    .run()
    .await
    .expect("run");

    assert_eq!(capture.count("exported metric"), 1);
    assert_eq!(capture.count("metric export failed"), 1);

    let failure = capture
        .contents()
        .lines()
        .find(|l| l.contains("metric export failed"))
        .map(str::to_string)
        .expect("failure line");
    assert!(failure.contains("bandwidth"));
    assert!(failure.contains("node=N2"));
}

#[tokio::test]
async fn test_non_applicable_metrics_are_not_fetched() {
    let config = r#"{"authority": {
        "router": [{"name": "R1", "node": [{"name": "N1", "deviceInterface": [{"id": 1}]}]}],
        "service": [{"name": "web"}],
        "tenant": [{"name": "blue"}]
    }}"#;
    let api = Arc::new(FakeApi::with_config(config));
    let sink = Arc::new(MemorySink::default());

    let service_only = MetricDescriptor::new("service-bandwidth", "", &["service"]);
    Extractor::new(
        Arc::clone(&api),
        Arc::clone(&sink),
        settings(catalog(vec![service_only]), &["service-bandwidth"]),
        metrics(),
    )
    .run()
    .await
    .expect("run");

    let calls = api.metric_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].request.filters, vec![TagSet::new().with("service", "web")]);
    for write in sink.point_writes() {
        let keys: Vec<&str> = write.tags.keys().collect();
        assert_eq!(keys, vec!["router", "service"]);
    }
}

#[tokio::test]
async fn test_sink_ping_failure_is_fatal() {
    let api = Arc::new(FakeApi::with_config(SINGLE_NODE));
    let sink = Arc::new(MemorySink {
        ping_fails: true,
        ..Default::default()
    });

    let err = Extractor::new(
        Arc::clone(&api),
        sink,
        settings(catalog(vec![bandwidth_on_node()]), &["bandwidth"]),
        metrics(),
    )
    .run()
    .await
    .unwrap_err();

    assert!(err.to_string().contains("connecting to InfluxDB"));
    assert!(api.metric_calls().is_empty());
}

#[tokio::test]
async fn test_configuration_failure_is_fatal() {
    let api = Arc::new(FakeApi::default());
    let err = Extractor::new(
        api,
        Arc::new(MemorySink::default()),
        settings(catalog(vec![bandwidth_on_node()]), &["bandwidth"]),
        metrics(),
    )
    .run()
    .await
    .unwrap_err();

    assert!(err.to_string().contains("retrieving 128T configuration"));
}

#[tokio::test]
async fn test_unknown_metric_is_fatal() {
    let err = Extractor::new(
        Arc::new(FakeApi::with_config(SINGLE_NODE)),
        Arc::new(MemorySink::default()),
        settings(catalog(vec![bandwidth_on_node()]), &["latency"]),
        metrics(),
    )
    .run()
    .await
    .unwrap_err();

    assert!(format!("{err:#}").contains("latency is not a valid metric"));
}

#[tokio::test]
async fn test_discovered_catalog_uses_permutations() {
    let perm = |pairs: &[(&str, &str)]| MetricPermutation {
        parameters: pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
    };

    let mut api = FakeApi::with_config(&routers_config(2));
    api.metadata = vec![
        MetricDescriptor::new("bandwidth", "", &["service"]),
        MetricDescriptor::new("sessions", "", &["service"]),
    ];
    api.permutations.insert(
        ("R1".to_string(), "bandwidth".to_string()),
        vec![
            perm(&[("router", "R1"), ("service", "web")]),
            perm(&[("router", "R1"), ("service", "mail")]),
        ],
    );
    api.permutations.insert(
        ("R2".to_string(), "bandwidth".to_string()),
        vec![perm(&[("router", "R2"), ("service", "web")])],
    );
    api.permutations
        .insert(("R1".to_string(), "sessions".to_string()), vec![]);
    let api = Arc::new(api);
    let sink = Arc::new(MemorySink::default());

    let mut cfg = settings(catalog(vec![]), &[]);
    cfg.source = MetricSource::Discovered;

    let summary = Extractor::new(Arc::clone(&api), Arc::clone(&sink), cfg, metrics())
        .run()
        .await
        .expect("run");

    // R2 has no permutations for "sessions": that descriptor is skipped there.
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failed_routers, vec!["R2".to_string()]);

    let mut calls: Vec<(String, String)> = api
        .metric_calls()
        .into_iter()
        .map(|c| (c.router, c.request.filters[0].to_string()))
        .collect();
    calls.sort();
    assert_eq!(
        calls,
        vec![
            ("R1".to_string(), "service=mail".to_string()),
            ("R1".to_string(), "service=web".to_string()),
            ("R2".to_string(), "service=web".to_string()),
        ]
    );

    for write in sink.point_writes() {
        assert!(write.tags.router().is_some());
        assert!(write.tags.contains_key("service"));
    }
}

#[tokio::test]
async fn test_discovered_selection_must_exist() {
    let mut api = FakeApi::with_config(SINGLE_NODE);
    api.metadata = vec![MetricDescriptor::new("bandwidth", "", &["node"])];

    let mut cfg = settings(catalog(vec![]), &["sessions"]);
    cfg.source = MetricSource::Discovered;

    let err = Extractor::new(Arc::new(api), Arc::new(MemorySink::default()), cfg, metrics())
        .run()
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("sessions is not a valid metric"));
}

#[tokio::test]
async fn test_system_info_is_not_fetched_without_alarm_history() {
    let api = Arc::new(FakeApi::with_config(SINGLE_NODE));
    Extractor::new(
        Arc::clone(&api),
        Arc::new(MemorySink::default()),
        settings(catalog(vec![bandwidth_on_node()]), &["bandwidth"]),
        metrics(),
    )
    .run()
    .await
    .expect("run");

    assert_eq!(api.system_calls.load(Ordering::SeqCst), 0);
    assert!(api.audit_calls.lock().is_empty());
}
