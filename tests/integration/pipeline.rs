//! End-to-end runs from a configuration file to rendered exposition text

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use rds_exporter::exposition::render;
use rds_exporter::performance_insights::PerformanceInsightsScraper;
use rds_exporter::{Collector, FeatureFamily, Phase, SessionPool, read_config_file};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test(start_paused = true)]
async fn test_config_file_to_exposition() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        br#"{
            "instances": [
                {"region": "us-east-1", "instance": "db-1", "labels": {"team": "storage", "unset": ""}},
                {"region": "us-east-1", "instance": "db-2", "disable_performance_insights": true}
            ]
        }"#,
    )
    .unwrap();
    let config = read_config_file(file.path()).unwrap();

    let describer = PagedDescriber::new(&[("db-1", "db-AAA", 30), ("db-2", "db-BBB", 5)]);
    let pool = SessionPool::build(
        &config.instances,
        reqwest::Client::new(),
        false,
        &StaticDiscovery(vec![]),
        &describer,
    )
    .await
    .unwrap();
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.groups()[0].instances().len(), 2);

    let source = Arc::new(FakePiSource::default());
    source.set_payload("db-AAA", pi_payload("db-AAA", "db.load.avg", 2.5));
    source.set_payload("db-BBB", pi_payload("db-BBB", "db.load.avg", 7.0));

    let collector = Collector::new(
        pool,
        FeatureFamily::PerformanceInsights,
        Arc::new(PerformanceInsightsScraper::new(source.clone())),
    )
    .await;

    // db-2 opted out of performance insights, db-1 alone sets the interval
    assert_eq!(collector.intervals().await, vec![Duration::from_secs(30)]);
    assert_eq!(collector.phases().await, vec![Phase::Running]);

    let text = render(&collector.snapshot().await).unwrap();
    assert!(text.contains("# TYPE rds_pi_db_load_avg gauge"));
    assert!(text.contains(
        r#"rds_pi_db_load_avg{instance_identifier="db-1",region="us-east-1",team="storage"} 2.5"#
    ));
    assert!(!text.contains("db-2"));
    assert!(!text.contains("unset"));

    collector.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ticks_refresh_the_cache() {
    let configs = vec![instance_config("eu-west-1", "db-1", "")];
    let pool = SessionPool::build(
        &configs,
        reqwest::Client::new(),
        false,
        &StaticDiscovery(vec![]),
        &PagedDescriber::new(&[("db-1", "db-AAA", 10)]),
    )
    .await
    .unwrap();

    let source = Arc::new(FakePiSource::default());
    source.set_payload("db-AAA", pi_payload("db-AAA", "os.cpu", 1.0));

    let collector = Collector::new(
        pool,
        FeatureFamily::PerformanceInsights,
        Arc::new(PerformanceInsightsScraper::new(source.clone())),
    )
    .await;
    assert_eq!(collector.snapshot().await[0].value().as_f64(), 1.0);

    source.set_payload("db-AAA", pi_payload("db-AAA", "os.cpu", 2.0));
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(collector.snapshot().await[0].value().as_f64(), 2.0);
    assert_eq!(source.fetches.load(std::sync::atomic::Ordering::SeqCst), 2);

    collector.shutdown().await;
}

#[tokio::test]
async fn test_payload_fetched_over_http() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/metrics/db-AAA"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(pi_payload("db-AAA", "db.Transactions.xact_commit", 12.0)),
        )
        .expect(1..)
        .mount(&mock_server)
        .await;

    let pool = SessionPool::build(
        &[instance_config("us-east-1", "db-1", "")],
        reqwest::Client::new(),
        false,
        &StaticDiscovery(vec![]),
        &PagedDescriber::new(&[("db-1", "db-AAA", 60)]),
    )
    .await
    .unwrap();

    let source = Arc::new(HttpPiSource {
        base_url: mock_server.uri(),
    });
    let collector = Collector::new(
        pool,
        FeatureFamily::PerformanceInsights,
        Arc::new(PerformanceInsightsScraper::new(source)),
    )
    .await;

    let snapshot = collector.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].name(), "rds_pi_db_Transactions_xact_commit");
    assert_eq!(snapshot[0].label("instance_identifier"), Some("db-1"));

    collector.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_discovered_instances_are_scraped() {
    let pool = SessionPool::build(
        &[instance_config("us-east-1", "", "")],
        reqwest::Client::new(),
        false,
        &StaticDiscovery(vec!["db-1".to_string(), "db-2".to_string()]),
        &PagedDescriber::new(&[("db-1", "db-AAA", 60), ("db-2", "db-BBB", 60)]),
    )
    .await
    .unwrap();

    let source = Arc::new(FakePiSource::default());
    source.set_payload("db-AAA", pi_payload("db-AAA", "db.load.avg", 1.0));
    source.set_payload("db-BBB", pi_payload("db-BBB", "db.load.avg", 2.0));

    let collector = Collector::new(
        pool,
        FeatureFamily::PerformanceInsights,
        Arc::new(PerformanceInsightsScraper::new(source)),
    )
    .await;

    let mut instances: Vec<_> = collector
        .snapshot()
        .await
        .iter()
        .filter_map(|s| s.label("instance_identifier").map(str::to_string))
        .collect();
    instances.sort();
    assert_eq!(instances, vec!["db-1", "db-2"]);

    collector.shutdown().await;
}
