//! Failure handling: stale retention, provider errors, bad payloads
//!
//! A failed scrape must never blank out what the cache already serves, and
//! only credential problems are allowed to abort a pool build.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use rds_exporter::performance_insights::PerformanceInsightsScraper;
use rds_exporter::{Collector, FeatureFamily, Phase, SessionError, SessionPool};

use crate::helpers::*;

async fn two_instance_pool() -> SessionPool {
    SessionPool::build(
        &[
            instance_config("us-east-1", "db-1", ""),
            instance_config("us-east-1", "db-2", ""),
        ],
        reqwest::Client::new(),
        false,
        &StaticDiscovery(vec![]),
        &PagedDescriber::new(&[("db-1", "db-AAA", 10), ("db-2", "db-BBB", 10)]),
    )
    .await
    .unwrap()
}

fn values(samples: &[rds_exporter::MetricSample]) -> Vec<(String, f64)> {
    let mut values: Vec<_> = samples
        .iter()
        .map(|s| {
            (
                s.label("instance_identifier").unwrap_or_default().to_string(),
                s.value().as_f64(),
            )
        })
        .collect();
    values.sort_by(|a, b| a.0.cmp(&b.0));
    values
}

#[tokio::test(start_paused = true)]
async fn test_failed_scrape_keeps_stale_samples() {
    let source = Arc::new(FakePiSource::default());
    source.set_payload("db-AAA", pi_payload("db-AAA", "db.load.avg", 1.0));
    source.set_payload("db-BBB", pi_payload("db-BBB", "db.load.avg", 1.0));

    let collector = Collector::new(
        two_instance_pool().await,
        FeatureFamily::PerformanceInsights,
        Arc::new(PerformanceInsightsScraper::new(source.clone())),
    )
    .await;

    // one instance failing fails the batch of the whole group
    source.fail("db-BBB");
    source.set_payload("db-AAA", pi_payload("db-AAA", "db.load.avg", 2.0));
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(
        values(&collector.snapshot().await),
        vec![("db-1".to_string(), 1.0), ("db-2".to_string(), 1.0)]
    );
    assert_eq!(collector.phases().await, vec![Phase::Running]);

    source.recover("db-BBB");
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(
        values(&collector.snapshot().await),
        vec![("db-1".to_string(), 2.0), ("db-2".to_string(), 1.0)]
    );

    collector.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_string_value_keeps_previous_snapshot() {
    let source = Arc::new(FakePiSource::default());
    source.set_payload("db-AAA", pi_payload("db-AAA", "db.load.avg", 1.0));
    source.set_payload("db-BBB", pi_payload("db-BBB", "db.load.avg", 1.0));

    let collector = Collector::new(
        two_instance_pool().await,
        FeatureFamily::PerformanceInsights,
        Arc::new(PerformanceInsightsScraper::new(source.clone())),
    )
    .await;

    let stringly = br#"{
        "Identifier": "db-AAA",
        "MetricList": [{
            "Key": {"Metric": "db.load.avg"},
            "DataPoints": [{"Timestamp": "2024-01-01T00:00:00Z", "Value": "5.0"}]
        }]
    }"#;
    source.set_payload("db-AAA", stringly.to_vec());
    source.set_payload("db-BBB", pi_payload("db-BBB", "db.load.avg", 2.0));
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(
        values(&collector.snapshot().await),
        vec![("db-1".to_string(), 1.0), ("db-2".to_string(), 1.0)]
    );
    assert_eq!(collector.phases().await, vec![Phase::Running]);

    collector.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_warming_scrape_still_schedules() {
    let source = Arc::new(FakePiSource::default());
    source.set_payload("db-AAA", b"{ not json".to_vec());
    source.set_payload("db-BBB", pi_payload("db-BBB", "db.load.avg", 1.0));

    let collector = Collector::new(
        two_instance_pool().await,
        FeatureFamily::PerformanceInsights,
        Arc::new(PerformanceInsightsScraper::new(source.clone())),
    )
    .await;

    assert!(collector.snapshot().await.is_empty());
    assert_eq!(collector.phases().await, vec![Phase::Running]);

    source.set_payload("db-AAA", pi_payload("db-AAA", "db.load.avg", 3.0));
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(collector.snapshot().await.len(), 2);
    collector.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_strict_mode_rejects_unknown_fields() {
    let source = Arc::new(FakePiSource::default());
    let payload = br#"{
        "Identifier": "db-AAA",
        "MetricList": [{
            "Key": {"Metric": "db.load.avg"},
            "DataPoints": [{"Timestamp": "2024-01-01T00:00:00Z", "Value": 1.0}],
            "Unit": "sessions"
        }]
    }"#;
    source.set_payload("db-AAA", payload.to_vec());

    let pool = SessionPool::build(
        &[instance_config("us-east-1", "db-1", "")],
        reqwest::Client::new(),
        false,
        &StaticDiscovery(vec![]),
        &PagedDescriber::new(&[("db-1", "db-AAA", 10)]),
    )
    .await
    .unwrap();

    let lenient = Collector::new(
        pool.clone(),
        FeatureFamily::PerformanceInsights,
        Arc::new(PerformanceInsightsScraper::new(source.clone())),
    )
    .await;
    assert_eq!(lenient.snapshot().await.len(), 1);

    let strict = Collector::new(
        pool,
        FeatureFamily::PerformanceInsights,
        Arc::new(PerformanceInsightsScraper::new(source).strict(true)),
    )
    .await;
    assert!(strict.snapshot().await.is_empty());

    lenient.shutdown().await;
    strict.shutdown().await;
}

#[tokio::test]
async fn test_half_static_credentials_abort_build() {
    let mut config = instance_config("us-east-1", "db-1", "AKIA");
    config.aws_secret_key.clear();

    let result = SessionPool::build(
        &[config],
        reqwest::Client::new(),
        false,
        &StaticDiscovery(vec![]),
        &PagedDescriber::new(&[("db-1", "db-AAA", 10)]),
    )
    .await;

    assert_matches!(result, Err(SessionError::Credentials { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_unresolvable_instances_leave_nothing_to_schedule() {
    let pool = SessionPool::build(
        &[instance_config("us-east-1", "db-gone", "")],
        reqwest::Client::new(),
        false,
        &StaticDiscovery(vec![]),
        &PagedDescriber::new(&[("db-1", "db-AAA", 10)]),
    )
    .await
    .unwrap();
    assert!(pool.is_empty());

    let source = Arc::new(FakePiSource::default());
    let collector = Collector::new(
        pool,
        FeatureFamily::PerformanceInsights,
        Arc::new(PerformanceInsightsScraper::new(source.clone())),
    )
    .await;

    assert!(collector.phases().await.is_empty());
    assert!(collector.snapshot().await.is_empty());
    assert_eq!(source.fetches.load(std::sync::atomic::Ordering::SeqCst), 0);
}
