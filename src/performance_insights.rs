//! Performance-insights payloads and their materialization into samples
//!
//! The payload carries metrics whose names and dimensions are only known at
//! runtime. Each metric entry becomes one gauge sample:
//!
//! - name: `rds_pi_` + metric key with every separator replaced by `_`
//! - labels: `region`, `instance_identifier`, the non-empty extra labels of
//!   the instance and one label per dimension (keys sanitized the same way)
//! - value: the first data point of the entry, older points are ignored
//!
//! ```text
//! db.SQL.Innodb_rows_read.avg {db.sql.tokenized_ids: abc}
//!   → rds_pi_db_SQL_Innodb_rows_read_avg{db_sql_tokenized_ids="abc", region=..., instance_identifier=...}
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::metrics::{Labels, MetricSample, MetricValue, ScrapeBatch};
use crate::provider::{PerformanceInsightsSource, Session};
use crate::scheduler::Scraper;
use crate::sessions::MonitoredInstance;

/// Namespace prefix of every materialized sample
pub const NAMESPACE: &str = "rds_pi_";

type UnknownFields = BTreeMap<String, serde_json::Value>;

/// Metrics of one instance over an aligned time window
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Payload {
    pub aligned_start_time: Option<DateTime<Utc>>,
    pub aligned_end_time: Option<DateTime<Utc>>,
    /// Resource id of the instance
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub metric_list: Vec<MetricEntry>,

    #[serde(flatten)]
    unknown: UnknownFields,
}

/// All data points of one metric for one dimension combination
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricEntry {
    pub key: MetricKey,
    #[serde(default)]
    pub data_points: Vec<DataPoint>,

    #[serde(flatten)]
    unknown: UnknownFields,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricKey {
    pub metric: String,
    #[serde(default)]
    pub dimensions: HashMap<String, String>,

    #[serde(flatten)]
    unknown: UnknownFields,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataPoint {
    pub timestamp: Option<DateTime<Utc>>,
    /// Kept raw. Numbers are accepted when materializing, a missing value
    /// reads as zero.
    #[serde(default)]
    pub value: serde_json::Value,

    #[serde(flatten)]
    unknown: UnknownFields,
}

impl Payload {
    /// Decode a payload. With `strict`, any field not part of the schema is
    /// a decode error.
    pub fn parse(bytes: &[u8], strict: bool) -> Result<Self, MaterializeError> {
        let payload: Payload = serde_json::from_slice(bytes).map_err(MaterializeError::Decode)?;
        if strict {
            payload.check_unknown_fields()?;
        }
        Ok(payload)
    }

    fn check_unknown_fields(&self) -> Result<(), MaterializeError> {
        reject_unknown("payload", &self.unknown)?;
        for entry in &self.metric_list {
            reject_unknown("metric entry", &entry.unknown)?;
            reject_unknown("metric key", &entry.key.unknown)?;
            for point in &entry.data_points {
                reject_unknown("data point", &point.unknown)?;
            }
        }
        Ok(())
    }
}

fn reject_unknown(context: &'static str, unknown: &UnknownFields) -> Result<(), MaterializeError> {
    match unknown.keys().next() {
        Some(field) => Err(MaterializeError::UnknownField {
            context,
            field: field.clone(),
        }),
        None => Ok(()),
    }
}

/// Replace every character that is not valid in a metric or label name.
pub fn sanitize_name(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Like [`sanitize_name`], and prefixes `_` when the result would not start
/// with a letter or underscore.
pub fn sanitize_label_name(key: &str) -> String {
    let name = sanitize_name(key);
    match name.chars().next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => name,
        _ => format!("_{name}"),
    }
}

/// Build one gauge sample per metric entry, in payload order.
///
/// Fails as a whole if any entry has no data points, a non-numeric value or
/// a dimension clashing with a constant label.
pub fn materialize(
    payload: &Payload,
    instance_identifier: &str,
    region: &str,
    extra_labels: &HashMap<String, String>,
) -> Result<Vec<MetricSample>, MaterializeError> {
    let mut const_labels = Labels::from([
        ("region".to_string(), region.to_string()),
        (
            "instance_identifier".to_string(),
            instance_identifier.to_string(),
        ),
    ]);
    for (name, value) in extra_labels {
        if !value.is_empty() {
            const_labels.insert(sanitize_label_name(name), value.clone());
        }
    }

    payload
        .metric_list
        .iter()
        .map(|entry| materialize_entry(entry, &const_labels))
        .collect()
}

fn materialize_entry(entry: &MetricEntry, const_labels: &Labels) -> Result<MetricSample, MaterializeError> {
    let metric = &entry.key.metric;

    let mut labels = const_labels.clone();
    for (key, value) in &entry.key.dimensions {
        let name = sanitize_label_name(key);
        if labels.insert(name.clone(), value.clone()).is_some() {
            return Err(MaterializeError::DuplicateLabel {
                metric: metric.clone(),
                label: name,
            });
        }
    }

    let point = entry
        .data_points
        .first()
        .ok_or_else(|| MaterializeError::NoDataPoints {
            metric: metric.clone(),
        })?;

    // a point without a value counts as zero
    let value = if point.value.is_null() {
        MetricValue::Float(0.0)
    } else {
        MetricValue::from_json(&point.value).ok_or_else(|| MaterializeError::NonNumericValue {
            metric: metric.clone(),
            value: point.value.to_string(),
        })?
    };

    Ok(MetricSample::new(
        format!("{NAMESPACE}{}", sanitize_name(metric)),
        value,
        labels,
        format!("{metric} metric from RDS Performance Insights"),
    ))
}

/// Errors while decoding or materializing a payload
#[derive(Debug)]
pub enum MaterializeError {
    /// Payload is not valid JSON for the schema
    Decode(serde_json::Error),

    /// Strict decoding found a field outside the schema
    UnknownField { context: &'static str, field: String },

    /// A metric entry had no data points
    NoDataPoints { metric: String },

    /// A data point value was not a number
    NonNumericValue { metric: String, value: String },

    /// A dimension produced a label name that is already set
    DuplicateLabel { metric: String, label: String },
}

impl fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaterializeError::Decode(err) => write!(f, "failed to decode payload: {err}"),
            MaterializeError::UnknownField { context, field } => {
                write!(f, "unknown field {field:?} in {context}")
            }
            MaterializeError::NoDataPoints { metric } => {
                write!(f, "metric {metric} has no data points")
            }
            MaterializeError::NonNumericValue { metric, value } => {
                write!(f, "can't make a metric value for {metric} from {value}")
            }
            MaterializeError::DuplicateLabel { metric, label } => {
                write!(f, "metric {metric} has duplicate label {label}")
            }
        }
    }
}

impl std::error::Error for MaterializeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MaterializeError::Decode(err) => Some(err),
            _ => None,
        }
    }
}

/// Scrape function for the performance-insights family
///
/// Fetches every instance's payload concurrently. One failing instance fails
/// the batch, so the cache keeps serving the previous samples.
pub struct PerformanceInsightsScraper {
    source: Arc<dyn PerformanceInsightsSource>,
    strict: bool,
}

impl PerformanceInsightsScraper {
    pub fn new(source: Arc<dyn PerformanceInsightsSource>) -> Self {
        Self {
            source,
            strict: false,
        }
    }

    /// Reject payload fields outside the known schema
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    async fn scrape_instance(
        &self,
        session: &Session,
        instance: &MonitoredInstance,
    ) -> anyhow::Result<Vec<MetricSample>> {
        let bytes = self
            .source
            .fetch(session, instance)
            .await
            .with_context(|| format!("failed to fetch performance insights for {instance}"))?;

        let payload = Payload::parse(&bytes, self.strict)
            .with_context(|| format!("invalid performance insights payload for {instance}"))?;

        if !payload.identifier.is_empty() && payload.identifier != instance.resource_id {
            warn!(
                "payload for {instance} reports identifier {}",
                payload.identifier
            );
        }

        let samples = materialize(&payload, &instance.instance, &instance.region, &instance.labels)
            .with_context(|| format!("failed to materialize metrics for {instance}"))?;
        debug!("{instance}: {} samples", samples.len());
        Ok(samples)
    }
}

#[async_trait]
impl Scraper for PerformanceInsightsScraper {
    #[instrument(skip_all, fields(session = session.id()))]
    async fn scrape(
        &self,
        _cancel: &CancellationToken,
        session: &Session,
        instances: &[MonitoredInstance],
    ) -> anyhow::Result<ScrapeBatch> {
        let results = try_join_all(instances.iter().map(|instance| async move {
            let samples = self.scrape_instance(session, instance).await?;
            Ok::<_, anyhow::Error>((instance.id(), samples))
        }))
        .await?;

        Ok(results.into_iter().collect())
    }
}
