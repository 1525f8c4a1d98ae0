//! Sample types shared by the scrapers, the cache and the exposition path

use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Ordered label set of a sample
pub type Labels = BTreeMap<String, String>;

/// Latest samples of a scrape, keyed by instance
pub type ScrapeBatch = HashMap<InstanceId, Vec<MetricSample>>;

/// Identity of a monitored instance: `region/instance`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(region: &str, instance: &str) -> Self {
        Self(format!("{region}/{instance}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether `name` can be used as a label name: `[a-zA-Z_][a-zA-Z0-9_]*`
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Numeric value as decoded from a provider payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl MetricValue {
    /// Decode a JSON value, accepting only numbers.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let serde_json::Value::Number(number) = value else {
            return None;
        };

        if let Some(int) = number.as_i64() {
            Some(MetricValue::Int(int))
        } else {
            number.as_f64().map(MetricValue::Float)
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            MetricValue::Int(v) => v as f64,
            MetricValue::Float(v) => v,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Float(value)
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Int(value)
    }
}

/// One gauge sample, immutable once built
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    name: String,
    value: MetricValue,
    labels: Labels,
    help: String,
}

impl MetricSample {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<MetricValue>,
        labels: Labels,
        help: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            labels,
            help: help.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> MetricValue {
        self.value
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn help(&self) -> &str {
        &self.help
    }
}
