//! Prometheus text rendering of cached samples
//!
//! Samples are grouped into one gauge family per metric name. Families are
//! emitted in name order, the help text of a family is taken from its first
//! sample.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::string::FromUtf8Error;

use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::MetricSample;

#[derive(Debug)]
pub enum ExpositionError {
    Encode(prometheus::Error),
    Utf8(FromUtf8Error),
}

impl fmt::Display for ExpositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpositionError::Encode(e) => write!(f, "failed to encode metrics: {e}"),
            ExpositionError::Utf8(e) => write!(f, "encoded metrics are not utf-8: {e}"),
        }
    }
}

impl Error for ExpositionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExpositionError::Encode(e) => Some(e),
            ExpositionError::Utf8(e) => Some(e),
        }
    }
}

impl From<prometheus::Error> for ExpositionError {
    fn from(e: prometheus::Error) -> Self {
        ExpositionError::Encode(e)
    }
}

impl From<FromUtf8Error> for ExpositionError {
    fn from(e: FromUtf8Error) -> Self {
        ExpositionError::Utf8(e)
    }
}

/// Group samples into gauge families.
pub fn families(samples: &[MetricSample]) -> Vec<MetricFamily> {
    let mut grouped: BTreeMap<&str, MetricFamily> = BTreeMap::new();

    for sample in samples {
        let family = grouped.entry(sample.name()).or_insert_with(|| {
            let mut family = MetricFamily::default();
            family.set_name(sample.name().to_string());
            family.set_help(sample.help().to_string());
            family.set_field_type(MetricType::GAUGE);
            family
        });
        family.mut_metric().push(gauge(sample));
    }

    grouped.into_values().collect()
}

fn gauge(sample: &MetricSample) -> Metric {
    let labels: Vec<LabelPair> = sample
        .labels()
        .iter()
        .map(|(name, value)| {
            let mut pair = LabelPair::default();
            pair.set_name(name.clone());
            pair.set_value(value.clone());
            pair
        })
        .collect();

    let mut gauge = Gauge::default();
    gauge.set_value(sample.value().as_f64());

    let mut metric = Metric::default();
    metric.set_label(labels.into());
    metric.set_gauge(gauge);
    metric
}

/// Render samples in the Prometheus text format.
pub fn render(samples: &[MetricSample]) -> Result<String, ExpositionError> {
    let mut buffer = vec![];
    TextEncoder::new().encode(&families(samples), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(feature = "api")]
mod api {
    use axum::Router;
    use axum::extract::State;
    use axum::http::{StatusCode, header};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use tracing::{error, instrument};

    use super::{ExpositionError, render};
    use crate::collector::Collector;

    impl IntoResponse for ExpositionError {
        fn into_response(self) -> Response {
            error!("{self}");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }

    /// Mount one endpoint per collector at its family's default path.
    pub fn router(collectors: Vec<Collector>) -> Router {
        collectors
            .into_iter()
            .fold(Router::new(), |router, collector| {
                let path = collector.family().default_path();
                router.route(path, get(serve_family).with_state(collector))
            })
    }

    #[instrument(skip_all)]
    async fn serve_family(
        State(collector): State<Collector>,
    ) -> Result<impl IntoResponse, ExpositionError> {
        let body = render(&collector.snapshot().await)?;
        Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
    }
}

#[cfg(feature = "api")]
pub use api::router;
