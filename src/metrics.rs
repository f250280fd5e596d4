//! Prometheus exposition for scraped samples and the exporter's own health.
//!
//! | Metric | Type |
//! |--------|------|
//! | `<ns>_exporter_last_scrape_duration_seconds` | Gauge |
//! | `<ns>_exporter_scrapes_total` | Counter |
//! | `<ns>_exporter_scrape_errors_total` | Counter |
//! | `<ns>_exporter_last_scrape_error` | Gauge |
//! | `<ns>_gateway_server_up` | Gauge |
//! | `<ns>_application_server_up` | Gauge |
//! | `<ns>_exporter_reconnects_total` | Counter |
//! | `<ns>_exporter_reconnect_errors_total` | Counter |
//! | `<ns>_exporter_last_reconnect_duration_seconds` | Gauge |

use crate::mapper::{MetricKind, Sample};
use crate::watchdog::ReconnectSnapshot;
use prometheus::proto::{self, MetricFamily, MetricType};
use prometheus::{Encoder, Gauge, IntCounter, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Self-observability metrics, registered in a private registry.
#[derive(Clone)]
pub struct ExporterMetrics {
    registry: Registry,
    pub last_scrape_duration: Gauge,
    pub scrapes_total: IntCounter,
    pub scrape_errors_total: IntCounter,
    pub last_scrape_error: Gauge,
    pub gateway_up: Gauge,
    pub application_up: Gauge,
    reconnects_total: IntCounter,
    reconnect_errors_total: IntCounter,
    last_reconnect_duration: Gauge,
}

impl ExporterMetrics {
    /// Register the exporter metrics under `namespace`.
    pub fn new(namespace: &str) -> MetricsResult<Self> {
        let registry = Registry::new();
        let exporter = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(namespace)
                .subsystem("exporter")
        };

        let last_scrape_duration = Gauge::with_opts(exporter(
            "last_scrape_duration_seconds",
            "Duration of the last scrape of metrics from Siebel.",
        ))?;
        registry.register(Box::new(last_scrape_duration.clone()))?;

        let scrapes_total = IntCounter::with_opts(exporter(
            "scrapes_total",
            "Total number of times Siebel was scraped for metrics.",
        ))?;
        registry.register(Box::new(scrapes_total.clone()))?;

        let scrape_errors_total = IntCounter::with_opts(exporter(
            "scrape_errors_total",
            "Total number of times an error occurred scraping Siebel.",
        ))?;
        registry.register(Box::new(scrape_errors_total.clone()))?;

        let last_scrape_error = Gauge::with_opts(exporter(
            "last_scrape_error",
            "Whether the last scrape of metrics from Siebel resulted in an error (1 for error, 0 for success).",
        ))?;
        registry.register(Box::new(last_scrape_error.clone()))?;

        let gateway_up = Gauge::with_opts(
            Opts::new(
                "gateway_server_up",
                "Whether the Siebel Gateway Server is up (1 for up, 0 for down).",
            )
            .namespace(namespace),
        )?;
        registry.register(Box::new(gateway_up.clone()))?;

        let application_up = Gauge::with_opts(
            Opts::new(
                "application_server_up",
                "Whether the Siebel Application Server is up (1 for up, 0 for down).",
            )
            .namespace(namespace),
        )?;
        registry.register(Box::new(application_up.clone()))?;

        let reconnects_total = IntCounter::with_opts(exporter(
            "reconnects_total",
            "Total number of successful srvrmgr reconnections.",
        ))?;
        registry.register(Box::new(reconnects_total.clone()))?;

        let reconnect_errors_total = IntCounter::with_opts(exporter(
            "reconnect_errors_total",
            "Total number of failed srvrmgr reconnection attempts.",
        ))?;
        registry.register(Box::new(reconnect_errors_total.clone()))?;

        let last_reconnect_duration = Gauge::with_opts(exporter(
            "last_reconnect_duration_seconds",
            "Duration of the last successful srvrmgr reconnection.",
        ))?;
        registry.register(Box::new(last_reconnect_duration.clone()))?;

        Ok(Self {
            registry,
            last_scrape_duration,
            scrapes_total,
            scrape_errors_total,
            last_scrape_error,
            gateway_up,
            application_up,
            reconnects_total,
            reconnect_errors_total,
            last_reconnect_duration,
        })
    }

    /// Bring the reconnect series up to date with the session's counters.
    pub fn sync_reconnects(&self, snapshot: ReconnectSnapshot) {
        let reconnects = snapshot.reconnects.saturating_sub(self.reconnects_total.get());
        self.reconnects_total.inc_by(reconnects);
        let errors = snapshot.errors.saturating_sub(self.reconnect_errors_total.get());
        self.reconnect_errors_total.inc_by(errors);
        self.last_reconnect_duration
            .set(snapshot.last_duration.as_secs_f64());
    }

    /// Text exposition of `samples` followed by the exporter's own metrics.
    pub fn encode_text(&self, samples: &[Sample]) -> MetricsResult<String> {
        let mut families = sample_families(samples);
        families.extend(self.registry.gather());

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Group samples into families by name, in first-seen order.
///
/// The first sample of a name fixes its help text and type; later samples of
/// a different type are dropped.
pub fn sample_families(samples: &[Sample]) -> Vec<MetricFamily> {
    let mut families: Vec<MetricFamily> = Vec::new();
    let mut kinds: Vec<MetricKind> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for sample in samples {
        let slot = match index.get(sample.name.as_str()) {
            Some(&slot) => {
                if kinds[slot] != sample.kind {
                    tracing::warn!(name = %sample.name, "conflicting metric types, dropping sample");
                    continue;
                }
                slot
            }
            None => {
                let mut family = MetricFamily::default();
                family.set_name(sample.name.clone());
                family.set_help(sample.help.clone());
                family.set_field_type(metric_type(sample.kind));
                families.push(family);
                kinds.push(sample.kind);
                index.insert(sample.name.as_str(), families.len() - 1);
                families.len() - 1
            }
        };
        families[slot].mut_metric().push(sample_metric(sample));
    }
    families
}

fn metric_type(kind: MetricKind) -> MetricType {
    match kind {
        MetricKind::Gauge => MetricType::GAUGE,
        MetricKind::Counter => MetricType::COUNTER,
        MetricKind::Histogram => MetricType::HISTOGRAM,
    }
}

fn sample_metric(sample: &Sample) -> proto::Metric {
    let mut metric = proto::Metric::default();
    for (name, value) in &sample.labels {
        let mut pair = proto::LabelPair::default();
        pair.set_name(name.clone());
        pair.set_value(value.clone());
        metric.mut_label().push(pair);
    }

    match sample.kind {
        MetricKind::Gauge => {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(sample.value);
            metric.set_gauge(gauge);
        }
        MetricKind::Counter => {
            let mut counter = proto::Counter::default();
            counter.set_value(sample.value);
            metric.set_counter(counter);
        }
        MetricKind::Histogram => {
            let mut histogram = proto::Histogram::default();
            histogram.set_sample_sum(sample.value);
            if let Some(data) = &sample.histogram {
                histogram.set_sample_count(data.count);
                // The encoder emits the +Inf bucket from the sample count
                for &(upper, cumulative) in data.buckets.iter().filter(|(upper, _)| upper.is_finite()) {
                    let mut bucket = proto::Bucket::default();
                    bucket.set_upper_bound(upper);
                    bucket.set_cumulative_count(cumulative);
                    histogram.mut_bucket().push(bucket);
                }
            }
            metric.set_histogram(histogram);
        }
    }
    metric
}
