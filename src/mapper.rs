//! Turns parsed rows into metric samples according to a `MetricDefinition`.

use crate::catalog::MetricDefinition;
use crate::parser::Row;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

static UNSAFE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_]").unwrap());

/// Label value used when a label column is blank.
pub const UNKNOWN_LABEL: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
    Histogram,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramData {
    pub count: u64,
    /// `(upper bound, cumulative count)`, sorted by upper bound.
    pub buckets: Vec<(f64, u64)>,
}

/// One exported series. For histograms `value` is the sum.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub labels: Vec<(String, String)>,
    pub value: f64,
    pub histogram: Option<HistogramData>,
}

/// Destination for samples produced during a scrape.
pub trait SampleSink {
    fn push(&mut self, sample: Sample);
}

impl SampleSink for Vec<Sample> {
    fn push(&mut self, sample: Sample) {
        Vec::push(self, sample);
    }
}

/// Series keys already emitted in the current scrape.
///
/// Later samples with the same name and label values are dropped.
#[derive(Debug, Default)]
pub struct DedupSet {
    seen: HashSet<String>,
}

impl DedupSet {
    /// Returns `false` if the key was already present.
    pub fn insert(&mut self, key: String) -> bool {
        self.seen.insert(key)
    }

    /// Number of distinct series seen.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no series has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Sanitize a column or value into a metric name fragment.
pub fn clean_name(raw: &str) -> String {
    let spaced = raw.trim().replace(' ', "_");
    UNSAFE_NAME_CHARS
        .replace_all(&spaced, "")
        .to_lowercase()
}

/// Join the non-empty parts with `_`.
pub fn fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

/// `" Value mapping: 0 - 'Shutdown', 2 - 'Running'."`
fn mapping_help(map: &BTreeMap<String, String>) -> String {
    let mut entries: Vec<String> = map
        .iter()
        .map(|(src, dst)| format!("{dst} - '{src}', "))
        .collect();
    entries.sort();
    let joined = entries.concat();
    format!(
        " Value mapping: {}.",
        joined.trim_end_matches(|c| c == ',' || c == ' ')
    )
}

#[derive(Debug, Clone)]
pub struct MetricMapper {
    namespace: String,
}

impl MetricMapper {
    /// Mapper prefixing every name with `namespace`.
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
        }
    }

    /// Map a batch of rows, returning the number of samples emitted.
    pub fn map_rows(
        &self,
        rows: &[Row],
        definition: &MetricDefinition,
        seen: &mut DedupSet,
        sink: &mut dyn SampleSink,
    ) -> usize {
        rows.iter()
            .map(|row| self.map_row(row, definition, seen, sink))
            .sum()
    }

    /// Map one row, returning the number of samples emitted.
    pub fn map_row(
        &self,
        row: &Row,
        definition: &MetricDefinition,
        seen: &mut DedupSet,
        sink: &mut dyn SampleSink,
    ) -> usize {
        let appended = match &definition.field_to_append {
            Some(field) => match row.get(field).map(|v| v.trim()) {
                Some(value) if !value.is_empty() => Some(value),
                _ => {
                    tracing::debug!(field = %field, "skipping row with empty field to append");
                    return 0;
                }
            },
            None => None,
        };

        let mut labels = Vec::with_capacity(definition.labels.len());
        let mut label_values = Vec::with_capacity(definition.labels.len());
        for column in &definition.labels {
            let value = match row.get(column) {
                Some(v) if !v.trim().is_empty() => v.clone(),
                _ => UNKNOWN_LABEL.to_string(),
            };
            labels.push((clean_name(column), value.clone()));
            label_values.push(value);
        }
        let label_key = label_values.join(",");

        let mut emitted = 0;
        for (metric, base_help) in &definition.help {
            let mut name = match appended {
                Some(value) => {
                    let cleaned = clean_name(value);
                    if cleaned.is_empty() {
                        tracing::warn!(value, metric = %metric, "field to append cleans to nothing");
                        format!("unknown_{}", clean_name(metric))
                    } else {
                        cleaned
                    }
                }
                None => clean_name(metric),
            };
            if name.is_empty() {
                name = "unknown_metric".to_string();
            }

            let mut help = base_help.clone();
            if let Some(extra) = definition
                .help_field
                .get(metric)
                .and_then(|column| row.get(column))
            {
                help.push(' ');
                help.push_str(extra);
            }

            let mut value = row.get(metric).cloned().unwrap_or_default();
            if value.trim().is_empty() {
                if metric.to_lowercase().contains("time") || help.to_lowercase().contains("time") {
                    tracing::debug!(metric = %metric, "skipping empty time field");
                    continue;
                }
                value = "0".to_string();
            }

            if let Some(map) = definition.value_map.get(metric).filter(|m| !m.is_empty()) {
                let key = clean_name(&value);
                if let Some((_, mapped)) = map.iter().find(|(src, _)| clean_name(src) == key) {
                    value = mapped.clone();
                }
                help.push_str(&mapping_help(map));
            }

            let parsed: f64 = match value.trim().parse() {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(metric = %metric, value = %value, error = %e, "unable to convert value to float");
                    continue;
                }
            };

            let fq = fq_name(&self.namespace, &definition.subsystem, &name);
            if !seen.insert(format!("{fq}{{{label_key}}}")) {
                tracing::debug!(name = %fq, labels = %label_key, "skipping duplicate sample");
                continue;
            }

            let kind = definition.kind_for(metric);
            let histogram = if kind == MetricKind::Histogram {
                match histogram_data(row, definition, metric) {
                    Some(data) => Some(data),
                    None => continue,
                }
            } else {
                None
            };

            sink.push(Sample {
                name: fq,
                help,
                kind,
                labels: labels.clone(),
                value: parsed,
                histogram,
            });
            emitted += 1;
        }
        emitted
    }
}

fn histogram_data(row: &Row, definition: &MetricDefinition, metric: &str) -> Option<HistogramData> {
    let count = match row.get("count").map(|c| c.trim()).filter(|c| !c.is_empty()) {
        Some(raw) => match raw.parse::<u64>() {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(metric, count = raw, error = %e, "unable to convert histogram count");
                return None;
            }
        },
        None => {
            tracing::error!(metric, "missing count field for histogram");
            return None;
        }
    };

    let mut buckets = Vec::new();
    for (field, le) in definition.buckets.get(metric).into_iter().flatten() {
        let upper: f64 = match le.trim().parse() {
            Ok(upper) => upper,
            Err(e) => {
                tracing::error!(metric, bucket = %le, error = %e, "unable to convert bucket limit");
                continue;
            }
        };
        let raw = row.get(field).map(|v| v.trim()).unwrap_or("");
        let raw = if raw.is_empty() { "0" } else { raw };
        match raw.parse::<u64>() {
            Ok(cumulative) => buckets.push((upper, cumulative)),
            Err(e) => {
                tracing::error!(metric, field = %field, value = raw, error = %e, "unable to convert bucket value");
            }
        }
    }
    buckets.sort_by(|a, b| a.0.total_cmp(&b.0));
    Some(HistogramData { count, buckets })
}
