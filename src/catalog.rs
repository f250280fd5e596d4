//! Metric catalog: the list of commands to run and how to expose their columns.
//!
//! Definitions live in one or more TOML files, each holding `[[metric]]`
//! tables. The loaded catalog is replaced wholesale when the combined
//! SHA-256 of the files changes.

use crate::mapper::MetricKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read metrics file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse metrics file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid metric definition `{command}`: {reason}")]
    Validation { command: String, reason: String },
}

/// One command and the columns exported from its output.
///
/// Keys are snake_case. The PascalCase and lowercase spellings used by older
/// catalogs (`ValueMap`, `valuemap`) are accepted as aliases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricDefinition {
    #[serde(alias = "Command")]
    pub command: String,
    #[serde(alias = "Subsystem")]
    pub subsystem: String,
    /// Column name -> help text. Every key is exported.
    #[serde(alias = "Help")]
    pub help: BTreeMap<String, String>,
    /// Column name -> another column whose value is appended to the help.
    #[serde(alias = "HelpField", alias = "helpfield")]
    pub help_field: BTreeMap<String, String>,
    /// Column name -> `gauge`, `counter` or `histogram`. Gauge when absent.
    #[serde(rename = "type", alias = "Type")]
    pub types: BTreeMap<String, String>,
    /// Histogram column -> (bucket column -> upper bound).
    #[serde(alias = "Buckets")]
    pub buckets: BTreeMap<String, BTreeMap<String, String>>,
    /// Column name -> (raw value -> numeric value).
    #[serde(alias = "ValueMap", alias = "valuemap")]
    pub value_map: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(alias = "Labels")]
    pub labels: Vec<String>,
    #[serde(alias = "FieldToAppend", alias = "fieldtoappend")]
    pub field_to_append: Option<String>,
    #[serde(alias = "IgnoreZeroResult", alias = "ignorezeroresult")]
    pub ignore_zero_result: bool,
    #[serde(alias = "Extended")]
    pub extended: bool,
}

impl MetricDefinition {
    /// Check the fields a scrape needs: command, help, and buckets for every histogram column.
    pub fn validate(&self) -> Result<(), CatalogError> {
        let invalid = |reason: String| CatalogError::Validation {
            command: self.command.clone(),
            reason,
        };
        if self.command.trim().is_empty() {
            return Err(invalid("missing command".to_string()));
        }
        if self.help.is_empty() {
            return Err(invalid("missing help".to_string()));
        }
        for (column, kind) in &self.types {
            if !kind.eq_ignore_ascii_case("histogram") {
                continue;
            }
            if self.buckets.is_empty() {
                return Err(invalid("missing buckets for histogram".to_string()));
            }
            if !self.buckets.contains_key(column) {
                return Err(invalid(format!("missing bucket configuration for column {column}")));
            }
        }
        Ok(())
    }

    /// Metric type of `column`, defaulting to gauge.
    pub fn kind_for(&self, column: &str) -> MetricKind {
        let Some(kind) = self.types.get(column) else {
            return MetricKind::Gauge;
        };
        match kind.to_ascii_lowercase().as_str() {
            "gauge" => MetricKind::Gauge,
            "counter" => MetricKind::Counter,
            "histogram" => MetricKind::Histogram,
            other => {
                tracing::error!(column, kind = other, "unknown metric type, using gauge");
                MetricKind::Gauge
            }
        }
    }
}

/// On-disk layout of a catalog file.
#[derive(Debug, Default, Deserialize)]
pub struct CatalogFile {
    #[serde(default, alias = "Metric")]
    pub metric: Vec<MetricDefinition>,
}

/// Where definitions come from.
pub trait CatalogSource: Send {
    /// Content hash used to detect changes.
    fn fingerprint(&self) -> Result<Vec<u8>, CatalogError>;
    fn load(&self) -> Result<Vec<MetricDefinition>, CatalogError>;
}

/// Definitions read from TOML files, concatenated in order.
#[derive(Debug, Clone)]
pub struct TomlCatalog {
    files: Vec<PathBuf>,
}

impl TomlCatalog {
    /// Source reading `files` in order.
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files }
    }

    fn read(path: &Path) -> Result<String, CatalogError> {
        std::fs::read_to_string(path).map_err(|e| CatalogError::Read {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

impl CatalogSource for TomlCatalog {
    fn fingerprint(&self) -> Result<Vec<u8>, CatalogError> {
        let mut hasher = Sha256::new();
        for path in &self.files {
            let contents = Self::read(path)?;
            hasher.update((contents.len() as u64).to_le_bytes());
            hasher.update(contents.as_bytes());
        }
        Ok(hasher.finalize().to_vec())
    }

    fn load(&self) -> Result<Vec<MetricDefinition>, CatalogError> {
        let mut definitions = Vec::new();
        for path in &self.files {
            let contents = Self::read(path)?;
            let file: CatalogFile = toml::from_str(&contents).map_err(|e| CatalogError::Parse {
                path: path.clone(),
                source: e,
            })?;
            tracing::info!(
                file = %path.display(),
                count = file.metric.len(),
                "loaded metrics file"
            );
            definitions.extend(file.metric);
        }
        Ok(definitions)
    }
}

/// The active definitions plus the fingerprint they were loaded from.
pub struct Catalog {
    source: Box<dyn CatalogSource>,
    definitions: Vec<MetricDefinition>,
    fingerprint: Option<Vec<u8>>,
}

impl Catalog {
    /// Empty catalog; definitions arrive on the first `reload_if_changed`.
    pub fn new(source: Box<dyn CatalogSource>) -> Self {
        Self {
            source,
            definitions: Vec::new(),
            fingerprint: None,
        }
    }

    /// Definitions from the last successful load.
    pub fn definitions(&self) -> &[MetricDefinition] {
        &self.definitions
    }

    /// Whether any load has succeeded yet.
    pub fn is_loaded(&self) -> bool {
        self.fingerprint.is_some()
    }

    /// Reload when the source content changed. Returns whether it did.
    ///
    /// Once a catalog has been loaded, failures are logged and the previous
    /// definitions stay active. Before that they are returned.
    pub fn reload_if_changed(&mut self) -> Result<bool, CatalogError> {
        let fingerprint = match self.source.fingerprint() {
            Ok(fingerprint) => fingerprint,
            Err(e) if self.is_loaded() => {
                tracing::error!(error = %e, "unable to hash metrics files, keeping current catalog");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if self.fingerprint.as_ref() == Some(&fingerprint) {
            tracing::debug!("no changes detected in metrics files");
            return Ok(false);
        }

        match self.source.load() {
            Ok(definitions) => {
                tracing::info!(total = definitions.len(), "metrics catalog loaded");
                self.definitions = definitions;
                self.fingerprint = Some(fingerprint);
                Ok(true)
            }
            Err(e) if self.is_loaded() => {
                tracing::error!(error = %e, "failed to reload metrics, keeping current catalog");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
