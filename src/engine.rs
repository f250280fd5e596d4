//! One scrape cycle: connectivity, pings, catalog reload, then every
//! definition through send → parse → map.

use crate::catalog::{Catalog, CatalogError, MetricDefinition};
use crate::config::ScrapeConfig;
use crate::mapper::{DedupSet, MetricMapper, SampleSink};
use crate::metrics::{ExporterMetrics, MetricsResult};
use crate::parser::{ParseError, TabularParser};
use crate::session::{ProcessSession, SessionError};
use crate::status::ConnectionStatus;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("no metrics found while parsing `{command}`")]
    ZeroResult { command: String },
    #[error("srvrmgr unavailable (status: {status})")]
    Unavailable { status: ConnectionStatus },
}

/// Outcome of one scrape.
#[derive(Debug, Default)]
pub struct ScrapeReport {
    pub samples: usize,
    /// Definitions that failed.
    pub errors: u64,
    pub duration: Duration,
    /// Set when the scrape was aborted before running definitions.
    pub aborted: Option<String>,
}

impl ScrapeReport {
    /// True when nothing aborted and no definition failed.
    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.errors == 0
    }
}

pub struct ScrapeEngine {
    session: ProcessSession,
    config: ScrapeConfig,
    parser: TabularParser,
    mapper: MetricMapper,
    catalog: Catalog,
    metrics: ExporterMetrics,
}

impl ScrapeEngine {
    /// Engine driving `session` with definitions from `catalog`.
    pub fn new(session: ProcessSession, config: ScrapeConfig, catalog: Catalog) -> MetricsResult<Self> {
        let metrics = ExporterMetrics::new(&config.namespace)?;
        Ok(Self {
            parser: TabularParser::new(&config.date_format, config.disable_empty_metrics_override),
            mapper: MetricMapper::new(&config.namespace),
            session,
            config,
            catalog,
            metrics,
        })
    }

    /// The underlying session.
    pub fn session(&self) -> &ProcessSession {
        &self.session
    }

    /// Self metrics, for encoding alongside the samples.
    pub fn metrics(&self) -> &ExporterMetrics {
        &self.metrics
    }

    /// The catalog in use.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Run one scrape, pushing samples into `sink`.
    ///
    /// Failures are logged and reflected in the self metrics; nothing here
    /// is fatal to the caller.
    pub async fn scrape(&mut self, sink: &mut dyn SampleSink) -> ScrapeReport {
        let started = Instant::now();
        tracing::debug!("starting metric scrape");
        self.metrics.scrapes_total.inc();
        self.metrics.gateway_up.set(0.0);
        self.metrics.application_up.set(0.0);

        let mut report = ScrapeReport::default();
        if let Err(e) = self.collect(sink, &mut report).await {
            tracing::warn!(error = %e, "scrape aborted");
            report.aborted = Some(e.to_string());
        }

        report.duration = started.elapsed();
        self.metrics
            .last_scrape_duration
            .set(report.duration.as_secs_f64());
        self.metrics
            .last_scrape_error
            .set(if report.is_success() { 0.0 } else { 1.0 });

        if self.config.reconnect_after_scrape {
            if let Err(e) = self
                .session
                .reconnect_cycle(self.config.reconnect_settle())
                .await
            {
                tracing::error!(error = %e, "reconnect after scrape failed");
            }
        }
        self.metrics.sync_reconnects(self.session.reconnect_stats());

        tracing::info!(
            samples = report.samples,
            errors = report.errors,
            duration_ms = report.duration.as_millis() as u64,
            "scrape finished"
        );
        report
    }

    async fn collect(
        &mut self,
        sink: &mut dyn SampleSink,
        report: &mut ScrapeReport,
    ) -> Result<(), ScrapeError> {
        self.ensure_connected().await?;

        self.ping(&self.config.gateway_ping_command, "gateway").await?;
        self.metrics.gateway_up.set(1.0);
        self.ping(&self.config.application_ping_command, "application")
            .await?;
        self.metrics.application_up.set(1.0);

        if self.catalog.reload_if_changed()? {
            tracing::info!(
                definitions = self.catalog.definitions().len(),
                "metrics catalog changed"
            );
        }

        let Self {
            session,
            config,
            parser,
            mapper,
            catalog,
            metrics,
        } = self;
        let mut seen = DedupSet::default();
        for definition in catalog.definitions() {
            if let Err(e) = definition.validate() {
                tracing::error!(error = %e, "skipping invalid metric definition");
                continue;
            }
            if definition.extended && config.disable_extended_metrics {
                tracing::debug!(command = %definition.command, "skipping extended metric");
                continue;
            }

            let started = Instant::now();
            match scrape_definition(session, config, parser, mapper, definition, &mut seen, sink).await {
                Ok(count) => {
                    report.samples += count;
                    tracing::debug!(
                        subsystem = %definition.subsystem,
                        samples = count,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "scraped metric"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        subsystem = %definition.subsystem,
                        command = %definition.command,
                        error = %e,
                        "error scraping metric"
                    );
                    metrics.scrape_errors_total.inc();
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Bring the session to `Connected` or explain why not.
    async fn ensure_connected(&self) -> Result<(), ScrapeError> {
        let status = self.session.status();
        match status {
            ConnectionStatus::Connected => Ok(()),
            ConnectionStatus::Disconnected | ConnectionStatus::ConnectionError => {
                if !self.session.auto_reconnect() {
                    tracing::warn!(status = %status, "connection issue detected, auto-reconnect disabled");
                    return Err(ScrapeError::Unavailable { status });
                }
                tracing::warn!(status = %status, "connection issue detected, attempting to reconnect");
                if status == ConnectionStatus::ConnectionError {
                    self.session
                        .reconnect_cycle(self.config.reconnect_settle())
                        .await?;
                } else {
                    self.session.connect().await?;
                }
                tracing::info!("reconnected to srvrmgr");
                Ok(())
            }
            ConnectionStatus::Reconnecting => {
                tracing::info!("srvrmgr is reconnecting, waiting for completion");
                for _ in 0..self.config.reconnect_wait_attempts {
                    tokio::time::sleep(self.config.reconnect_wait_interval()).await;
                    match self.session.status() {
                        ConnectionStatus::Connected => return Ok(()),
                        ConnectionStatus::Reconnecting => {}
                        other => {
                            tracing::warn!(status = %other, "reconnection status changed");
                            return Err(ScrapeError::Unavailable { status: other });
                        }
                    }
                }
                tracing::warn!("timed out waiting for reconnection to complete");
                Err(ScrapeError::Unavailable {
                    status: ConnectionStatus::Reconnecting,
                })
            }
            ConnectionStatus::Connecting | ConnectionStatus::Disconnecting => {
                tracing::warn!(status = %status, "unable to scrape while connection is changing");
                Err(ScrapeError::Unavailable { status })
            }
        }
    }

    async fn ping(&self, command: &str, target: &'static str) -> Result<(), ScrapeError> {
        tracing::debug!(target_server = target, "pinging server");
        match self
            .session
            .send_command(command, self.config.ping_timeout())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!(target_server = target, error = %e, "ping failed, dropping session until next scrape");
                self.session.abandon().await;
                Err(e.into())
            }
        }
    }
}

async fn scrape_definition(
    session: &ProcessSession,
    config: &ScrapeConfig,
    parser: &TabularParser,
    mapper: &MetricMapper,
    definition: &MetricDefinition,
    seen: &mut DedupSet,
    sink: &mut dyn SampleSink,
) -> Result<usize, ScrapeError> {
    let lines = session.send(&definition.command).await?;
    let rows = parser.parse(&lines)?;

    let batch_size = config.batch_size.max(1);
    let reclaim = config.reclaim_between_batches && rows.len() > batch_size * 2;
    let mut count = 0;
    for batch in rows.chunks(batch_size) {
        count += mapper.map_rows(batch, definition, seen, &mut *sink);
        if reclaim {
            tokio::task::yield_now().await;
        }
    }

    if count == 0 && !definition.ignore_zero_result {
        return Err(ScrapeError::ZeroResult {
            command: definition.command.clone(),
        });
    }
    Ok(count)
}
