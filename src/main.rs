use clap::Parser;
use srvrmgr_exporter::{
    signals, Catalog, ExporterConfig, ProcessSession, Sample, ScrapeEngine, ScrapeReport,
    SessionSettings, TomlCatalog,
};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

/// Scrape Siebel CRM through a long-lived srvrmgr session and publish the
/// results in Prometheus text format.
#[derive(Parser, Debug)]
#[command(name = "srvrmgr-exporter", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "srvrmgr-exporter.toml")]
    config: PathBuf,

    /// Write exposition to this file instead of stdout (overrides config)
    #[arg(short, long)]
    textfile: Option<PathBuf>,

    /// Seconds between scrapes (overrides config)
    #[arg(short, long)]
    interval: Option<u64>,

    /// Scrape once, publish, and exit
    #[arg(long)]
    once: bool,

    /// Validate config and metric catalog, print resolved settings, don't run
    #[arg(long)]
    check_config: bool,

    /// Debug logging (exchanges, heartbeat probes, reconnect decisions)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // stdout carries the exposition when no textfile is configured.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let mut catalog = Catalog::new(Box::new(TomlCatalog::new(config.catalog.files.clone())));

    if cli.check_config {
        return check_config(&config, &mut catalog);
    }

    let session = ProcessSession::new(SessionSettings::from(&config));
    let mut engine = match ScrapeEngine::new(session, config.scrape.clone(), catalog) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "failed to set up exporter metrics");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        gateway = %config.connection.gateway,
        enterprise = %config.connection.enterprise,
        server = %config.connection.server,
        "srvrmgr-exporter starting"
    );
    if let Err(e) = engine.session().connect().await {
        // The first scrape retries the connection.
        tracing::warn!(error = %e, "initial connection failed");
    }

    let textfile = config.output.textfile.as_deref();
    let code = if cli.once {
        let report = scrape_and_publish(&mut engine, textfile).await;
        if report.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    } else {
        run(&mut engine, &config, textfile).await
    };

    if let Err(e) = engine.session().disconnect().await {
        tracing::warn!(error = %e, "disconnect failed");
    }
    tracing::info!("srvrmgr-exporter stopped");
    code
}

fn load_config(cli: &Cli) -> Result<ExporterConfig, srvrmgr_exporter::config::ConfigError> {
    let mut config = ExporterConfig::load(&cli.config)?;
    if let Some(textfile) = &cli.textfile {
        config.output.textfile = Some(textfile.clone());
    }
    if let Some(interval) = cli.interval {
        config.output.interval_secs = interval;
    }
    config.validate()?;
    Ok(config)
}

fn check_config(config: &ExporterConfig, catalog: &mut Catalog) -> ExitCode {
    println!("{config:#?}");
    if let Err(e) = catalog.reload_if_changed() {
        eprintln!("metric catalog: {e}");
        return ExitCode::FAILURE;
    }

    let mut invalid = 0;
    for definition in catalog.definitions() {
        if let Err(e) = definition.validate() {
            eprintln!("metric catalog: {e}");
            invalid += 1;
        }
    }
    println!(
        "{} metric definitions, {} invalid",
        catalog.definitions().len(),
        invalid
    );
    if invalid == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Scrape on every tick until SIGINT or SIGTERM.
async fn run(engine: &mut ScrapeEngine, config: &ExporterConfig, textfile: Option<&Path>) -> ExitCode {
    let shutdown = signals::shutdown_signal();
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(config.output.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            signal = &mut shutdown => return shutdown_code(signal),
        }
        // A signal mid-scrape abandons the exchange; disconnect follows.
        tokio::select! {
            _ = scrape_and_publish(engine, textfile) => {}
            signal = &mut shutdown => return shutdown_code(signal),
        }
    }
}

fn shutdown_code(signal: std::io::Result<signals::Shutdown>) -> ExitCode {
    match signal {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            ExitCode::FAILURE
        }
    }
}

async fn scrape_and_publish(engine: &mut ScrapeEngine, textfile: Option<&Path>) -> ScrapeReport {
    let mut samples: Vec<Sample> = Vec::new();
    let report = engine.scrape(&mut samples).await;

    match engine.metrics().encode_text(&samples) {
        Ok(text) => {
            let written = match textfile {
                Some(path) => write_textfile(path, &text),
                None => write_stdout(&text),
            };
            if let Err(e) = written {
                tracing::error!(error = %e, "failed to publish metrics");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to encode metrics"),
    }
    report
}

fn write_stdout(text: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()
}

/// Replace `path` atomically so collectors never read a partial file.
fn write_textfile(path: &Path, text: &str) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(text.as_bytes())?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
