use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from srvrmgr-exporter.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ExporterConfig {
    pub connection: ConnectionConfig,
    pub session: SessionConfig,
    pub backoff: BackoffConfig,
    pub heartbeat: HeartbeatConfig,
    pub scrape: ScrapeConfig,
    pub catalog: CatalogConfig,
    pub output: OutputConfig,
}

/// Parameters passed to the srvrmgr executable.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub gateway: String,
    pub enterprise: String,
    pub server: String,
    pub user: String,
    pub password: String,
    pub srvrmgr_path: PathBuf,
}

// Hand-written so the password never reaches a log line.
impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("gateway", &self.gateway)
            .field("enterprise", &self.enterprise)
            .field("server", &self.server)
            .field("user", &self.user)
            .field("password", &"***")
            .field("srvrmgr_path", &self.srvrmgr_path)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub settle_window_ms: u64,
    pub command_timeout_secs: u64,
    pub exit_timeout_secs: u64,
    pub reader_drain_timeout_secs: u64,
    pub process_exit_timeout_secs: u64,
    pub reconnecting_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// 0 = retry forever.
    pub max_retries: u32,
    pub jitter_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub inactivity_threshold_secs: u64,
    pub probe_timeout_secs: u64,
    pub probe_command: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub namespace: String,
    /// strftime layout; values of the same rendered length are converted to Unix time.
    pub date_format: String,
    pub disable_empty_metrics_override: bool,
    pub disable_extended_metrics: bool,
    pub reconnect_after_scrape: bool,
    pub reconnect_settle_ms: u64,
    pub gateway_ping_command: String,
    pub application_ping_command: String,
    pub ping_timeout_secs: u64,
    pub reconnect_wait_attempts: u32,
    pub reconnect_wait_interval_ms: u64,
    pub batch_size: usize,
    pub reclaim_between_batches: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub interval_secs: u64,
    pub textfile: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            gateway: String::new(),
            enterprise: String::new(),
            server: String::new(),
            user: String::new(),
            password: String::new(),
            srvrmgr_path: PathBuf::from("srvrmgr"),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay_ms: 10_000,
            settle_window_ms: 2_000,
            command_timeout_secs: 60,
            exit_timeout_secs: 5,
            reader_drain_timeout_secs: 3,
            process_exit_timeout_secs: 3,
            reconnecting_grace_ms: 500,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            max_delay_ms: 300_000,
            multiplier: 1.5,
            max_retries: 10,
            jitter_factor: 0.2,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            inactivity_threshold_secs: 300,
            probe_timeout_secs: 5,
            probe_command: "list ent".to_string(),
        }
    }
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            namespace: "siebel".to_string(),
            date_format: "%Y-%m-%d %H:%M:%S".to_string(),
            disable_empty_metrics_override: false,
            disable_extended_metrics: false,
            reconnect_after_scrape: false,
            reconnect_settle_ms: 500,
            gateway_ping_command: "list ent param MaxThreads show PA_VALUE".to_string(),
            application_ping_command: "list state values show STATEVAL_NAME".to_string(),
            ping_timeout_secs: 60,
            reconnect_wait_attempts: 5,
            reconnect_wait_interval_ms: 500,
            batch_size: 1000,
            reclaim_between_batches: true,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            files: vec![PathBuf::from("default-metrics.toml")],
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            textfile: None,
        }
    }
}

// --- Duration accessors ---

impl OutputConfig {
    /// Time between scrapes.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl SessionConfig {
    /// Pause before the first reconnection attempt.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Wait after spawn before startup stderr is inspected.
    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    /// Default deadline for one command exchange.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Bound on delivering `exit` and on the graceful exit wait.
    pub fn exit_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_timeout_secs)
    }

    /// Bound on joining the output readers after teardown.
    pub fn reader_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.reader_drain_timeout_secs)
    }

    /// Wait after SIGTERM before SIGKILL.
    pub fn process_exit_timeout(&self) -> Duration {
        Duration::from_secs(self.process_exit_timeout_secs)
    }

    /// Extra wait a command gets while a reconnect is in flight.
    pub fn reconnecting_grace(&self) -> Duration {
        Duration::from_millis(self.reconnecting_grace_ms)
    }
}

impl HeartbeatConfig {
    /// Heartbeat tick period.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Idle time after which the heartbeat sends a probe.
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_secs)
    }

    /// Deadline for the heartbeat probe command.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl ScrapeConfig {
    /// Deadline for each of the two availability pings.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    /// Pause between disconnect and connect in a reconnect cycle.
    pub fn reconnect_settle(&self) -> Duration {
        Duration::from_millis(self.reconnect_settle_ms)
    }

    /// Poll interval while a scrape waits out a reconnect.
    pub fn reconnect_wait_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_interval_ms)
    }
}

/// Errors from loading or validating the config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ExporterConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse config from a TOML string. Missing keys take their defaults.
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Reject settings the session or scrape engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.connection;
        let required = [
            ("connection.gateway", c.gateway.as_str()),
            ("connection.enterprise", c.enterprise.as_str()),
            ("connection.server", c.server.as_str()),
            ("connection.user", c.user.as_str()),
            ("connection.password", c.password.as_str()),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{key} is required")));
            }
        }
        if c.srvrmgr_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "connection.srvrmgr_path is required".to_string(),
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff.multiplier must be >= 1.0, got {}",
                self.backoff.multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.backoff.jitter_factor) {
            return Err(ConfigError::Invalid(format!(
                "backoff.jitter_factor must be in [0, 1), got {}",
                self.backoff.jitter_factor
            )));
        }
        if self.scrape.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "scrape.namespace must not be empty".to_string(),
            ));
        }
        if self.scrape.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "scrape.batch_size must be positive".to_string(),
            ));
        }
        if self.output.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "output.interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_toml() -> &'static str {
        r#"
[connection]
gateway = "gw01:2320"
enterprise = "SBA_82"
server = "app01"
user = "sadmin"
password = "secret"
"#
    }

    #[test]
    fn test_defaults() {
        let config = ExporterConfig::default();
        assert!(config.session.auto_reconnect);
        assert_eq!(config.session.settle_window(), Duration::from_secs(2));
        assert_eq!(config.backoff.initial_delay_ms, 5_000);
        assert_eq!(config.backoff.multiplier, 1.5);
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(30));
        assert_eq!(config.heartbeat.inactivity_threshold(), Duration::from_secs(300));
        assert_eq!(config.scrape.namespace, "siebel");
        assert_eq!(config.scrape.batch_size, 1000);
        assert_eq!(config.connection.srvrmgr_path, PathBuf::from("srvrmgr"));
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = ExporterConfig::from_toml(valid_toml()).unwrap();
        assert_eq!(config.connection.gateway, "gw01:2320");
        assert_eq!(config.session.command_timeout_secs, 60);
        assert_eq!(config.catalog.files, vec![PathBuf::from("default-metrics.toml")]);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_overrides() {
        let toml = format!(
            "{}\n[backoff]\nmax_retries = 0\njitter_factor = 0.0\n[scrape]\nnamespace = \"crm\"\nreconnect_after_scrape = true\n",
            valid_toml()
        );
        let config = ExporterConfig::from_toml(&toml).unwrap();
        assert_eq!(config.backoff.max_retries, 0);
        assert_eq!(config.backoff.jitter_factor, 0.0);
        assert_eq!(config.scrape.namespace, "crm");
        assert!(config.scrape.reconnect_after_scrape);
    }

    #[test]
    fn test_validate_missing_connection_parameter() {
        let config = ExporterConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("connection.gateway"));
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        let mut config = ExporterConfig::from_toml(valid_toml()).unwrap();
        config.backoff.jitter_factor = 1.5;
        assert!(config.validate().is_err());

        config.backoff.jitter_factor = 0.1;
        config.backoff.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_hides_password() {
        let config = ExporterConfig::from_toml(valid_toml()).unwrap();
        let rendered = format!("{:?}", config.connection);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExporterConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[connection\ngateway = ").unwrap();
        let err = ExporterConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
