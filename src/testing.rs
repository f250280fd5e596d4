//! Test doubles: a POSIX `sh` script standing in for srvrmgr.

use crate::catalog::{CatalogError, CatalogSource, MetricDefinition};
use crate::session::{ProcessSession, SessionSettings};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Startup guard shared by scripts that honor `break_connections`.
const BROKEN_GUARD: &str = r#"dir=$(dirname "$0")
if [ -f "$dir/broken" ]; then
  echo "Connection refused by gateway" >&2
  sleep 30
  exit 1
fi
"#;

/// Command loop emulating srvrmgr's prompt and `N rows returned.` framing.
const STANDARD_LOOP: &str = r#"echo "Siebel Server Manager, Version 16.0.0.0 [23057] LANG_INDEPENDENT"
echo "Copyright (c) 2008 Siebel Systems, Inc.  All rights reserved."
echo ""
while IFS= read -r cmd; do
  echo "srvrmgr:SRV01> $cmd"
  case "$cmd" in
    exit)
      exit 0
      ;;
    "list comp")
      printf '%-7s  %-13s  %-17s  %s\n' SV_NAME CC_ALIAS CP_DISP_RUN_STATE CP_NUM_RUN_TASKS
      printf '%-7s  %-13s  %-17s  %s\n' ------- ------------- ----------------- ----------------
      printf '%-7s  %-13s  %-17s  %s\n' SRV01 EAIObjMgr_enu Running 12
      printf '%-7s  %-13s  %-17s  %s\n' SRV01 SCBroker Online 0
      echo ""
      echo "2 rows returned."
      ;;
    "list comp dup")
      printf '%-7s  %-8s  %s\n' SV_NAME CC_ALIAS CP_NUM_RUN_TASKS
      printf '%-7s  %-8s  %s\n' ------- -------- ----------------
      printf '%-7s  %-8s  %s\n' SRV01 Alias_A 3
      printf '%-7s  %-8s  %s\n' SRV01 Alias_B 4
      echo ""
      echo "2 rows returned."
      ;;
    "list comp many")
      printf '%-7s  %-8s  %s\n' SV_NAME CC_ALIAS CP_NUM_RUN_TASKS
      printf '%-7s  %-8s  %s\n' ------- -------- ----------------
      printf '%-7s  %-8s  %s\n' SRV01 Alias_A 1
      printf '%-7s  %-8s  %s\n' SRV01 Alias_B 2
      printf '%-7s  %-8s  %s\n' SRV01 Alias_A 9
      printf '%-7s  %-8s  %s\n' SRV02 Alias_A 4
      printf '%-7s  %-8s  %s\n' SRV02 Alias_B 5
      echo ""
      echo "5 rows returned."
      ;;
    "list ent")
      echo "ENT_NAME"
      echo "--------"
      echo "SBA"
      echo ""
      echo "1 row returned."
      ;;
    "list ent param MaxThreads show PA_VALUE")
      echo "PA_VALUE"
      echo "--------"
      echo "20"
      echo ""
      echo "1 row returned."
      ;;
    "list state values show STATEVAL_NAME")
      echo "STATEVAL_NAME"
      echo "-------------"
      echo "Running"
      echo ""
      echo "1 row returned."
      ;;
    warn)
      echo "SBL-ADM-60070: warning" >&2
      sleep 0.2
      echo "A"
      echo "1 row returned."
      ;;
    hang)
      echo "working..."
      sleep 30
      ;;
    die)
      exit 1
      ;;
    *)
      echo ""
      echo "0 rows returned."
      ;;
  esac
done
"#;

/// An executable script in a private temp directory.
pub(crate) struct MockShell {
    dir: TempDir,
    path: PathBuf,
}

impl MockShell {
    pub(crate) fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srvrmgr");
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        Self { dir, path }
    }

    /// Well-behaved shell answering the commands used across the test suite.
    pub(crate) fn standard() -> Self {
        Self::new(&format!("{BROKEN_GUARD}{STANDARD_LOOP}"))
    }

    /// Shell that rejects the login on stderr and then idles.
    pub(crate) fn refusing() -> Self {
        Self::new("echo 'Connection refused by gateway' >&2\nsleep 30\n")
    }

    /// Make every later start of the standard shell fail at login.
    pub(crate) fn break_connections(&self) {
        std::fs::write(self.dir.path().join("broken"), b"").unwrap();
    }

    pub(crate) fn restore_connections(&self) {
        let _ = std::fs::remove_file(self.dir.path().join("broken"));
    }

    /// Settings tuned for fast tests.
    pub(crate) fn settings(&self, auto_reconnect: bool) -> SessionSettings {
        let mut settings = SessionSettings::default();
        settings.connection.gateway = "gw01:2320".to_string();
        settings.connection.enterprise = "SBA".to_string();
        settings.connection.server = "SRV01".to_string();
        settings.connection.user = "sadmin".to_string();
        settings.connection.password = "secret".to_string();
        settings.connection.srvrmgr_path = self.path.clone();

        settings.session.auto_reconnect = auto_reconnect;
        settings.session.reconnect_delay_ms = 0;
        settings.session.settle_window_ms = 200;
        settings.session.command_timeout_secs = 5;
        settings.session.exit_timeout_secs = 2;
        settings.session.process_exit_timeout_secs = 2;
        settings.session.reader_drain_timeout_secs = 2;
        settings.session.reconnecting_grace_ms = 100;

        settings.backoff.initial_delay_ms = 50;
        settings.backoff.max_delay_ms = 200;
        settings.backoff.jitter_factor = 0.0;
        settings
    }
}

pub(crate) fn mock_session(shell: &MockShell, auto_reconnect: bool) -> ProcessSession {
    ProcessSession::new(shell.settings(auto_reconnect))
}

/// Fixed in-memory definitions.
pub(crate) struct StaticCatalog(pub Vec<MetricDefinition>);

impl CatalogSource for StaticCatalog {
    fn fingerprint(&self) -> Result<Vec<u8>, CatalogError> {
        Ok(vec![1])
    }

    fn load(&self) -> Result<Vec<MetricDefinition>, CatalogError> {
        Ok(self.0.clone())
    }
}

/// Poll `condition` until it holds or ten seconds pass.
pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
