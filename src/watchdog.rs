//! Connection supervision for a srvrmgr session.
//!
//! A heartbeat task probes the shell when it has been idle for longer than
//! the inactivity threshold. A failed probe or a broken pipe starts the
//! reconnection loop, which tears the process down and retries `establish`
//! with exponential backoff until it succeeds, the retry budget runs out, or
//! the stop signal fires. Only one loop runs at a time.

use crate::retry::Backoff;
use crate::session::{ProcessSession, SessionError};
use crate::status::ConnectionStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Reconnection counters shared by every clone of a session.
#[derive(Debug, Default)]
pub struct ReconnectStats {
    successes: AtomicU64,
    errors: AtomicU64,
    last_duration_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconnectSnapshot {
    pub reconnects: u64,
    pub errors: u64,
    pub last_duration: Duration,
}

impl ReconnectStats {
    /// Count a reconnection that took `elapsed`.
    pub fn record_success(&self, elapsed: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.last_duration_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// Count a failed reconnection attempt.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> ReconnectSnapshot {
        ReconnectSnapshot {
            reconnects: self.successes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_duration: Duration::from_millis(self.last_duration_ms.load(Ordering::Relaxed)),
        }
    }
}

impl ProcessSession {
    /// Reconnection counters for this session.
    pub fn reconnect_stats(&self) -> ReconnectSnapshot {
        self.inner.stats.snapshot()
    }

    /// (Re)start the heartbeat task. Does nothing while auto-reconnect is off.
    pub(crate) fn start_heartbeat(&self) {
        if !self.auto_reconnect() {
            return;
        }
        let mut sup = self.supervision();
        if let Some(old) = sup.heartbeat.take() {
            old.abort();
        }
        let stop = sup.stop.clone();
        let session = self.clone();
        sup.heartbeat = Some(tokio::spawn(session.heartbeat_loop(stop)));
        tracing::debug!(
            interval_secs = self.settings().heartbeat.interval_secs,
            "heartbeat started"
        );
    }

    async fn heartbeat_loop(self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings().heartbeat.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.is_reconnecting() || self.status() != ConnectionStatus::Connected {
                continue;
            }
            if !self.check_health().await {
                tracing::warn!("health check failed, starting reconnection");
                self.spawn_reconnect();
                break;
            }
        }
        tracing::debug!("heartbeat stopped");
    }

    /// Whether the session looks usable.
    ///
    /// Recent activity counts as healthy; past the inactivity threshold a
    /// lightweight probe command decides.
    pub async fn check_health(&self) -> bool {
        let (status, idle) = {
            let state = self.state();
            (state.status(), state.last_activity().elapsed())
        };
        if status != ConnectionStatus::Connected {
            return false;
        }
        let heartbeat = &self.settings().heartbeat;
        if idle <= heartbeat.inactivity_threshold() {
            return true;
        }

        tracing::debug!(idle_secs = idle.as_secs(), "probing idle srvrmgr session");
        match self
            .exchange(&heartbeat.probe_command, heartbeat.probe_timeout())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "health probe failed");
                false
            }
        }
    }

    /// Start the reconnection loop unless one is already running.
    pub(crate) fn spawn_reconnect(&self) -> Option<JoinHandle<()>> {
        let claimed = self.state().begin_reconnect();
        match claimed {
            Ok(true) => {
                let stop = self.stop_token();
                let session = self.clone();
                Some(tokio::spawn(session.reconnect_loop(stop)))
            }
            Ok(false) => {
                tracing::debug!("reconnection already in progress or disabled");
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "reconnection not started");
                None
            }
        }
    }

    async fn reconnect_loop(self, stop: CancellationToken) {
        let started = Instant::now();
        tracing::info!("starting reconnection loop");

        if let Some(heartbeat) = self.supervision().heartbeat.take() {
            heartbeat.abort();
        }
        self.teardown_process().await;

        let initial_pause = self.supervision().reconnect_delay;
        let mut cancelled = false;
        if !initial_pause.is_zero() {
            tokio::select! {
                _ = stop.cancelled() => { cancelled = true }
                _ = tokio::time::sleep(initial_pause) => {}
            }
        }

        let mut backoff = Backoff::new(&self.settings().backoff);
        while !cancelled {
            let attempt = backoff.retries() + 1;
            tracing::info!(attempt, "attempting to reconnect");
            match self.establish(&stop).await {
                Ok(()) => {
                    if let Err(e) = self.state().connected() {
                        tracing::warn!(error = %e, "reconnected process superseded");
                        break;
                    }
                    self.inner.stats.record_success(started.elapsed());
                    tracing::info!(
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "reconnected to srvrmgr"
                    );
                    self.start_heartbeat();
                    break;
                }
                Err(SessionError::Cancelled) => break,
                Err(e) => {
                    self.inner.stats.record_error();
                    tracing::warn!(attempt, error = %e, "reconnection attempt failed");
                    let Some(delay) = backoff.record_failure() else {
                        tracing::error!(attempts = attempt, "giving up on reconnection");
                        let _ = self.state().connection_failed();
                        break;
                    };
                    tracing::debug!(delay_ms = delay.as_millis() as u64, "waiting before next attempt");
                    tokio::select! {
                        _ = stop.cancelled() => { cancelled = true }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let mut state = self.state();
        if state.status() == ConnectionStatus::Reconnecting {
            tracing::info!("reconnection cancelled");
            let _ = state.connection_failed();
        }
        state.end_reconnect();
    }

    /// Disconnect, wait `settle`, and connect again.
    ///
    /// Runs outside the backoff loop and counts toward the reconnect statistics.
    pub async fn reconnect_cycle(&self, settle: Duration) -> Result<(), SessionError> {
        let started = Instant::now();
        tracing::info!(settle_ms = settle.as_millis() as u64, "cycling srvrmgr session");
        let result = async {
            self.disconnect().await?;
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
            self.connect().await
        }
        .await;

        match &result {
            Ok(()) => {
                self.inner.stats.record_success(started.elapsed());
                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "session cycle completed"
                );
            }
            Err(e) => {
                self.inner.stats.record_error();
                tracing::error!(error = %e, "session cycle failed");
            }
        }
        result
    }

    /// Tear down and reconnect immediately.
    pub async fn force_reconnect(&self) -> Result<(), SessionError> {
        self.reconnect_cycle(Duration::ZERO).await
    }

    /// Turn supervision on, optionally changing the pause before the first retry.
    pub fn enable_auto_reconnect(&self, delay: Option<Duration>) {
        self.reset_stop();
        if let Some(delay) = delay {
            self.supervision().reconnect_delay = delay;
        }
        self.state().set_auto_reconnect(true);
        tracing::info!("auto-reconnect enabled");
        if self.is_connected() {
            self.start_heartbeat();
        }
    }

    /// Turn supervision off and stop any running loop or heartbeat.
    pub fn disable_auto_reconnect(&self) {
        self.reset_stop();
        self.state().set_auto_reconnect(false);
        tracing::info!("auto-reconnect disabled");
    }
}
