//! Command/response framing over the session's pipes.
//!
//! A response starts after the first prompt line (`srvrmgr:...` or
//! `srvrmgr>`) and ends at the next prompt or at an `N rows returned.`
//! terminator. Everything before the first prompt is banner noise.

use crate::session::{ProcessSession, SessionError};
use crate::status::ConnectionStatus;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::Instant;

static PROMPT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"srvrmgr(:.*|>)").unwrap());
static TERMINATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r".* rows? returned\.").unwrap());

/// Matches `srvrmgr:SERVER>` and bare `srvrmgr>` prompt lines.
pub fn is_prompt(line: &str) -> bool {
    PROMPT.is_match(line)
}

/// Matches the `N rows returned.` line ending a table.
pub fn is_terminator(line: &str) -> bool {
    TERMINATOR.is_match(line)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Feed {
    Continue,
    Complete,
}

/// Accumulates the lines of one response.
#[derive(Debug, Default)]
pub(crate) struct ResponseCollector {
    started: bool,
    lines: Vec<String>,
}

impl ResponseCollector {
    pub(crate) fn push_stdout(&mut self, line: String) -> Feed {
        if !self.started {
            if is_prompt(&line) {
                self.started = true;
            }
            return Feed::Continue;
        }
        if is_prompt(&line) || is_terminator(&line) {
            return Feed::Complete;
        }
        self.lines.push(line);
        Feed::Continue
    }

    pub(crate) fn push_stderr(&mut self, line: String) {
        self.lines.push(line);
    }

    /// Collected lines, first occurrence of each kept in order.
    pub(crate) fn finish(self) -> Vec<String> {
        dedup_lines(self.lines)
    }
}

/// Drop repeated lines, keeping first occurrences in order.
pub fn dedup_lines(lines: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(lines.len());
    lines
        .into_iter()
        .filter(|line| seen.insert(line.clone()))
        .collect()
}

enum ReadOutcome {
    Complete(Vec<String>),
    Closed,
    TimedOut(Vec<String>),
}

impl ProcessSession {
    /// Send a command with the configured default timeout.
    pub async fn send(&self, command: &str) -> Result<Vec<String>, SessionError> {
        let timeout = self.settings().session.command_timeout();
        self.send_command(command, timeout).await
    }

    /// Send one command and wait for its framed response.
    ///
    /// Rejected unless the session is `Connected`; while `Reconnecting` one
    /// grace interval is allowed for the loop to finish first. On timeout the
    /// error carries the lines read so far and the status is left alone.
    pub async fn send_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, SessionError> {
        let status = self.status();
        if status != ConnectionStatus::Connected {
            if status != ConnectionStatus::Reconnecting {
                tracing::warn!(status = %status, "cannot send command: not connected");
                return Err(SessionError::NotConnected { status });
            }
            tokio::time::sleep(self.settings().session.reconnecting_grace()).await;
            let status = self.status();
            if status != ConnectionStatus::Connected {
                tracing::warn!(status = %status, "cannot send command while reconnecting");
                return Err(SessionError::NotConnected { status });
            }
            tracing::debug!("connection restored, proceeding with command");
        }
        self.exchange(command, timeout).await
    }

    /// Write a command and collect its response under the pipes lock.
    pub(crate) async fn exchange(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, SessionError> {
        tracing::debug!(command, "sending command");
        let deadline = Instant::now() + timeout;
        let timed_out = |partial: Vec<String>| SessionError::Timeout {
            command: command.to_string(),
            partial,
        };

        let mut slot = tokio::time::timeout_at(deadline, self.inner.pipes.lock())
            .await
            .map_err(|_| timed_out(Vec::new()))?;

        let status = self.status();
        let pipes = match slot.as_mut() {
            Some(pipes) if status == ConnectionStatus::Connected => pipes,
            _ => return Err(SessionError::NotConnected { status }),
        };

        pipes.clear_queues();
        let write = tokio::time::timeout_at(deadline, pipes.write_line(command)).await;
        match write {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                drop(slot);
                tracing::error!(command, error = %e, "error writing to srvrmgr stdin");
                self.handle_pipe_error();
                return Err(SessionError::Pipe { source: e });
            }
            Err(_) => return Err(timed_out(Vec::new())),
        }

        let mut collector = ResponseCollector::default();
        let mut stderr_open = true;
        let outcome = loop {
            tokio::select! {
                biased;
                line = pipes.stdout.recv() => match line {
                    Some(line) => {
                        if collector.push_stdout(line) == Feed::Complete {
                            break ReadOutcome::Complete(collector.finish());
                        }
                    }
                    None => break ReadOutcome::Closed,
                },
                line = pipes.stderr.recv(), if stderr_open => match line {
                    Some(line) => {
                        tracing::warn!(line = %line, "received stderr output");
                        collector.push_stderr(line);
                    }
                    None => stderr_open = false,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    break ReadOutcome::TimedOut(collector.finish());
                }
            }
        };
        drop(slot);

        match outcome {
            ReadOutcome::Complete(lines) => {
                self.state().touch();
                tracing::debug!(command, output_lines = lines.len(), "command completed");
                Ok(lines)
            }
            ReadOutcome::TimedOut(partial) => {
                tracing::warn!(command, partial_lines = partial.len(), "command timed out waiting for prompt");
                Err(timed_out(partial))
            }
            ReadOutcome::Closed => {
                tracing::error!(command, "srvrmgr closed its output");
                self.handle_pipe_error();
                Err(SessionError::StreamClosed)
            }
        }
    }

    /// Mark the session failed after a broken pipe and hand recovery to the supervisor.
    pub(crate) fn handle_pipe_error(&self) {
        let (previous, auto_reconnect) = {
            let mut state = self.state();
            let previous = state.status();
            if let Err(e) = state.connection_failed() {
                tracing::debug!(error = %e, "pipe error on inactive session");
            }
            (previous, state.auto_reconnect())
        };
        tracing::warn!(
            previous_status = %previous,
            auto_reconnect,
            "pipe error detected"
        );
        if auto_reconnect && previous == ConnectionStatus::Connected {
            self.spawn_reconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mock_session, MockShell};
    use pretty_assertions::assert_eq;

    fn feed(collector: &mut ResponseCollector, lines: &[&str]) -> Feed {
        let mut last = Feed::Continue;
        for line in lines {
            last = collector.push_stdout(line.to_string());
            if last == Feed::Complete {
                break;
            }
        }
        last
    }

    #[test]
    fn test_prompt_patterns() {
        assert!(is_prompt("srvrmgr:SRV01> list comp"));
        assert!(is_prompt("srvrmgr> "));
        assert!(is_prompt("srvrmgr:"));
        assert!(!is_prompt("srvrmgr"));
        assert!(!is_prompt("SV_NAME  CC_ALIAS"));
    }

    #[test]
    fn test_terminator_patterns() {
        assert!(is_terminator("2 rows returned."));
        assert!(is_terminator("1 row returned."));
        assert!(!is_terminator("rows returned"));
        assert!(!is_terminator("2 rows returned"));
    }

    #[test]
    fn test_banner_before_prompt_discarded() {
        let mut collector = ResponseCollector::default();
        let state = feed(
            &mut collector,
            &[
                "Siebel Server Manager, Version 16.0",
                "Copyright (c) 2008",
                "srvrmgr:SRV01> list comp",
                "NAME  STATE",
                "----  -----",
                "2 rows returned.",
            ],
        );
        assert_eq!(state, Feed::Complete);
        assert_eq!(collector.finish(), vec!["NAME  STATE", "----  -----"]);
    }

    #[test]
    fn test_next_prompt_ends_response() {
        let mut collector = ResponseCollector::default();
        let state = feed(
            &mut collector,
            &["srvrmgr> list ent", "ENT", "---", "srvrmgr> ", "never"],
        );
        assert_eq!(state, Feed::Complete);
        assert_eq!(collector.finish(), vec!["ENT", "---"]);
    }

    #[test]
    fn test_incomplete_without_boundary() {
        let mut collector = ResponseCollector::default();
        let state = feed(&mut collector, &["srvrmgr> list ent", "ENT", "---"]);
        assert_eq!(state, Feed::Continue);
    }

    #[test]
    fn test_stderr_lines_appended() {
        let mut collector = ResponseCollector::default();
        collector.push_stderr("warning: slow gateway".to_string());
        feed(&mut collector, &["srvrmgr> x", "A", "1 row returned."]);
        assert_eq!(collector.finish(), vec!["warning: slow gateway", "A"]);
    }

    #[test]
    fn test_dedup_preserves_first_occurrence_order() {
        let lines = ["b", "a", "b", "", "a", "c", ""]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(dedup_lines(lines), vec!["b", "a", "", "c"]);
    }

    #[tokio::test]
    async fn test_send_command_returns_table() {
        let shell = MockShell::standard();
        let session = mock_session(&shell, false);
        session.connect().await.unwrap();

        let lines = session
            .send_command("list comp", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            lines,
            vec![
                "SV_NAME  CC_ALIAS       CP_DISP_RUN_STATE  CP_NUM_RUN_TASKS",
                "-------  -------------  -----------------  ----------------",
                "SRV01    EAIObjMgr_enu  Running            12",
                "SRV01    SCBroker       Online             0",
                "",
            ]
        );
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_command_twice_yields_identical_output() {
        let shell = MockShell::standard();
        let session = mock_session(&shell, false);
        session.connect().await.unwrap();

        let first = session
            .send_command("list comp", Duration::from_secs(5))
            .await
            .unwrap();
        let second = session
            .send_command("list comp", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(first, second);
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_command_rejected_when_disconnected() {
        let shell = MockShell::standard();
        let session = mock_session(&shell, false);
        let err = session
            .send_command("list comp", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::NotConnected {
                status: ConnectionStatus::Disconnected
            }
        ));
    }

    #[tokio::test]
    async fn test_timeout_returns_partial_output_and_keeps_status() {
        let shell = MockShell::standard();
        let session = mock_session(&shell, false);
        session.connect().await.unwrap();

        let err = session
            .send_command("hang", Duration::from_millis(500))
            .await
            .unwrap_err();
        match err {
            SessionError::Timeout { command, partial } => {
                assert_eq!(command, "hang");
                assert_eq!(partial, vec!["working..."]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.status(), ConnectionStatus::Connected);
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_stderr_during_exchange_included() {
        let shell = MockShell::standard();
        let session = mock_session(&shell, false);
        session.connect().await.unwrap();

        let lines = session
            .send_command("warn", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(lines.contains(&"SBL-ADM-60070: warning".to_string()));
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_pipe_error_without_auto_reconnect_sets_connection_error() {
        let shell = MockShell::standard();
        let session = mock_session(&shell, false);
        session.connect().await.unwrap();

        let err = session
            .send_command("die", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::StreamClosed | SessionError::Pipe { .. }
        ));
        assert_eq!(session.status(), ConnectionStatus::ConnectionError);
        assert!(!session.is_reconnecting());
        session.disconnect().await.unwrap();
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
    }
}
