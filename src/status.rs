//! Connection state machine for a srvrmgr session.
//!
//! All status changes go through `SessionState`, which rejects transitions
//! that the lifecycle does not allow and owns the single-flight reconnect flag.

use std::fmt;
use std::time::Instant;

/// Connection status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    ConnectionError,
    Reconnecting,
}

impl ConnectionStatus {
    /// Status name as shown in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Disconnecting => "Disconnecting",
            ConnectionStatus::ConnectionError => "ConnectionError",
            ConnectionStatus::Reconnecting => "Reconnecting",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition the lifecycle does not permit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

/// Owned session state: status, activity clock, supervision flags.
#[derive(Debug)]
pub struct SessionState {
    status: ConnectionStatus,
    last_activity: Instant,
    reconnecting: bool,
    auto_reconnect: bool,
}

impl SessionState {
    /// Starts `Disconnected` with the activity clock at now.
    pub fn new(auto_reconnect: bool) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            last_activity: Instant::now(),
            reconnecting: false,
            auto_reconnect,
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Whether auto-reconnect is enabled.
    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    /// Enable or disable auto-reconnect.
    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        self.auto_reconnect = enabled;
    }

    /// Whether the single-flight reconnect flag is held.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    /// Time of the last successful exchange or connect.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Record a successful exchange with the shell.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// `Disconnected -> Connecting`.
    pub fn begin_connect(&mut self) -> Result<(), TransitionError> {
        self.transition(ConnectionStatus::Connecting, |from| {
            from == ConnectionStatus::Disconnected
        })
    }

    /// `Connecting | Reconnecting -> Connected`.
    pub fn connected(&mut self) -> Result<(), TransitionError> {
        self.transition(ConnectionStatus::Connected, |from| {
            matches!(
                from,
                ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
            )
        })?;
        self.touch();
        Ok(())
    }

    /// `Connecting | Connected | Reconnecting -> ConnectionError`.
    pub fn connection_failed(&mut self) -> Result<(), TransitionError> {
        self.transition(ConnectionStatus::ConnectionError, |from| {
            matches!(
                from,
                ConnectionStatus::Connecting
                    | ConnectionStatus::Connected
                    | ConnectionStatus::Reconnecting
                    | ConnectionStatus::ConnectionError
            )
        })
    }

    /// Any live status `-> Disconnecting`.
    pub fn begin_disconnect(&mut self) -> Result<(), TransitionError> {
        self.transition(ConnectionStatus::Disconnecting, |from| {
            from != ConnectionStatus::Disconnected
        })
    }

    /// `Disconnecting -> Disconnected`.
    pub fn disconnected(&mut self) -> Result<(), TransitionError> {
        self.transition(ConnectionStatus::Disconnected, |from| {
            from == ConnectionStatus::Disconnecting
        })
    }

    /// `Connected | ConnectionError -> Reconnecting`, claiming the
    /// single-flight flag.
    ///
    /// Returns `Ok(false)` without changing anything when a loop is already
    /// running or supervision is disabled.
    pub fn begin_reconnect(&mut self) -> Result<bool, TransitionError> {
        if self.reconnecting || !self.auto_reconnect {
            return Ok(false);
        }
        self.transition(ConnectionStatus::Reconnecting, |from| {
            matches!(
                from,
                ConnectionStatus::Connected | ConnectionStatus::ConnectionError
            )
        })?;
        self.reconnecting = true;
        Ok(true)
    }

    /// Release the single-flight flag once a reconnection loop exits.
    pub fn end_reconnect(&mut self) {
        self.reconnecting = false;
    }

    fn transition(
        &mut self,
        to: ConnectionStatus,
        allowed: impl Fn(ConnectionStatus) -> bool,
    ) -> Result<(), TransitionError> {
        let from = self.status;
        if !allowed(from) {
            return Err(TransitionError { from, to });
        }
        self.status = to;
        tracing::debug!(from = %from, to = %to, "session status changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_disconnected() {
        let state = SessionState::new(true);
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
        assert!(!state.is_reconnecting());
        assert!(state.auto_reconnect());
    }

    #[test]
    fn test_connect_lifecycle() {
        let mut state = SessionState::new(false);
        state.begin_connect().unwrap();
        assert_eq!(state.status(), ConnectionStatus::Connecting);
        state.connected().unwrap();
        assert_eq!(state.status(), ConnectionStatus::Connected);
        state.begin_disconnect().unwrap();
        assert_eq!(state.status(), ConnectionStatus::Disconnecting);
        state.disconnected().unwrap();
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_connect_from_connected_rejected() {
        let mut state = SessionState::new(false);
        state.begin_connect().unwrap();
        state.connected().unwrap();
        let err = state.begin_connect().unwrap_err();
        assert_eq!(err.from, ConnectionStatus::Connected);
        assert_eq!(err.to, ConnectionStatus::Connecting);
        assert_eq!(state.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_failed_connect_goes_to_connection_error() {
        let mut state = SessionState::new(false);
        state.begin_connect().unwrap();
        state.connection_failed().unwrap();
        assert_eq!(state.status(), ConnectionStatus::ConnectionError);
    }

    #[test]
    fn test_disconnected_cannot_fail_or_finish_disconnect() {
        let mut state = SessionState::new(false);
        assert!(state.connection_failed().is_err());
        assert!(state.disconnected().is_err());
        assert!(state.begin_disconnect().is_err());
    }

    #[test]
    fn test_reconnect_requires_auto_reconnect() {
        let mut state = SessionState::new(false);
        state.begin_connect().unwrap();
        state.connected().unwrap();
        assert_eq!(state.begin_reconnect(), Ok(false));
        assert_eq!(state.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_reconnect_is_single_flight() {
        let mut state = SessionState::new(true);
        state.begin_connect().unwrap();
        state.connected().unwrap();
        assert_eq!(state.begin_reconnect(), Ok(true));
        assert_eq!(state.status(), ConnectionStatus::Reconnecting);
        assert!(state.is_reconnecting());
        // Second claim while the loop is active is a no-op
        assert_eq!(state.begin_reconnect(), Ok(false));

        state.connected().unwrap();
        state.end_reconnect();
        assert!(!state.is_reconnecting());
    }

    #[test]
    fn test_reconnect_from_connection_error() {
        let mut state = SessionState::new(true);
        state.begin_connect().unwrap();
        state.connection_failed().unwrap();
        assert_eq!(state.begin_reconnect(), Ok(true));
        state.connection_failed().unwrap();
        assert_eq!(state.status(), ConnectionStatus::ConnectionError);
    }

    #[test]
    fn test_reconnect_from_disconnected_rejected() {
        let mut state = SessionState::new(true);
        assert!(state.begin_reconnect().is_err());
        assert!(!state.is_reconnecting());
    }

    #[test]
    fn test_connected_refreshes_activity() {
        let mut state = SessionState::new(false);
        let before = state.last_activity();
        std::thread::sleep(std::time::Duration::from_millis(5));
        state.begin_connect().unwrap();
        state.connected().unwrap();
        assert!(state.last_activity() > before);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::ConnectionError.to_string(), "ConnectionError");
        assert_eq!(ConnectionStatus::Reconnecting.as_str(), "Reconnecting");
    }
}
