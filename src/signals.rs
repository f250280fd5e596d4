//! Shutdown signal handling for the scrape loop.

use tokio::signal::unix::{signal, SignalKind};

/// Which signal asked the exporter to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Interrupt,
    Terminate,
}

impl Shutdown {
    /// Conventional signal name, for logs.
    pub fn name(self) -> &'static str {
        match self {
            Shutdown::Interrupt => "SIGINT",
            Shutdown::Terminate => "SIGTERM",
        }
    }
}

/// Resolves on the first SIGINT or SIGTERM.
///
/// Handlers are installed when this is first polled; an installation failure
/// is returned instead of resolving.
pub async fn shutdown_signal() -> std::io::Result<Shutdown> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let received = tokio::select! {
        _ = interrupt.recv() => Shutdown::Interrupt,
        _ = terminate.recv() => Shutdown::Terminate,
    };
    tracing::info!(signal = received.name(), "shutdown requested");
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::time::Duration;

    #[test]
    fn test_signal_names() {
        assert_eq!(Shutdown::Interrupt.name(), "SIGINT");
        assert_eq!(Shutdown::Terminate.name(), "SIGTERM");
    }

    #[tokio::test]
    async fn test_sigterm_resolves() {
        let waiter = tokio::spawn(shutdown_signal());
        // Let the handlers install before raising.
        tokio::time::sleep(Duration::from_millis(100)).await;
        kill(Pid::this(), Signal::SIGTERM).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received, Shutdown::Terminate);
    }
}
