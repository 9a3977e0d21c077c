//! Graceful shutdown on SIGTERM and SIGINT.

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Trips a [`CancellationToken`] when the process receives SIGTERM or
/// SIGINT. The HTTP server, the scheduler, and every subsystem task hold a
/// child of this token.
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Register the signal handlers. Errors if registration fails.
    pub fn install() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = CancellationToken::new();
        let trip = token.clone();
        tokio::spawn(async move {
            let which = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            tracing::info!(signal = which, "shutting down");
            trip.cancel();
        });
        Ok(Self { token })
    }

    /// A clone of the token for distributing to subsystems.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
