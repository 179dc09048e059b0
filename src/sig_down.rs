//! Graceful shutdown on SIGTERM / SIGINT.
//!
//! A background task listens for either signal and fires a cancellation
//! token. Subsystems (HTTP server, sweep loop, drivers) each take a clone of
//! the token and wind down at their next safe point.

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct SigDown {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl SigDown {
    /// Registers the signal handlers. Fails only if the process cannot
    /// install them.
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = CancellationToken::new();
        let fired = token.clone();
        let tracker = TaskTracker::new();
        tracker.spawn(async move {
            let which = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            tracing::info!(signal = which, "shutdown signal received");
            fired.cancel();
        });
        tracker.close();
        Ok(Self { tracker, token })
    }

    /// A token that resolves when a shutdown signal arrives.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Waits for a shutdown signal.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
        self.tracker.wait().await;
    }
}
