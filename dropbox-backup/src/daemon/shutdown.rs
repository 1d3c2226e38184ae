//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the run token: no new uploads are submitted, in-flight
//! uploads finish, and the manifest is still saved with what succeeded.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled when a shutdown signal arrives
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGINT or SIGTERM, then cancel the token
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        let ctrl_c = signal::ctrl_c();

        #[cfg(unix)]
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        #[cfg(unix)]
        let terminate = sigterm.recv();

        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            result = ctrl_c => {
                result?;
                info!("Received SIGINT (Ctrl+C), finishing in-flight uploads...");
            }
            _ = terminate => {
                info!("Received SIGTERM, finishing in-flight uploads...");
            }
            _ = self.token.cancelled() => return Ok(()),
        }

        self.shutdown();
        Ok(())
    }

    /// Cancel the run without waiting for a signal
    pub fn shutdown(&self) {
        if self.token.is_cancelled() {
            warn!("Shutdown already in progress");
            return;
        }
        self.token.cancel();
    }

    /// Listen for signals in the background for the lifetime of the process
    pub fn spawn_listener(self) -> CancellationToken {
        let token = self.token();
        tokio::spawn(async move {
            if let Err(e) = self.wait_for_signal().await {
                warn!("Cannot install signal handlers: {}", e);
            }
        });
        token
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
