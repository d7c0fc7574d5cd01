//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! The coordinator owns a cancellation token that is cancelled when a
//! signal arrives, so the scheduler, pending uploads and one-shot commands
//! can be wound down in order.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

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

    /// Token cancelled once shutdown starts
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGINT or SIGTERM, or for the token to be cancelled
    /// elsewhere. The token is cancelled on return.
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        #[cfg(unix)]
        let terminate = async move {
            terminate.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {
                info!("Shutdown requested");
            }
        }

        self.token.cancel();
        Ok(())
    }

    /// Run [`Self::wait_for_signal`] in the background and return the token.
    /// If the signal handlers cannot be installed the token is cancelled.
    pub fn spawn_listener(self) -> CancellationToken {
        let token = self.token();
        tokio::spawn(async move {
            if let Err(e) = self.wait_for_signal().await {
                tracing::error!(error = %e, "Failed to install signal handlers, shutting down");
                self.token.cancel();
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
