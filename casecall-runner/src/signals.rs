//! SIGINT / SIGTERM handling for the worker process.
//!
//! The first signal of either kind starts a graceful drain. While draining, a
//! further SIGINT forces the exit and a further SIGTERM is only logged.

use std::io;

use tracing::warn;

pub(crate) struct ShutdownSignals {
    #[cfg(unix)]
    term: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    pub(crate) fn install() -> io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            term: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    #[cfg(unix)]
    async fn terminate(&mut self) {
        if self.term.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&mut self) {
        std::future::pending::<()>().await;
    }

    /// Resolves with the name of the first shutdown signal received.
    pub(crate) async fn first(&mut self) -> &'static str {
        let interrupted = tokio::select! {
            result = tokio::signal::ctrl_c() => Some(result),
            _ = self.terminate() => None,
        };
        match interrupted {
            Some(Ok(())) => "SIGINT",
            Some(Err(err)) => {
                warn!(error = %err, "Failed to listen for SIGINT");
                self.terminate().await;
                "SIGTERM"
            }
            None => "SIGTERM",
        }
    }

    /// Resolves on the next SIGINT.
    pub(crate) async fn force(mut self) {
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    match result {
                        Ok(()) => return,
                        Err(err) => {
                            warn!(error = %err, "Failed to listen for SIGINT");
                            std::future::pending::<()>().await;
                        }
                    }
                }
                _ = self.terminate() => {
                    warn!("Shutdown already in progress. Press Ctrl+C again to force exit");
                }
            }
        }
    }
}
