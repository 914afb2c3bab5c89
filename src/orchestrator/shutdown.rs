//! Graceful shutdown (§4.6.3): stop admitting, signal every running
//! Engine, wait a bounded grace period, then close the store. Any
//! transfer that hasn't finalized by the deadline is simply abandoned in
//! place — its Journal row is untouched and the boot recovery sweep picks
//! it up next time, per the design's "running transfers that have not
//! finalized leave durable Intents" guarantee.

use super::Orchestrator;
use std::time::Duration;

impl Orchestrator {
    /// Consume the orchestrator, shutting it down. Stops accepting new
    /// submits immediately; running Engines are cancelled and given up to
    /// `config.engine.shutdown_grace` to stop before this returns.
    ///
    /// Cancelling an Engine already past `Finalizing` is harmless — the
    /// finalize sequence (PartFile commit, Journal commit, event publish)
    /// does not poll its cancellation token, so an in-flight commit simply
    /// runs to completion while this waits.
    pub async fn shutdown(self) {
        self.scheduler.pause_all().await;
        self.ticker.abort();
        self.grant_loop.abort();

        let tokens: Vec<_> = {
            let active = self.active.lock().await;
            active.values().map(|t| t.cancel.clone()).collect()
        };
        for token in &tokens {
            token.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.config.engine.shutdown_grace;
        loop {
            if self.active.lock().await.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let remaining = self.active.lock().await.len();
                tracing::warn!(
                    remaining,
                    "shutdown grace period elapsed; remaining intents resume on next boot"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        self.journal.close().await;
        tracing::info!("orchestrator shut down");
    }
}
