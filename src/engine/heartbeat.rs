//! The per-intent heartbeat loop (§4.5): a periodic timer that advances
//! the Journal's `confirmed_bytes` and publishes `DownloadProgressEvent`,
//! threshold-gated and re-entrancy-guarded.

use super::context::{DownloadContext, RateTracker};
use crate::config::RetryConfig;
use crate::journal::Journal;
use crate::types::Event;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Spawn the heartbeat loop for `ctx`. Runs until `ctx.cancel` fires.
///
/// Each tick: read the atomic byte counter; if it is at least
/// `heartbeat_min_delta` bytes ahead of the last value written to the
/// Journal *and* the finalizing flag is clear, write it via
/// `Journal::heartbeat` and publish a progress event. Otherwise do
/// nothing. The finalizing check and the Journal write are not atomic
/// with each other, but that's fine: `Journal::heartbeat` itself no-ops
/// once the row is gone (deleted by `commit`), so the worst case is one
/// harmless extra write racing the transition into `Finalizing`.
pub(crate) fn spawn(
    ctx: Arc<DownloadContext>,
    journal: Journal,
    event_tx: broadcast::Sender<Event>,
    retry_config: RetryConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(retry_config.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut rate = RateTracker::new(ctx.confirmed_bytes());

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    tracing::debug!(id = %ctx.id, "heartbeat loop stopping: cancelled");
                    return;
                }
                _ = interval.tick() => {
                    if ctx.is_finalizing() {
                        tracing::debug!(id = %ctx.id, "heartbeat suppressed: finalizing");
                        continue;
                    }

                    let confirmed = ctx.confirmed_bytes();
                    let last_written = ctx.last_written_bytes.load(std::sync::atomic::Ordering::Acquire);
                    let min_delta = retry_config.heartbeat_min_delta;

                    if confirmed < last_written.saturating_add(min_delta) {
                        continue;
                    }

                    if ctx.is_finalizing() {
                        // Re-check: finalizing may have been set while we were
                        // computing the delta above.
                        continue;
                    }

                    match journal.heartbeat(ctx.id, confirmed).await {
                        Ok(()) => {
                            ctx.last_written_bytes.store(confirmed, std::sync::atomic::Ordering::Release);
                            let instant_rate = rate.observe(confirmed);
                            let _ = event_tx.send(Event::DownloadProgress {
                                id: ctx.id,
                                confirmed_bytes: confirmed,
                                instant_rate,
                            });
                        }
                        Err(e) => {
                            tracing::warn!(id = %ctx.id, error = %e, "heartbeat write failed");
                        }
                    }
                }
            }
        }
    })
}
