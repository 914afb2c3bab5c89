//! Boot recovery sweep (§4.6.2): runs once, before any new submits are
//! admitted, using the Journal as the single source of truth for what a
//! prior crash left in progress.

use crate::journal::{BumpFailureOutcome, Journal};
use crate::lane_scheduler::{LaneScheduler, QueuedIntent};
use crate::types::{Event, Kind, Lane};
use tokio::sync::broadcast;

/// Outcome tallies for logging/testing; not part of the public API.
pub(crate) struct SweepReport {
    pub(crate) restored_count: usize,
    pub(crate) already_completed: usize,
    pub(crate) dead_lettered: usize,
}

/// Run the sweep described in §4.6.2:
///
/// - A row whose `target_path` already exists on disk (Download kind)
///   means a prior crash happened after the PartFile rename but before
///   `Journal::commit` — resolve by committing now and publishing
///   `DownloadCompletedEvent`.
/// - Otherwise, a Download row is re-admitted into the `LaneScheduler`.
///   If the destination directory isn't writable, this replay can't even
///   start — that failure happened before any new `confirmed_bytes`, so
///   it is recovery-time-equivalent and bumps `failure_count` (grounded
///   in S4's "target path unwritable for three boots" scenario).
/// - A `TagWrite` row is left untouched: it shares the Journal and
///   recovery discipline but has no built-in engine here (tag writing is
///   a downstream consumer of `DownloadCompletedEvent`, per §1's
///   explicit scope boundary); an external handler owning the same
///   Journal is expected to resolve it.
///
/// Every row found at boot is treated as stale by definition (§4.1: a
/// monotonic clock reading from a prior process carries no meaning), so
/// this sweep does not consult `last_heartbeat_ticks` at all.
pub(crate) async fn sweep(
    journal: &Journal,
    scheduler: &LaneScheduler,
    event_tx: &broadcast::Sender<Event>,
) -> crate::error::Result<SweepReport> {
    let rows = journal.list_active_ordered().await?;
    let mut restored_count = 0;
    let mut already_completed = 0;
    let mut dead_lettered = 0;

    for intent in rows {
        if intent.kind != Kind::Download {
            tracing::debug!(id = %intent.id, "leaving TagWrite intent for an external handler");
            continue;
        }

        if tokio::fs::metadata(&intent.target_path).await.is_ok() {
            tracing::info!(id = %intent.id, target = %intent.target_path.display(), "recovery: target already committed, clearing stale intent");
            journal.commit(intent.id).await?;
            let _ = event_tx.send(Event::DownloadCompleted {
                id: intent.id,
                target_path: intent.target_path.clone(),
            });
            already_completed += 1;
            continue;
        }

        if !destination_writable(&intent.target_path).await {
            tracing::warn!(id = %intent.id, "recovery: destination directory not writable, counting as a failed replay");
            match journal.bump_failure(intent.id).await {
                Ok(BumpFailureOutcome::DeadLettered(failure_count)) => {
                    dead_lettered += 1;
                    let _ = event_tx.send(Event::IntentDeadLettered {
                        id: intent.id,
                        failure_count,
                    });
                }
                Ok(BumpFailureOutcome::StillActive(_)) => {}
                Err(e) => {
                    tracing::error!(id = %intent.id, error = %e, "recovery: bump_failure failed");
                }
            }
            continue;
        }

        scheduler
            .submit(QueuedIntent {
                id: intent.id,
                priority: intent.priority,
                created_at: intent.created_at,
            })
            .await;
        restored_count += 1;
        tracing::debug!(id = %intent.id, lane = ?Lane::from_priority(intent.priority), "recovery: re-admitted intent");
    }

    Ok(SweepReport {
        restored_count,
        already_completed,
        dead_lettered,
    })
}

async fn destination_writable(target_path: &std::path::Path) -> bool {
    match target_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            tokio::fs::metadata(parent).await.is_ok_and(|m| m.is_dir())
        }
        _ => true,
    }
}
