//! Commit ordering and the interruption paths (cancel/preemption).
//!
//! Kept separate from `state_machine` the way the teacher splits
//! `download_task/finalization.rs` out of `download_task/orchestration.rs`
//! — the commit sequence is short but its ordering is load-bearing enough
//! to want its own file and its own tests.

use super::context::DownloadContext;
use super::state_machine::EngineOutcome;
use crate::error::{Classify, Error};
use crate::journal::{Intent, Journal};
use crate::partfile::PartFile;
use crate::partfile::PartHandle;
use crate::types::{Event, FailureKind};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Sets the finalizing flag, commits the PartFile, then the Journal, then
/// publishes the completion event. Step order is mandatory (§4.5): a
/// crash between PartFile commit and Journal commit is resolved by the
/// boot recovery sweep finding `target_path` already present and calling
/// `Journal::commit` again (idempotent).
pub(super) async fn finalize(
    journal: &Journal,
    event_tx: &broadcast::Sender<Event>,
    intent: &Intent,
    handle: PartHandle,
    ctx: &Arc<DownloadContext>,
) -> EngineOutcome {
    ctx.set_finalizing();

    if let Err(e) = PartFile::commit(handle).await {
        return fail_from_error(e);
    }

    if let Err(e) = journal.commit(intent.id).await {
        tracing::error!(id = %intent.id, error = %e, "journal commit failed after partfile commit");
        return fail_from_error(e);
    }

    let _ = event_tx.send(Event::DownloadCompleted {
        id: intent.id,
        target_path: intent.target_path.clone(),
    });
    tracing::info!(id = %intent.id, "download completed");
    EngineOutcome::Completed
}

/// Cancellation or preemption: close the handle without renaming. The
/// caller (the Orchestrator's grant-consumer loop) distinguishes the two
/// by why `ctx.cancel` fired: a true `cancel()` deletes the row and
/// PartFile outright; scheduler preemption requeues the Intent so it
/// resumes from `resume_bytes` next time it's granted a slot.
pub(super) async fn interrupted(
    intent: &Intent,
    handle: PartHandle,
    ctx: &Arc<DownloadContext>,
) -> EngineOutcome {
    let resume_bytes = ctx.confirmed_bytes();
    if let Err(e) = PartFile::abandon(handle).await {
        tracing::warn!(id = %intent.id, error = %e, "failed to cleanly abandon part handle");
    }
    EngineOutcome::Preempted { resume_bytes }
}

pub(super) fn fail_from_error(e: Error) -> EngineOutcome {
    match e.kind() {
        FailureKind::Permanent => EngineOutcome::Permanent {
            reason: e.to_string(),
        },
        _ => EngineOutcome::Permanent {
            reason: format!("unrecoverable within this attempt: {e}"),
        },
    }
}
