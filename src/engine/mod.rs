//! DownloadEngine (C5): executes one Intent to completion, defeating
//! torn writes and keeping the Journal accurate.
//!
//! Decomposed the way the teacher decomposes `download_task/`:
//! `context` (shared per-Intent state + byte counter), `state_machine`
//! (the Searching/Downloading/Verifying/Finalizing transitions),
//! `heartbeat` (the periodic timer), `finalization` (commit ordering,
//! event emission, interruption handling).

pub(crate) mod context;
mod finalization;
mod heartbeat;
mod state_machine;

pub(crate) use context::DownloadContext;
pub(crate) use state_machine::EngineOutcome;

use crate::config::{EngineConfig, RetryConfig};
use crate::journal::{Intent, Journal};
use crate::transport::SharedTransport;
use crate::types::Event;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Run one Intent to completion (or interruption), spawning and tearing
/// down its heartbeat loop around the state machine. This is the single
/// entry point the Orchestrator's grant-consumer loop calls for every
/// admitted `Kind::Download` Intent.
pub(crate) async fn execute(
    journal: Journal,
    transport: SharedTransport,
    event_tx: broadcast::Sender<Event>,
    retry_config: RetryConfig,
    engine_config: EngineConfig,
    intent: Intent,
    cancel: tokio_util::sync::CancellationToken,
) -> EngineOutcome {
    let ctx = Arc::new(DownloadContext::new(&intent, cancel));
    let heartbeat_handle = heartbeat::spawn(
        ctx.clone(),
        journal.clone(),
        event_tx.clone(),
        retry_config.clone(),
    );

    let outcome = state_machine::run(
        &journal,
        &transport,
        &event_tx,
        &retry_config,
        &engine_config,
        intent,
        ctx,
    )
    .await;

    heartbeat_handle.abort();
    outcome
}
