//! DownloadEngine (C5): executes one Intent to completion through
//! Searching -> Downloading -> Verifying -> Finalizing, defeating torn
//! writes and keeping the journal accurate.

use super::context::DownloadContext;
use super::finalization::{fail_from_error, finalize, interrupted};
use crate::config::{EngineConfig, RetryConfig};
use crate::error::Classify;
use crate::journal::{Intent, IntentState, Journal};
use crate::partfile::{HandshakeOutcome, PartFile, PartHandle};
use crate::retry::{StallDetector, backoff_delay};
use crate::transport::{PeerLease, SharedTransport};
use crate::types::{Event, FailureKind};
use std::sync::Arc;
use tokio::sync::broadcast;

/// How this attempt at an Intent ended. The caller (the Orchestrator's
/// grant-consumer loop) decides what to do with the `LaneScheduler` slot
/// and the Journal based on this.
#[derive(Debug)]
pub(crate) enum EngineOutcome {
    /// Committed successfully; the Journal row is already deleted.
    Completed,
    /// Execution stopped because `ctx.cancel` fired. The Engine itself
    /// cannot tell an explicit `Orchestrator::cancel` apart from a
    /// scheduler preemption — both interrupt the same way, abandoning
    /// the PartFile at `resume_bytes` — so the caller (the grant-consumer
    /// loop, which knows which one it asked for) decides whether to
    /// delete the Journal row or requeue it.
    Preempted { resume_bytes: u64 },
    /// A permanent, unretryable failure. Per §7 this fails the Intent
    /// immediately; the caller publishes `DownloadFailedEvent` and, per
    /// this crate's reading of §4.3 (a replay that fails before a commit
    /// is recovery-time-equivalent regardless of whether it happened at
    /// boot), calls `Journal::bump_failure`.
    Permanent { reason: String },
}

/// Run `intent` to completion (or to an interruption). `ctx` has already
/// been constructed from `intent`'s durable `confirmed_bytes`.
pub(crate) async fn run(
    journal: &Journal,
    transport: &SharedTransport,
    event_tx: &broadcast::Sender<Event>,
    retry_config: &RetryConfig,
    engine_config: &EngineConfig,
    intent: Intent,
    ctx: Arc<DownloadContext>,
) -> EngineOutcome {
    let IntentState::Download {
        source_key,
        expected_size,
        expected_digest,
        ..
    } = intent.state.clone()
    else {
        // TagWrite intents are never routed to the DownloadEngine; see
        // the Orchestrator's grant-consumer loop.
        return EngineOutcome::Permanent {
            reason: "DownloadEngine received a non-Download intent".into(),
        };
    };

    let (mut handle, outcome) =
        match PartFile::acquire(&intent.target_path, ctx.confirmed_bytes(), expected_size).await {
            Ok(pair) => pair,
            Err(e) => return fail_from_error(e),
        };

    // Ghost File: disk already claims completion. Verify before trusting it.
    if outcome == HandshakeOutcome::GhostVerify {
        match PartFile::verify_ghost(&handle, expected_digest.as_deref()).await {
            Ok(true) => return finalize(journal, event_tx, &intent, handle, &ctx).await,
            Ok(false) => {
                if let Err(e) = PartFile::truncate_to(&mut handle, ctx.confirmed_bytes()).await {
                    return fail_from_error(e);
                }
            }
            Err(e) => return fail_from_error(e),
        }
    } else {
        // Fresh / ResumeFromDisk / TruncateToConfirmed all leave the
        // handle positioned at the byte offset we should resume from;
        // that may differ from the Journal's `confirmed_bytes` (e.g.
        // ResumeFromDisk trusts a disk length below the journal's
        // value), so re-synchronize the in-memory counter to match.
        ctx.set_confirmed_bytes(handle.position());
    }

    // `expected_size == 0` collapses straight to Finalizing: there is
    // nothing to stream (§8.3 boundary case).
    if expected_size == Some(0) {
        return finalize(journal, event_tx, &intent, handle, &ctx).await;
    }

    let mut stall = StallDetector::new(retry_config);
    let mut attempt: u32 = 0;
    let mut last_peer_hint: Option<String> = None;

    loop {
        if ctx.cancel.is_cancelled() {
            return interrupted(&intent, handle, &ctx).await;
        }

        let lease = match search_and_reserve(transport, &source_key, &ctx.cancel).await {
            SearchOutcome::Ready(lease) => lease,
            SearchOutcome::Interrupted => return interrupted(&intent, handle, &ctx).await,
            SearchOutcome::Retry(hint) => {
                last_peer_hint = hint.or(last_peer_hint);
                if !backoff_or_interrupt(retry_config, attempt, &ctx.cancel).await {
                    return interrupted(&intent, handle, &ctx).await;
                }
                attempt += 1;
                continue;
            }
            SearchOutcome::Permanent(msg) => {
                return EngineOutcome::Permanent { reason: msg };
            }
        };
        last_peer_hint = Some(lease.peer_id().to_string());

        match stream_until_done(
            transport,
            &lease,
            &mut handle,
            &ctx,
            &mut stall,
            retry_config,
            engine_config,
            expected_size,
        )
        .await
        {
            StreamOutcome::ReachedExpectedSize | StreamOutcome::PeerReportedEof => {
                transport.release(lease).await;
                break;
            }
            StreamOutcome::Interrupted => {
                transport.release(lease).await;
                return interrupted(&intent, handle, &ctx).await;
            }
            StreamOutcome::Transient => {
                transport.release(lease).await;
                attempt = 0; // a connected session counts as progress toward backoff reset
                if !backoff_or_interrupt(retry_config, attempt, &ctx.cancel).await {
                    return interrupted(&intent, handle, &ctx).await;
                }
                continue;
            }
        }
    }

    // Verifying.
    match PartFile::verify_ghost(&handle, expected_digest.as_deref()).await {
        Ok(true) => finalize(journal, event_tx, &intent, handle, &ctx).await,
        Ok(false) => {
            tracing::warn!(id = %intent.id, "digest mismatch after full download; truncating and resuming");
            let last_confirmed = journal
                .get(intent.id)
                .await
                .ok()
                .flatten()
                .map(|row| row.state.confirmed_bytes())
                .unwrap_or(0);
            if let Err(e) = PartFile::truncate_to(&mut handle, last_confirmed).await {
                return fail_from_error(e);
            }
            ctx.set_confirmed_bytes(last_confirmed);
            interrupted(&intent, handle, &ctx).await
        }
        Err(e) => fail_from_error(e),
    }
}

enum SearchOutcome {
    Ready(PeerLease),
    Retry(Option<String>),
    Permanent(String),
    Interrupted,
}

async fn search_and_reserve(
    transport: &SharedTransport,
    source_key: &[u8],
    cancel: &tokio_util::sync::CancellationToken,
) -> SearchOutcome {
    let lease = tokio::select! {
        _ = cancel.cancelled() => return SearchOutcome::Interrupted,
        result = transport.search(source_key) => result,
    };
    let lease = match lease {
        Ok(lease) => lease,
        Err(e) => {
            return match e.kind() {
                FailureKind::Permanent => SearchOutcome::Permanent(e.to_string()),
                _ => SearchOutcome::Retry(None),
            };
        }
    };

    let reserved = tokio::select! {
        _ = cancel.cancelled() => return SearchOutcome::Interrupted,
        result = transport.reserve(&lease) => result,
    };
    match reserved {
        Ok(()) => SearchOutcome::Ready(lease),
        Err(e) => match e.kind() {
            FailureKind::Permanent => SearchOutcome::Permanent(e.to_string()),
            _ => SearchOutcome::Retry(Some(lease.peer_id().to_string())),
        },
    }
}

enum StreamOutcome {
    ReachedExpectedSize,
    PeerReportedEof,
    Transient,
    Interrupted,
}

#[allow(clippy::too_many_arguments)]
async fn stream_until_done(
    transport: &SharedTransport,
    lease: &PeerLease,
    handle: &mut PartHandle,
    ctx: &Arc<DownloadContext>,
    stall: &mut StallDetector,
    retry_config: &RetryConfig,
    engine_config: &EngineConfig,
    expected_size: Option<u64>,
) -> StreamOutcome {
    let mut rx = match transport.stream(lease, handle.position()).await {
        Ok(rx) => rx,
        Err(_) => return StreamOutcome::Transient,
    };

    let attempt_deadline = tokio::time::Instant::now() + engine_config.attempt_wall_clock_cap;
    let mut stall_ticker = tokio::time::interval(retry_config.heartbeat_interval);
    stall_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        if ctx.cancel.is_cancelled() {
            return StreamOutcome::Interrupted;
        }
        if tokio::time::Instant::now() >= attempt_deadline {
            tracing::warn!(id = %ctx.id, "attempt wall-clock cap exceeded; forcing backoff");
            return StreamOutcome::Transient;
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => return StreamOutcome::Interrupted,
            _ = stall_ticker.tick() => {
                if stall.observe(ctx.confirmed_bytes()) {
                    tracing::warn!(id = %ctx.id, "stall detected; dropping peer");
                    return StreamOutcome::Transient;
                }
            }
            chunk = tokio::time::timeout(engine_config.peer_idle_timeout, rx.recv()) => {
                match chunk {
                    Err(_elapsed) => {
                        tracing::warn!(id = %ctx.id, "peer read timed out");
                        return StreamOutcome::Transient;
                    }
                    Ok(None) => {
                        return if expected_size.is_none() {
                            StreamOutcome::PeerReportedEof
                        } else {
                            // Peer hung up before reaching the known
                            // expected size: treat as a disconnect, not
                            // completion.
                            StreamOutcome::Transient
                        };
                    }
                    Ok(Some(Err(_))) => return StreamOutcome::Transient,
                    Ok(Some(Ok(c))) => {
                        if c.offset != handle.position() {
                            tracing::warn!(
                                id = %ctx.id,
                                expected = handle.position(),
                                got = c.offset,
                                "peer sent discontinuous bytes; dropping"
                            );
                            return StreamOutcome::Transient;
                        }
                        let len = c.bytes.len() as u64;
                        if let Err(e) = PartFile::append(handle, &c.bytes).await {
                            tracing::warn!(id = %ctx.id, error = %e, "append failed");
                            return StreamOutcome::Transient;
                        }
                        let confirmed = ctx.add_bytes(len);
                        if let Some(expected) = expected_size {
                            if confirmed >= expected {
                                return StreamOutcome::ReachedExpectedSize;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Backoff between searches, honoring cancellation. Returns `false` if
/// cancelled during the wait.
async fn backoff_or_interrupt(
    config: &RetryConfig,
    attempt: u32,
    cancel: &tokio_util::sync::CancellationToken,
) -> bool {
    let delay = backoff_delay(config, attempt);
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

