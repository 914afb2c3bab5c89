//! Per-intent runtime state: the lock-free byte counter, cancellation
//! signal, and finalizing flag that back one running [`DownloadContext`].
//!
//! None of this is durable — it is reconstructed from the Intent every
//! time an engine (re)starts, whether that's a fresh admission, a resume
//! after preemption, or a resume after a crash.

use crate::journal::Intent;
use crate::types::IntentId;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Runtime-only mirror of an in-flight `Download` Intent.
///
/// The byte counter is written by the transport callback path on every
/// received chunk (`fetch_add`, `Ordering::Relaxed`) and read by the
/// heartbeat timer (`load`, `Ordering::Acquire`) — writers never hold a
/// lock across I/O, matching the teacher's `downloaded_bytes: Arc<AtomicU64>`
/// progress-counter pattern in `background_tasks.rs`.
pub(crate) struct DownloadContext {
    pub(crate) id: IntentId,
    pub(crate) target_path: PathBuf,
    /// Durable lower bound as of the last successful heartbeat write,
    /// mirrored here so the heartbeat loop can compare against it without
    /// round-tripping through the Journal on every tick.
    pub(crate) last_written_bytes: AtomicU64,
    /// Bytes confirmed written to the PartFile so far this attempt.
    /// Always `>= last_written_bytes`.
    pub(crate) confirmed_bytes: AtomicU64,
    /// Set exactly once, by the Engine transitioning to `Finalizing`. Forms
    /// a happens-before edge (release here, acquire in the heartbeat loop)
    /// between "finalizing thread set flag" and "heartbeat observed flag
    /// set" — the re-entrancy guard the design mandates in §4.5/§4.6.
    pub(crate) finalizing: Arc<AtomicBool>,
    /// Cancelled by the `LaneScheduler` on explicit `cancel()` or on
    /// preemption; the Engine must be safely abortable at every I/O
    /// suspension point while this is live.
    pub(crate) cancel: CancellationToken,
}

impl DownloadContext {
    pub(crate) fn new(intent: &Intent, cancel: CancellationToken) -> Self {
        let confirmed = intent.state.confirmed_bytes();
        Self {
            id: intent.id,
            target_path: intent.target_path.clone(),
            last_written_bytes: AtomicU64::new(confirmed),
            confirmed_bytes: AtomicU64::new(confirmed),
            finalizing: Arc::new(AtomicBool::new(false)),
            cancel,
        }
    }

    /// Record bytes received from the transport. Called from the stream
    /// callback path; never blocks.
    pub(crate) fn add_bytes(&self, n: u64) -> u64 {
        self.confirmed_bytes.fetch_add(n, Ordering::Relaxed) + n
    }

    pub(crate) fn confirmed_bytes(&self) -> u64 {
        self.confirmed_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn set_confirmed_bytes(&self, value: u64) {
        self.confirmed_bytes.store(value, Ordering::Release);
    }

    /// `true` once `Finalizing` has been entered; heartbeats must stop.
    pub(crate) fn is_finalizing(&self) -> bool {
        self.finalizing.load(Ordering::Acquire)
    }

    pub(crate) fn set_finalizing(&self) {
        self.finalizing.store(true, Ordering::Release);
    }
}

/// Tracks an exponential moving average of throughput for
/// `DownloadProgressEvent::instant_rate`. Grounded in the teacher's
/// `speed_limiter.rs` throughput accounting, simplified from a token
/// bucket (which governs outbound pacing — out of scope here) down to a
/// plain read-only rate estimate.
pub(crate) struct RateTracker {
    last_bytes: u64,
    last_instant: Instant,
    ema_bps: f64,
}

/// Smoothing factor for the EMA: higher weights recent samples more.
const EMA_ALPHA: f64 = 0.3;

impl RateTracker {
    pub(crate) fn new(initial_bytes: u64) -> Self {
        Self {
            last_bytes: initial_bytes,
            last_instant: Instant::now(),
            ema_bps: 0.0,
        }
    }

    /// Fold in a new `confirmed_bytes` sample and return the updated
    /// instantaneous rate estimate, in bytes/sec.
    pub(crate) fn observe(&mut self, confirmed_bytes: u64) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_instant).as_secs_f64();
        let delta = confirmed_bytes.saturating_sub(self.last_bytes) as f64;

        if elapsed > 0.0 {
            let instant = delta / elapsed;
            self.ema_bps = EMA_ALPHA * instant + (1.0 - EMA_ALPHA) * self.ema_bps;
        }

        self.last_bytes = confirmed_bytes;
        self.last_instant = now;
        self.ema_bps
    }
}
