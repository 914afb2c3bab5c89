//! Journal (C1): the single source of truth for what must be resumed
//! after a crash.
//!
//! Backed by SQLite in WAL mode — the same store and connection setup the
//! teacher uses for its `downloads` table — so the durable layout the
//! design calls for (a `journal.db` file with a sibling WAL file, second
//! process fails to open) falls directly out of `SqliteJournalMode::Wal`.

mod migrations;
mod operations;

#[cfg(test)]
mod tests;

use crate::types::{IntentId, Kind};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::PathBuf;

/// The handler-specific payload carried in an intent's `state_blob`.
///
/// Kept as a typed enum rather than raw bytes — the boot recovery sweep
/// needs to deserialize it to decide what re-admission means, and the
/// `Download` variant is exactly the `{source_key, expected_size,
/// expected_digest?, confirmed_bytes, attempt_count}` shape from the data
/// model.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntentState {
    /// Streaming state for a `Kind::Download` intent.
    Download {
        /// Opaque key handed to `PeerTransport::search`.
        source_key: Vec<u8>,
        /// Total size if known.
        expected_size: Option<u64>,
        /// Content digest if known.
        expected_digest: Option<Vec<u8>>,
        /// Durable lower bound on bytes written to the PartFile.
        confirmed_bytes: u64,
        /// Number of in-session searches attempted (not persisted across
        /// `failure_count`; purely informational).
        attempt_count: u32,
    },
    /// Opaque payload for a `Kind::TagWrite` intent; this crate does not
    /// interpret it further than passing it back to the caller's handler.
    TagWrite {
        /// Handler-specific bytes.
        payload: Vec<u8>,
    },
}

impl IntentState {
    /// Durable lower bound on bytes written, or 0 for non-download intents.
    pub fn confirmed_bytes(&self) -> u64 {
        match self {
            IntentState::Download { confirmed_bytes, .. } => *confirmed_bytes,
            IntentState::TagWrite { .. } => 0,
        }
    }

    /// Expected total size, if known.
    pub fn expected_size(&self) -> Option<u64> {
        match self {
            IntentState::Download { expected_size, .. } => *expected_size,
            IntentState::TagWrite { .. } => None,
        }
    }
}

/// A durable journal row: the unit of work that survives crashes.
#[derive(Clone, Debug)]
pub struct Intent {
    /// Globally unique, caller-stable identifier.
    pub id: IntentId,
    /// Which handler drives this intent.
    pub kind: Kind,
    /// Absolute destination path (final name, not `.part`).
    pub target_path: PathBuf,
    /// Handler-specific resumption state.
    pub state: IntentState,
    /// `0..=9` Express, `10..=99` Standard, `>=100` Background.
    pub priority: u16,
    /// Count of recovery-time replay failures; crosses `max_failures`
    /// moves the row to the dead-letter sink.
    pub failure_count: u32,
    /// Monotonic-clock reading, relative to this process's start; only
    /// meaningful for comparisons made within the same process lifetime.
    pub last_heartbeat_ticks: i64,
    /// Wall-clock audit timestamp (unix seconds); never used for
    /// scheduling decisions.
    pub created_at: i64,
}

/// A dead-lettered row, evicted from `active` after crossing
/// `max_failures`.
#[derive(Clone, Debug)]
pub struct DeadLetter {
    /// The intent's original id.
    pub id: IntentId,
    /// Which handler drove this intent.
    pub kind: Kind,
    /// Absolute destination path.
    pub target_path: PathBuf,
    /// Resumption state as of dead-lettering.
    pub state: IntentState,
    /// Original priority.
    pub priority: u16,
    /// Failure count at the moment of dead-lettering (always `> max_failures`).
    pub failure_count: u32,
    /// Original wall-clock submit time.
    pub created_at: i64,
    /// Wall-clock time the row was evicted.
    pub dead_lettered_at: i64,
}

/// Outcome of [`Journal::bump_failure`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BumpFailureOutcome {
    /// The row remains active with the new failure count.
    StillActive(u32),
    /// The row crossed `max_failures` and was moved to `dead_letter`.
    DeadLettered(u32),
}

/// WAL-backed durable store of intents, heartbeats, and dead-letter
/// tracking.
///
/// All writes are serialized through the pool's single writer connection
/// (SQLite's own mutex semantics under WAL mode); reads proceed
/// concurrently. This mirrors the teacher's `Database` wrapping a single
/// `SqlitePool`.
#[derive(Clone)]
pub struct Journal {
    pool: SqlitePool,
    max_failures: u32,
    heartbeat_min_delta: u64,
    process_start: std::time::Instant,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("max_failures", &self.max_failures)
            .field("heartbeat_min_delta", &self.heartbeat_min_delta)
            .finish_non_exhaustive()
    }
}
