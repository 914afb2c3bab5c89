//! Core domain types: intent identifiers, kinds, lanes, and the public
//! submit/event shapes consumers see.

use serde::{Deserialize, Serialize};
use sqlx::Decode;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::sqlite::{Sqlite, SqliteArgumentValue, SqliteValueRef};
use std::fmt;
use uuid::Uuid;

/// Opaque, globally unique identifier for a durable [`Intent`](crate::journal::Intent).
///
/// Caller-assigned so retries across process boundaries can share an id;
/// the orchestrator mints a fresh one via [`IntentId::new`] when a
/// `SubmitRequest.id` is `None`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntentId(pub Uuid);

impl IntentId {
    /// Mint a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IntentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntentId({})", self.0)
    }
}

impl sqlx::Type<Sqlite> for IntentId {
    fn type_info() -> <Sqlite as sqlx::Database>::TypeInfo {
        <String as sqlx::Type<Sqlite>>::type_info()
    }
}

impl<'q> sqlx::Encode<'q, Sqlite> for IntentId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<SqliteArgumentValue<'q>>,
    ) -> Result<IsNull, BoxDynError> {
        buf.push(SqliteArgumentValue::Text(self.0.to_string().into()));
        Ok(IsNull::No)
    }
}

impl<'r> Decode<'r, Sqlite> for IntentId {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as Decode<Sqlite>>::decode(value)?;
        Ok(IntentId(Uuid::parse_str(s)?))
    }
}

/// The two intent handlers sharing the journal and recovery discipline.
///
/// `Download` is fully implemented by this crate. `TagWrite` is accepted
/// by the Journal and boot sweep (it shares the same recovery path) but
/// carries no engine of its own here — tag-writing is a downstream
/// consumer of `DownloadCompletedEvent`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// Stream bytes from a peer source into a target file.
    Download,
    /// Write metadata tags to an already-materialized file.
    TagWrite,
}

impl Kind {
    /// Encode for storage.
    pub fn to_i32(self) -> i32 {
        match self {
            Kind::Download => 0,
            Kind::TagWrite => 1,
        }
    }

    /// Decode from storage; an unrecognized value defaults to `Download`,
    /// the safer of the two to re-admit (it carries its own size/digest
    /// verification, `TagWrite` does not).
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Kind::TagWrite,
            _ => Kind::Download,
        }
    }
}

/// Priority lane an intent belongs to, derived from its numeric priority.
///
/// `0..=9` is Express, `10..=99` Standard, anything else Background.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Highest urgency, can preempt Background.
    Express,
    /// Default lane.
    Standard,
    /// Lowest urgency, preemptible.
    Background,
}

impl Lane {
    /// Derive the lane from a raw priority value.
    pub fn from_priority(priority: u16) -> Self {
        match priority {
            0..=9 => Lane::Express,
            10..=99 => Lane::Standard,
            _ => Lane::Background,
        }
    }

    /// Rank used for admission/tie-break ordering; lower is more urgent.
    pub fn rank(self) -> u8 {
        match self {
            Lane::Express => 0,
            Lane::Standard => 1,
            Lane::Background => 2,
        }
    }
}

/// Request payload accepted by `Orchestrator::submit`.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    /// Caller-assigned id; `None` mints a fresh one.
    pub id: Option<IntentId>,
    /// Which handler drives this intent.
    pub kind: Kind,
    /// Absolute destination path (final name, not `.part`).
    pub target_path: std::path::PathBuf,
    /// `0..=9` Express, `10..=99` Standard, `>=100` Background.
    pub priority: u16,
    /// Opaque bytes handed to `PeerTransport::search`.
    pub source_key: Vec<u8>,
    /// Total size if known up front.
    pub expected_size: Option<u64>,
    /// Content digest (e.g. SHA-256) if known up front.
    pub expected_digest: Option<Vec<u8>>,
}

/// Classification of a terminal or transient failure, surfaced to
/// consumers via [`Event::DownloadFailed`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retried in-session, no journal failure increment.
    Transient,
    /// A boot-time replay failed before new progress; counts toward dead-letter.
    RecoverableAtBoot,
    /// Invariant violation or environment precondition failed; not retried.
    Permanent,
    /// The intent has been dead-lettered; requires `reset_dead_letter`.
    Poisoned,
}

/// Events published by the Orchestrator's broadcast sink. Consumers
/// subscribe via `Orchestrator::subscribe` and own their copy after
/// delivery — the core keeps no reference.
#[derive(Clone, Debug)]
pub enum Event {
    /// Emitted on each heartbeat write; consumers may throttle.
    DownloadProgress {
        /// Which intent progressed.
        id: IntentId,
        /// Durable confirmed byte count as of this heartbeat.
        confirmed_bytes: u64,
        /// Instantaneous bytes/sec estimate (EMA).
        instant_rate: f64,
    },
    /// Emitted exactly once per successfully completed intent.
    DownloadCompleted {
        /// Which intent completed.
        id: IntentId,
        /// Final destination path.
        target_path: std::path::PathBuf,
    },
    /// Emitted on a terminal transient failure reported to the caller
    /// (rare — usually the intent is cancelled or dead-lettered instead).
    DownloadFailed {
        /// Which intent failed.
        id: IntentId,
        /// Why.
        kind: FailureKind,
        /// Best-effort hint about the last peer involved, if any.
        last_peer_hint: Option<String>,
    },
    /// Emitted when a row crosses the dead-letter threshold.
    IntentDeadLettered {
        /// Which intent was dead-lettered.
        id: IntentId,
        /// The failure count that crossed the threshold.
        failure_count: u32,
    },
    /// Emitted at most once per process start, only if `restored_count > 0`.
    RecoveryCompleted {
        /// Number of rows the boot sweep acted on.
        restored_count: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_from_priority_boundaries() {
        assert_eq!(Lane::from_priority(0), Lane::Express);
        assert_eq!(Lane::from_priority(9), Lane::Express);
        assert_eq!(Lane::from_priority(10), Lane::Standard);
        assert_eq!(Lane::from_priority(99), Lane::Standard);
        assert_eq!(Lane::from_priority(100), Lane::Background);
        assert_eq!(Lane::from_priority(u16::MAX), Lane::Background);
    }

    #[test]
    fn lane_rank_orders_express_first() {
        assert!(Lane::Express.rank() < Lane::Standard.rank());
        assert!(Lane::Standard.rank() < Lane::Background.rank());
    }

    #[test]
    fn kind_round_trips_through_i32() {
        assert_eq!(Kind::from_i32(Kind::Download.to_i32()), Kind::Download);
        assert_eq!(Kind::from_i32(Kind::TagWrite.to_i32()), Kind::TagWrite);
    }

    #[test]
    fn kind_from_unknown_integer_defaults_to_download() {
        assert_eq!(Kind::from_i32(99), Kind::Download);
        assert_eq!(Kind::from_i32(-1), Kind::Download);
    }

    #[test]
    fn intent_id_new_is_random() {
        assert_ne!(IntentId::new(), IntentId::new());
    }

    #[test]
    fn intent_id_display_matches_uuid() {
        let id = IntentId::new();
        assert_eq!(id.to_string(), id.0.to_string());
    }
}
