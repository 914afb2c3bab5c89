//! Configuration types for the resilient download orchestrator.
//!
//! Mirrors the tunables table in the design: each setting has a named
//! default function and is individually `#[serde(default = ...)]` so a
//! caller's partial config (e.g. just `pool_size`) still deserializes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for an [`Orchestrator`](crate::orchestrator::Orchestrator).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Durable journal storage settings.
    #[serde(default)]
    pub journal: JournalConfig,

    /// Lane scheduling and pool-size settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Retry, backoff, and stall-detection settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-download engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            journal: JournalConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

/// Durable journal storage configuration (C1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Path to the journal's SQLite file (default: `"journal.db"`).
    ///
    /// Opened in WAL mode; a sibling `<database_path>-wal` file is
    /// produced by SQLite itself.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Dead-letter threshold (default: 3). Beyond this, `bump_failure`
    /// moves the row out of `active` into `dead_letter`.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// How long a write acquisition may wait for the SQLite write lock
    /// before failing (default: 5s).
    #[serde(default = "default_busy_timeout", with = "duration_secs")]
    pub busy_timeout: Duration,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_failures: default_max_failures(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

/// Lane scheduling configuration (C4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Total concurrent executions across all lanes (default: 4).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How often the background ticker calls `tick()` to catch priority
    /// upsert races (default: 1s).
    #[serde(default = "default_tick_interval", with = "duration_secs")]
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            tick_interval: default_tick_interval(),
        }
    }
}

/// Retry, backoff, and stall-detection configuration (C3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Cadence of journal heartbeats (default: 15s).
    #[serde(default = "default_heartbeat_interval", with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Byte threshold below which a heartbeat write is suppressed
    /// (default: 1 KiB).
    #[serde(default = "default_heartbeat_min_delta")]
    pub heartbeat_min_delta: u64,

    /// Idle time with no byte progress before a stall transition
    /// (default: 60s — four heartbeat intervals at the default cadence).
    #[serde(default = "default_stall_window", with = "duration_secs")]
    pub stall_window: Duration,

    /// Exponential backoff cap between searches (default: 60s).
    #[serde(default = "default_max_backoff", with = "duration_secs")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_min_delta: default_heartbeat_min_delta(),
            stall_window: default_stall_window(),
            max_backoff: default_max_backoff(),
        }
    }
}

/// Per-download engine configuration (C5) and shutdown behavior (C6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-peer read inactivity timeout (default: 30s).
    #[serde(default = "default_peer_idle_timeout", with = "duration_secs")]
    pub peer_idle_timeout: Duration,

    /// Overall per-attempt wall-clock cap, treated as transient on
    /// expiry with a forced 60s backoff (default: 24h).
    #[serde(default = "default_attempt_wall_clock_cap", with = "duration_secs")]
    pub attempt_wall_clock_cap: Duration,

    /// How long graceful shutdown waits for finalizing intents before
    /// giving up and leaving them to resume on next boot (default: 5s).
    #[serde(default = "default_shutdown_grace", with = "duration_secs")]
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            peer_idle_timeout: default_peer_idle_timeout(),
            attempt_wall_clock_cap: default_attempt_wall_clock_cap(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("journal.db")
}

fn default_max_failures() -> u32 {
    3
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_pool_size() -> usize {
    4
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_heartbeat_min_delta() -> u64 {
    1024
}

fn default_stall_window() -> Duration {
    Duration::from_secs(60)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_peer_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_attempt_wall_clock_cap() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tunables_table() {
        let cfg = Config::default();
        assert_eq!(cfg.scheduler.pool_size, 4);
        assert_eq!(cfg.retry.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(cfg.retry.heartbeat_min_delta, 1024);
        assert_eq!(cfg.retry.stall_window, Duration::from_secs(60));
        assert_eq!(cfg.journal.max_failures, 3);
        assert_eq!(cfg.engine.peer_idle_timeout, Duration::from_secs(30));
        assert_eq!(cfg.engine.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn config_default_survives_json_round_trip() {
        let original = Config::default();
        let json = serde_json::to_string(&original).expect("serialize");
        let restored: Config = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored.scheduler.pool_size, original.scheduler.pool_size);
        assert_eq!(
            restored.retry.heartbeat_interval,
            original.retry.heartbeat_interval
        );
        assert_eq!(
            restored.journal.database_path,
            original.journal.database_path
        );
    }

    #[test]
    fn partial_json_fills_in_remaining_defaults() {
        let json = r#"{"scheduler":{"pool_size":8}}"#;
        let cfg: Config = serde_json::from_str(json).expect("deserialize");
        assert_eq!(cfg.scheduler.pool_size, 8);
        assert_eq!(cfg.retry.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(cfg.journal.max_failures, 3);
    }

    #[test]
    fn duration_secs_serializes_as_integer_seconds() {
        let cfg = RetryConfig::default();
        let json = serde_json::to_value(&cfg).expect("serialize");
        assert_eq!(json["heartbeat_interval"], 15);
        assert_eq!(json["stall_window"], 60);
    }
}
