//! RetryPolicy (C3): pure decision functions for backoff, stall detection,
//! and the transient-vs-recovery-time-failure distinction.
//!
//! Nothing here touches the Journal or the Engine's state machine directly
//! — callers (the Engine, the boot recovery sweep) invoke these functions
//! and act on the result, keeping the policy testable in isolation.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter, capped at `config.max_backoff`.
///
/// `attempt` is the zero-based number of consecutive searches since the
/// last byte of progress (reset to 0 on any confirmed-byte increase, per
/// the design's "reset to base on any byte of progress" rule — callers
/// are responsible for resetting their own counter).
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = Duration::from_secs(1);
    let scaled = base.saturating_mul(1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX));
    let capped = scaled.min(config.max_backoff);
    add_jitter(capped)
}

/// Apply uniform jitter in `[delay, 2*delay]`, matching the teacher's
/// `add_jitter` — avoids a thundering herd of simultaneous re-searches
/// without ever delaying *less* than the computed backoff.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}

/// Tracks consecutive heartbeat intervals with no `confirmed_bytes`
/// progress, implementing the "4 consecutive heartbeat intervals
/// unchanged" stall rule (§4.3). One instance lives per `DownloadContext`.
#[derive(Debug)]
pub struct StallDetector {
    last_confirmed_bytes: u64,
    unchanged_intervals: u32,
    stall_threshold_intervals: u32,
}

impl StallDetector {
    /// Build a detector whose threshold is derived from the configured
    /// `stall_window` and `heartbeat_interval` (4 intervals at the
    /// defaults: 60s / 15s).
    pub fn new(config: &RetryConfig) -> Self {
        let interval_secs = config.heartbeat_interval.as_secs().max(1);
        let threshold = (config.stall_window.as_secs() / interval_secs).max(1) as u32;
        Self {
            last_confirmed_bytes: 0,
            unchanged_intervals: 0,
            stall_threshold_intervals: threshold,
        }
    }

    /// Record one heartbeat tick's `confirmed_bytes` value. Returns
    /// `true` once the stall threshold has been reached; the caller
    /// (Engine) is then responsible for dropping the peer and
    /// re-entering `Searching` — this is a transient failure, not a
    /// recovery-time one, so it never calls `bump_failure`.
    pub fn observe(&mut self, confirmed_bytes: u64) -> bool {
        if confirmed_bytes > self.last_confirmed_bytes {
            self.last_confirmed_bytes = confirmed_bytes;
            self.unchanged_intervals = 0;
            return false;
        }
        self.unchanged_intervals += 1;
        self.unchanged_intervals >= self.stall_threshold_intervals
    }

    /// Reset after a successful peer switch or resume.
    pub fn reset(&mut self, confirmed_bytes: u64) {
        self.last_confirmed_bytes = confirmed_bytes;
        self.unchanged_intervals = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_never_exceeds_twice_the_configured_cap() {
        let config = RetryConfig {
            max_backoff: Duration::from_secs(60),
            ..RetryConfig::default()
        };
        for attempt in 0..30 {
            let delay = backoff_delay(&config, attempt);
            assert!(
                delay <= Duration::from_secs(120),
                "attempt {attempt}: delay {delay:?} exceeded 2x cap"
            );
        }
    }

    #[test]
    fn backoff_delay_grows_with_attempt_before_capping() {
        let config = RetryConfig {
            max_backoff: Duration::from_secs(60),
            ..RetryConfig::default()
        };
        // Use the base (pre-jitter) magnitude by checking the floor: jitter only adds.
        let d0 = backoff_delay(&config, 0);
        let d5 = backoff_delay(&config, 5);
        // attempt 0 base is 1s (jittered to [1,2]s), attempt 5 base is 32s (jittered to [32,60]s: capped)
        assert!(d0 <= Duration::from_secs(2));
        assert!(d5 >= Duration::from_secs(32));
    }

    #[test]
    fn stall_detector_fires_after_four_unchanged_intervals_at_defaults() {
        let config = RetryConfig::default(); // 60s window / 15s interval = 4
        let mut detector = StallDetector::new(&config);
        assert_eq!(detector.stall_threshold_intervals, 4);

        detector.observe(1000); // progress, resets counter
        assert!(!detector.observe(1000)); // 1 unchanged
        assert!(!detector.observe(1000)); // 2 unchanged
        assert!(!detector.observe(1000)); // 3 unchanged
        assert!(detector.observe(1000)); // 4 unchanged -> stall
    }

    #[test]
    fn stall_detector_resets_on_any_progress() {
        let config = RetryConfig::default();
        let mut detector = StallDetector::new(&config);
        detector.observe(1000);
        assert!(!detector.observe(1000));
        assert!(!detector.observe(1000));
        assert!(!detector.observe(1001)); // progress resets
        assert!(!detector.observe(1001));
        assert!(!detector.observe(1001));
        assert!(!detector.observe(1001));
        assert!(detector.observe(1001));
    }

    #[test]
    fn stall_detector_reset_clears_counter() {
        let config = RetryConfig::default();
        let mut detector = StallDetector::new(&config);
        detector.observe(500);
        detector.observe(500);
        detector.observe(500);
        detector.reset(600);
        assert!(!detector.observe(600));
        assert!(!detector.observe(600));
        assert!(!detector.observe(600));
        assert!(detector.observe(600));
    }
}
