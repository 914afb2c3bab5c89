//! Shared plumbing for the end-to-end suites: a fast-ticking `Config` so
//! scenarios that would take seconds or hours in production resolve in
//! milliseconds, plus a generic "wait for an event matching this
//! predicate" helper so each suite doesn't hand-roll its own recv loop.

use async_trait::async_trait;
use resilient_download_orchestrator::{Chunk, Config, Event, PeerLease, PeerTransport, TransportError};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// A `Config` tuned for fast, deterministic tests: short heartbeats, a
/// short scheduler tick, and a short shutdown grace. Every duration still
/// respects the production ordering (heartbeat < stall < backoff <
/// idle-timeout) so the Engine's internal logic exercises the same
/// decision paths it would at the defaults.
pub fn fast_config(database_path: std::path::PathBuf) -> Config {
    let mut config = Config::default();
    config.journal.database_path = database_path;
    config.scheduler.tick_interval = Duration::from_millis(20);
    config.retry.heartbeat_interval = Duration::from_millis(100);
    config.retry.heartbeat_min_delta = 1;
    config.retry.stall_window = Duration::from_millis(300);
    config.retry.max_backoff = Duration::from_millis(200);
    config.engine.peer_idle_timeout = Duration::from_secs(2);
    config.engine.attempt_wall_clock_cap = Duration::from_secs(30);
    config.engine.shutdown_grace = Duration::from_millis(300);
    config
}

/// Block until an event matching `pred` arrives, or panic after `timeout`.
/// Lagged subscribers just skip ahead; a closed channel is a hard failure
/// since it means the orchestrator's broadcast sink was dropped mid-test.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<Event>, timeout: Duration, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if pred(&event) {
                        return event;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event channel closed while waiting for expected event")
                }
            }
        }
    })
    .await
    .expect("timed out waiting for expected event")
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Like `transport::fake::FakeTransport` but paces delivery with a fixed
/// per-chunk delay, so a test can observe a download in flight (to
/// interrupt it, or to let a higher-priority one preempt it) instead of
/// racing a transfer that completes before the test can act.
pub struct SlowTransport {
    pub data: Vec<u8>,
    pub chunk_size: usize,
    pub delay: Duration,
}

#[async_trait]
impl PeerTransport for SlowTransport {
    async fn search(&self, _source_key: &[u8]) -> Result<PeerLease, TransportError> {
        Ok(PeerLease::new("slow-peer"))
    }

    async fn reserve(&self, _lease: &PeerLease) -> Result<(), TransportError> {
        Ok(())
    }

    async fn stream(
        &self,
        _lease: &PeerLease,
        resume_offset: u64,
    ) -> Result<mpsc::Receiver<Result<Chunk, TransportError>>, TransportError> {
        if resume_offset > self.data.len() as u64 {
            return Err(TransportError::Discontinuity);
        }
        let (tx, rx) = mpsc::channel(8);
        let data = self.data.clone();
        let chunk_size = self.chunk_size.max(1);
        let delay = self.delay;
        tokio::spawn(async move {
            let mut offset = resume_offset;
            while (offset as usize) < data.len() {
                tokio::time::sleep(delay).await;
                let end = (offset as usize + chunk_size).min(data.len());
                let bytes = data[offset as usize..end].to_vec();
                let len = bytes.len() as u64;
                if tx.send(Ok(Chunk { offset, bytes })).await.is_err() {
                    return;
                }
                offset += len;
            }
        });
        Ok(rx)
    }

    async fn release(&self, _lease: PeerLease) {}
}
