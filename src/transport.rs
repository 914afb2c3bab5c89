//! PeerTransport: the capability the Engine uses to locate and stream bytes
//! from whatever external source backs a `Kind::Download` intent.
//!
//! Kept as a trait object — the same shape as the teacher's
//! `ArticleProvider` — so the Engine's retry and resume logic can be
//! exercised in tests against a fake without touching real peers.

use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;

/// A reservation on a peer, scoped to a single attempt at one intent.
/// Releasing it (drop or explicit `release`) returns the peer slot to
/// whatever pool backs the transport.
pub struct PeerLease {
    peer_id: String,
}

impl PeerLease {
    /// Construct a lease wrapping an opaque peer identifier. Transport
    /// implementations build these; the Engine only reads `peer_id`.
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
        }
    }

    /// Opaque identifier surfaced in `DownloadFailed::last_peer_hint`.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

/// A chunk read from a reservation's byte stream.
pub struct Chunk {
    /// Offset this chunk starts at, relative to the full source.
    pub offset: u64,
    /// The bytes themselves.
    pub bytes: Vec<u8>,
}

/// Capability the Engine uses to find a source for an intent's
/// `source_key`, reserve a slot on it, and stream bytes from a given
/// resume offset.
///
/// Implementations own all environment-specific detail (connection
/// pooling, protocol framing, fallback between mirrors); the Engine only
/// ever sees this four-method surface.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Locate a peer that can serve `source_key`. Returns
    /// `TransportError::NotFound` if none currently can.
    async fn search(&self, source_key: &[u8]) -> Result<PeerLease, TransportError>;

    /// Reserve exclusive use of `lease` for one attempt. Implementations
    /// that pool connections acquire one here; implementations with no
    /// real concept of reservation may treat this as a no-op.
    async fn reserve(&self, lease: &PeerLease) -> Result<(), TransportError>;

    /// Stream bytes starting at `resume_offset`. The first `Chunk`
    /// returned MUST start exactly at `resume_offset`; a transport that
    /// cannot honor this returns `TransportError::Discontinuity` rather
    /// than silently skipping or repeating bytes.
    async fn stream(
        &self,
        lease: &PeerLease,
        resume_offset: u64,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<Chunk, TransportError>>, TransportError>;

    /// Release a reservation. Always safe to call; implementations that
    /// have nothing to release treat this as a no-op.
    async fn release(&self, lease: PeerLease);
}

/// Shared-ownership handle to a transport, as stored in the Engine's
/// per-intent context.
pub type SharedTransport = Arc<dyn PeerTransport>;

/// An in-memory `PeerTransport` for tests, gated behind the `test-util`
/// feature so integration tests (and consumers testing their own
/// `Orchestrator` wiring) can depend on it without pulling in a real peer
/// implementation.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use tokio::sync::mpsc;

    /// An in-memory transport for tests: serves a fixed byte buffer,
    /// optionally injecting a single disconnect at a configured offset.
    pub struct FakeTransport {
        pub data: Vec<u8>,
        pub chunk_size: usize,
        pub disconnect_after: Option<u64>,
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn search(&self, _source_key: &[u8]) -> Result<PeerLease, TransportError> {
            Ok(PeerLease::new("fake-peer-1"))
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
            let disconnect_after = self.disconnect_after;
            tokio::spawn(async move {
                let mut offset = resume_offset;
                while (offset as usize) < data.len() {
                    if let Some(cut) = disconnect_after {
                        if offset >= cut {
                            let _ = tx.send(Err(TransportError::Disconnected("fake cut".into()))).await;
                            return;
                        }
                    }
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

    #[tokio::test]
    async fn fake_transport_streams_from_resume_offset() {
        let transport = FakeTransport {
            data: (0u8..=255).collect(),
            chunk_size: 16,
            disconnect_after: None,
        };
        let lease = transport.search(b"key").await.expect("search");
        let mut rx = transport.stream(&lease, 100).await.expect("stream");
        let first = rx.recv().await.expect("chunk").expect("ok");
        assert_eq!(first.offset, 100);
        assert_eq!(first.bytes[0], 100);
    }

    #[tokio::test]
    async fn fake_transport_reports_discontinuity_past_end_of_data() {
        let transport = FakeTransport {
            data: vec![0u8; 10],
            chunk_size: 4,
            disconnect_after: None,
        };
        let lease = transport.search(b"key").await.expect("search");
        let err = transport.stream(&lease, 100).await.unwrap_err();
        assert!(matches!(err, TransportError::Discontinuity));
    }
}
