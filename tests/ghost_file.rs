//! S3: the `.part` file already holds the full expected content -- a
//! prior process wrote every byte and crashed before the commit rename
//! and journal commit landed. The Engine must verify the digest and
//! finalize directly, never re-touching the transport.

mod common;

use async_trait::async_trait;
use resilient_download_orchestrator::{
    Chunk, Event, Kind, Orchestrator, PeerLease, PeerTransport, SubmitRequest, TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A transport that fails loudly if it is ever called. A correct Ghost
/// File handshake never reaches `PeerTransport` at all.
struct PoisonTransport;

#[async_trait]
impl PeerTransport for PoisonTransport {
    async fn search(&self, _source_key: &[u8]) -> Result<PeerLease, TransportError> {
        Err(TransportError::Permanent(
            "a ghost file resume must never call the transport".into(),
        ))
    }

    async fn reserve(&self, _lease: &PeerLease) -> Result<(), TransportError> {
        Err(TransportError::Permanent(
            "a ghost file resume must never call the transport".into(),
        ))
    }

    async fn stream(
        &self,
        _lease: &PeerLease,
        _resume_offset: u64,
    ) -> Result<mpsc::Receiver<Result<Chunk, TransportError>>, TransportError> {
        Err(TransportError::Permanent(
            "a ghost file resume must never call the transport".into(),
        ))
    }

    async fn release(&self, _lease: PeerLease) {}
}

#[tokio::test]
async fn ghost_part_file_with_matching_digest_finalizes_without_touching_transport() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("cover.jpg");
    let data: Vec<u8> = (0u32..300_000).map(|n| ((n * 7) % 256) as u8).collect();
    let digest = common::sha256(&data);

    let mut part = target.clone().into_os_string();
    part.push(".part");
    let part = std::path::PathBuf::from(part);
    tokio::fs::write(&part, &data).await.expect("seed ghost part file");

    let config = common::fast_config(dir.path().join("journal.db"));
    let orchestrator = Orchestrator::new(config, Arc::new(PoisonTransport))
        .await
        .expect("open orchestrator");
    let mut events = orchestrator.subscribe();

    let id = orchestrator
        .submit(SubmitRequest {
            id: None,
            kind: Kind::Download,
            target_path: target.clone(),
            priority: 10,
            source_key: b"cover-art".to_vec(),
            expected_size: Some(data.len() as u64),
            expected_digest: Some(digest),
        })
        .await
        .expect("submit");

    let completed = common::wait_for(&mut events, Duration::from_secs(5), |e| {
        matches!(e, Event::DownloadCompleted { id: completed_id, .. } if *completed_id == id)
    })
    .await;
    let Event::DownloadCompleted { target_path, .. } = completed else {
        unreachable!()
    };
    assert_eq!(target_path, target);

    assert!(target.exists());
    assert!(!part.exists());
    let contents = tokio::fs::read(&target).await.expect("read target");
    assert_eq!(contents, data);

    orchestrator.shutdown().await;
}
