//! # resilient-download-orchestrator
//!
//! A crash-safe, priority-scheduled core for running many concurrent
//! byte-stream downloads against an unreliable peer source, with a
//! durable journal as the single source of truth across restarts.
//!
//! ## Design Philosophy
//!
//! - **Crash-safe by construction** — every Intent in flight is
//!   reconstructable from the journal; a process crash loses progress
//!   since the last heartbeat, never correctness.
//! - **Library-first** — no CLI, no server; a handle plus an event
//!   stream, meant to be embedded.
//! - **Event-driven** — consumers subscribe via [`Orchestrator::subscribe`];
//!   there is no polling surface.
//! - **Priority-aware** — three fixed lanes (Express/Standard/Background)
//!   with guaranteed minimums and Express-over-Background preemption.
//!
//! ## Quick Start
//!
//! ```no_run
//! use resilient_download_orchestrator::{Config, Orchestrator, SubmitRequest, Kind};
//! use std::sync::Arc;
//!
//! # struct MyTransport;
//! # #[async_trait::async_trait]
//! # impl resilient_download_orchestrator::PeerTransport for MyTransport {
//! #     async fn search(&self, _: &[u8]) -> Result<resilient_download_orchestrator::PeerLease, resilient_download_orchestrator::TransportError> { unimplemented!() }
//! #     async fn reserve(&self, _: &resilient_download_orchestrator::PeerLease) -> Result<(), resilient_download_orchestrator::TransportError> { unimplemented!() }
//! #     async fn stream(&self, _: &resilient_download_orchestrator::PeerLease, _: u64) -> Result<tokio::sync::mpsc::Receiver<Result<resilient_download_orchestrator::Chunk, resilient_download_orchestrator::TransportError>>, resilient_download_orchestrator::TransportError> { unimplemented!() }
//! #     async fn release(&self, _: resilient_download_orchestrator::PeerLease) {}
//! # }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let transport: Arc<dyn resilient_download_orchestrator::PeerTransport> = Arc::new(MyTransport);
//!     let orchestrator = Orchestrator::new(config, transport).await?;
//!
//!     let mut events = orchestrator.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("event: {:?}", event);
//!         }
//!     });
//!
//!     orchestrator.submit(SubmitRequest {
//!         id: None,
//!         kind: Kind::Download,
//!         target_path: "/downloads/file.bin".into(),
//!         priority: 10,
//!         source_key: b"nzb-message-id".to_vec(),
//!         expected_size: None,
//!         expected_digest: None,
//!     }).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Per-intent execution: the Searching/Downloading/Verifying/Finalizing
/// state machine. Internal to [`orchestrator`]; not part of the public API.
mod engine;
/// Error types
pub mod error;
/// Durable write-ahead journal
pub mod journal;
/// Multi-lane priority scheduler
pub mod lane_scheduler;
/// The public façade: wiring, recovery, and graceful shutdown
pub mod orchestrator;
/// Atomic, resumable part-file handling
pub mod partfile;
/// Backoff and stall detection
pub mod retry;
/// The `PeerTransport` capability consumers implement
pub mod transport;
/// Core types and events
pub mod types;

pub use config::{Config, EngineConfig, JournalConfig, RetryConfig, SchedulerConfig};
pub use error::{Error, Result, TransportError};
pub use journal::{DeadLetter, Intent, IntentState};
pub use orchestrator::Orchestrator;
pub use transport::{Chunk, PeerLease, PeerTransport, SharedTransport};
pub use types::{Event, FailureKind, IntentId, Kind, Lane, SubmitRequest};

/// Run `orchestrator` until a termination signal arrives, then shut it
/// down gracefully.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use resilient_download_orchestrator::{Config, Orchestrator, run_with_shutdown};
/// # use std::sync::Arc;
/// # struct MyTransport;
/// # #[async_trait::async_trait]
/// # impl resilient_download_orchestrator::PeerTransport for MyTransport {
/// #     async fn search(&self, _: &[u8]) -> Result<resilient_download_orchestrator::PeerLease, resilient_download_orchestrator::TransportError> { unimplemented!() }
/// #     async fn reserve(&self, _: &resilient_download_orchestrator::PeerLease) -> Result<(), resilient_download_orchestrator::TransportError> { unimplemented!() }
/// #     async fn stream(&self, _: &resilient_download_orchestrator::PeerLease, _: u64) -> Result<tokio::sync::mpsc::Receiver<Result<resilient_download_orchestrator::Chunk, resilient_download_orchestrator::TransportError>>, resilient_download_orchestrator::TransportError> { unimplemented!() }
/// #     async fn release(&self, _: resilient_download_orchestrator::PeerLease) {}
/// # }
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let transport: Arc<dyn resilient_download_orchestrator::PeerTransport> = Arc::new(MyTransport);
///     let orchestrator = Orchestrator::new(config, transport).await?;
///     run_with_shutdown(orchestrator).await;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(orchestrator: Orchestrator) {
    wait_for_signal().await;
    orchestrator.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM");
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("received SIGINT");
            } else {
                tracing::error!("could not register any signal handlers, falling back to ctrl_c");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("received SIGTERM");
            } else {
                tracing::error!("could not register any signal handlers, falling back to ctrl_c");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("received Ctrl+C");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
        }
    }
}
