//! Orchestrator (C6): the public façade wiring the Journal, LaneScheduler,
//! and DownloadEngine into one crash-safe whole.
//!
//! Mirrors the teacher's `UsenetDownloader` — a handle holding the shared
//! subsystems, a broadcast event sink consumers subscribe to, and a
//! background task per ambient concern (here: the grant-consumer loop and
//! the scheduler's periodic tick) — generalized from NZB-specific
//! lifecycle methods to the Intent-shaped submit/cancel/pause surface.

mod recovery;
mod shutdown;

use crate::config::Config;
use crate::engine;
use crate::error::{Error, Result};
use crate::journal::{BumpFailureOutcome, Intent, IntentState, Journal};
use crate::lane_scheduler::{LaneScheduler, QueuedIntent, ReleaseReason};
use crate::partfile::PartFile;
use crate::transport::SharedTransport;
use crate::types::{Event, FailureKind, IntentId, Kind, SubmitRequest};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bookkeeping for one currently-running grant, kept so `shutdown` can
/// signal every in-flight Engine and wait for it to stop.
struct ActiveTask {
    cancel: CancellationToken,
}

/// Handle to the running orchestrator. Cheap to hold by reference; the
/// subsystems it wraps (`Journal`, `Arc<LaneScheduler>`, `SharedTransport`)
/// are themselves cheaply cloneable, matching how the teacher passes its
/// `Arc<Database>` and `Arc<QueueState>` around `background_tasks.rs`.
pub struct Orchestrator {
    journal: Journal,
    scheduler: Arc<LaneScheduler>,
    event_tx: broadcast::Sender<Event>,
    config: Config,
    active: Arc<Mutex<HashMap<IntentId, ActiveTask>>>,
    cancelled_by_user: Arc<Mutex<HashSet<IntentId>>>,
    grant_loop: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

impl Orchestrator {
    /// Open the journal at `config.journal.database_path`, run the boot
    /// recovery sweep (§4.6.2), and start accepting work.
    pub async fn new(config: Config, transport: SharedTransport) -> Result<Self> {
        let journal = Journal::open(&config.journal, &config.retry).await?;
        let (scheduler, grants) = LaneScheduler::new(&config.scheduler);
        let scheduler = Arc::new(scheduler);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let report = recovery::sweep(&journal, &scheduler, &event_tx).await?;
        if report.restored_count > 0 {
            let _ = event_tx.send(Event::RecoveryCompleted {
                restored_count: report.restored_count,
            });
        }
        tracing::info!(
            restored = report.restored_count,
            already_completed = report.already_completed,
            dead_lettered = report.dead_lettered,
            "boot recovery sweep complete"
        );

        let active = Arc::new(Mutex::new(HashMap::new()));
        let cancelled_by_user = Arc::new(Mutex::new(HashSet::new()));

        let grant_loop = tokio::spawn(run_grant_loop(
            grants,
            journal.clone(),
            scheduler.clone(),
            transport,
            event_tx.clone(),
            config.retry.clone(),
            config.engine.clone(),
            active.clone(),
            cancelled_by_user.clone(),
        ));

        let ticker = {
            let scheduler = scheduler.clone();
            let interval = config.scheduler.tick_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    scheduler.tick().await;
                }
            })
        };

        Ok(Self {
            journal,
            scheduler,
            event_tx,
            config,
            active,
            cancelled_by_user,
            grant_loop,
            ticker,
        })
    }

    /// Submit (or re-submit) an intent. Re-submitting an id already in the
    /// journal is an upsert: `target_path`, priority, and source
    /// parameters are replaced, `failure_count`/`created_at` and any
    /// in-flight `confirmed_bytes` are preserved (§9 open question 1 — a
    /// priority bump on a running download takes effect the next time it
    /// is queued, it does not restart the transfer).
    ///
    /// A second `submit` against an id currently dead-lettered is
    /// rejected with [`Error::DeadLettered`] — this crate's chosen
    /// resolution of §9 open question 2's "accept or reject" fork.
    /// `reset_dead_letter` must be called first.
    pub async fn submit(&self, req: SubmitRequest) -> Result<IntentId> {
        let id = req.id.unwrap_or_default();

        if let Some(dead) = self.journal.get_dead_letter(id).await? {
            return Err(Error::DeadLettered {
                id,
                failure_count: dead.failure_count,
            });
        }

        let existing = self.journal.get(id).await?;
        let (failure_count, created_at, confirmed_bytes) = match &existing {
            Some(row) => (row.failure_count, row.created_at, row.state.confirmed_bytes()),
            None => (0, chrono::Utc::now().timestamp(), 0),
        };

        let state = match req.kind {
            Kind::Download => IntentState::Download {
                source_key: req.source_key,
                expected_size: req.expected_size,
                expected_digest: req.expected_digest,
                confirmed_bytes,
                attempt_count: 0,
            },
            Kind::TagWrite => IntentState::TagWrite {
                payload: req.source_key,
            },
        };

        let intent = Intent {
            id,
            kind: req.kind,
            target_path: req.target_path,
            state,
            priority: req.priority,
            failure_count,
            last_heartbeat_ticks: 0,
            created_at,
        };

        self.journal.put(&intent).await?;
        self.cancelled_by_user.lock().await.remove(&id);

        // TagWrite has no built-in engine (§1); it is left in the Journal
        // for an external handler and never reaches the LaneScheduler.
        if req.kind == Kind::Download {
            self.scheduler
                .submit(QueuedIntent {
                    id,
                    priority: req.priority,
                    created_at,
                })
                .await;
        }

        Ok(id)
    }

    /// Cancel an intent, queued or running. Returns `true` if it was
    /// found in either place (or as a bare durable row, e.g. a
    /// `TagWrite`). A running Engine is signalled and, once the
    /// grant-consumer loop observes the interruption, has its Journal row
    /// and `.part` file deleted; a queued or not-yet-admitted intent has
    /// both deleted immediately.
    pub async fn cancel(&self, id: IntentId) -> Result<bool> {
        self.cancelled_by_user.lock().await.insert(id);
        let found_in_scheduler = self.scheduler.cancel(id).await;
        let row = self.journal.get(id).await?;

        if let Some(row) = &row {
            self.journal.commit(id).await?;
            if !self.active.lock().await.contains_key(&id) {
                // No running Engine holds this PartFile; safe to delete now.
                PartFile::delete(&row.target_path).await?;
            }
        }

        if !self.active.lock().await.contains_key(&id) {
            // Nothing left to observe the cancellation later and clean
            // this flag up.
            self.cancelled_by_user.lock().await.remove(&id);
        }

        Ok(found_in_scheduler || row.is_some())
    }

    /// Stop admitting new work; running Engines continue.
    pub async fn pause_all(&self) {
        self.scheduler.pause_all().await;
    }

    /// Resume admission.
    pub async fn resume_all(&self) {
        self.scheduler.resume_all().await;
    }

    /// Restore a dead-lettered intent to `active` with a fresh failure
    /// count, then re-admit it if it is a `Download`. Returns `true` if a
    /// row was found (active or dead-lettered).
    pub async fn reset_dead_letter(&self, id: IntentId) -> Result<bool> {
        let found = self.journal.reset_failure(id).await?;
        if !found {
            return Ok(false);
        }
        if let Some(intent) = self.journal.get(id).await? {
            if intent.kind == Kind::Download {
                self.scheduler
                    .submit(QueuedIntent {
                        id,
                        priority: intent.priority,
                        created_at: intent.created_at,
                    })
                    .await;
            }
        }
        Ok(true)
    }

    /// Subscribe to the event stream. Each subscriber gets its own lagged
    /// `Receiver`; the core keeps no record of who is listening.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Current configuration, as opened.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_grant_loop(
    mut grants: tokio::sync::mpsc::Receiver<crate::lane_scheduler::Grant>,
    journal: Journal,
    scheduler: Arc<LaneScheduler>,
    transport: SharedTransport,
    event_tx: broadcast::Sender<Event>,
    retry_config: crate::config::RetryConfig,
    engine_config: crate::config::EngineConfig,
    active: Arc<Mutex<HashMap<IntentId, ActiveTask>>>,
    cancelled_by_user: Arc<Mutex<HashSet<IntentId>>>,
) {
    while let Some(grant) = grants.recv().await {
        let id = grant.id;
        active.lock().await.insert(
            id,
            ActiveTask {
                cancel: grant.cancel.clone(),
            },
        );

        let journal = journal.clone();
        let scheduler = scheduler.clone();
        let transport = transport.clone();
        let event_tx = event_tx.clone();
        let retry_config = retry_config.clone();
        let engine_config = engine_config.clone();
        let active = active.clone();
        let cancelled_by_user = cancelled_by_user.clone();

        tokio::spawn(async move {
            run_one_grant(
                grant.cancel,
                id,
                journal,
                &scheduler,
                transport,
                &event_tx,
                retry_config,
                engine_config,
                cancelled_by_user,
            )
            .await;
            active.lock().await.remove(&id);
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_grant(
    cancel: CancellationToken,
    id: IntentId,
    journal: Journal,
    scheduler: &LaneScheduler,
    transport: SharedTransport,
    event_tx: &broadcast::Sender<Event>,
    retry_config: crate::config::RetryConfig,
    engine_config: crate::config::EngineConfig,
    cancelled_by_user: Arc<Mutex<HashSet<IntentId>>>,
) {
    let Some(intent) = journal.get(id).await.unwrap_or_default() else {
        // Cancelled between admission and the Engine picking it up; the
        // row is already gone.
        scheduler.release(id, ReleaseReason::Done, None).await;
        return;
    };

    let priority = intent.priority;
    let created_at = intent.created_at;
    let target_path = intent.target_path.clone();

    let outcome = engine::execute(
        journal.clone(),
        transport,
        event_tx.clone(),
        retry_config,
        engine_config,
        intent,
        cancel,
    )
    .await;

    use engine::EngineOutcome;
    match outcome {
        EngineOutcome::Completed => {
            scheduler.release(id, ReleaseReason::Done, None).await;
        }
        EngineOutcome::Preempted { resume_bytes } => {
            let was_user_cancel = cancelled_by_user.lock().await.remove(&id);
            if was_user_cancel {
                if let Err(e) = journal.commit(id).await {
                    tracing::error!(id = %id, error = %e, "failed to clear cancelled intent");
                }
                if let Err(e) = PartFile::delete(&target_path).await {
                    tracing::warn!(id = %id, error = %e, "failed to delete part file for cancelled intent");
                }
                scheduler.release(id, ReleaseReason::Done, None).await;
                return;
            }

            if let Err(e) = journal.heartbeat(id, resume_bytes).await {
                tracing::warn!(id = %id, error = %e, "failed to persist resume point after preemption");
            }
            let requeue = QueuedIntent {
                id,
                priority,
                created_at,
            };
            scheduler
                .release(id, ReleaseReason::Preempted, Some(requeue))
                .await;
        }
        EngineOutcome::Permanent { reason } => {
            tracing::warn!(id = %id, reason = %reason, "intent failed permanently this attempt");
            let _ = event_tx.send(Event::DownloadFailed {
                id,
                kind: FailureKind::Permanent,
                last_peer_hint: None,
            });

            match journal.bump_failure(id).await {
                Ok(BumpFailureOutcome::DeadLettered(failure_count)) => {
                    let _ = event_tx.send(Event::IntentDeadLettered { id, failure_count });
                }
                Ok(BumpFailureOutcome::StillActive(_)) => {
                    scheduler
                        .submit(QueuedIntent {
                            id,
                            priority,
                            created_at,
                        })
                        .await;
                }
                Err(e) => {
                    tracing::error!(id = %id, error = %e, "bump_failure failed after permanent error");
                }
            }
            scheduler.release(id, ReleaseReason::Done, None).await;
        }
    }
}
