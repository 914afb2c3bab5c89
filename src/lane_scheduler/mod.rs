//! LaneScheduler (C4): admits Intents into a fixed-size execution pool
//! under a three-lane priority policy with guaranteed minimums,
//! opportunistic maximums, and Express-over-Background preemption.
//!
//! Structurally this is the teacher's `QueueState` (a guarded queue plus a
//! concurrency limiter plus an active-downloads cancellation map) split
//! into one queue per lane and generalized from a single semaphore into
//! per-lane running counts checked against per-lane budgets.

mod admission;


use crate::config::SchedulerConfig;
use crate::types::{IntentId, Lane};
use std::collections::{BinaryHeap, HashMap, HashSet};
use tokio_util::sync::CancellationToken;

/// One lane's admission budget, derived from `pool_size` per the tunables
/// table: Express min 2/max N, Standard min 1/max N-1, Background min
/// 0/max max(1, N/2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaneBudget {
    /// Guaranteed slots this lane is entitled to before lower-priority
    /// lanes may claim opportunistic capacity. Not currently consulted by
    /// admission (Express-first ordering already satisfies it) but kept
    /// for introspection and tests.
    pub min: usize,
    /// Ceiling on slots this lane may occupy concurrently.
    pub max: usize,
}

fn budgets_for(pool_size: usize) -> HashMap<Lane, LaneBudget> {
    let mut map = HashMap::with_capacity(3);
    map.insert(
        Lane::Express,
        LaneBudget {
            min: 2,
            max: pool_size,
        },
    );
    map.insert(
        Lane::Standard,
        LaneBudget {
            min: 1,
            max: pool_size.saturating_sub(1).max(1),
        },
    );
    map.insert(
        Lane::Background,
        LaneBudget {
            min: 0,
            max: (pool_size / 2).max(1),
        },
    );
    map
}

/// An Intent waiting for admission, ordered for a per-lane `BinaryHeap`.
///
/// `BinaryHeap` is a max-heap; `Ord` is implemented so the item that
/// should run *next* compares greatest — lower `priority` value wins,
/// ties broken by earlier `created_at` — mirroring the teacher's
/// `QueuedDownload` ordering with the priority direction inverted (here,
/// numerically lower priority is more urgent).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedIntent {
    /// The intent's identifier.
    pub id: IntentId,
    /// Raw priority value (determines both lane and in-lane order).
    pub priority: u16,
    /// Wall-clock submit time, used only for FIFO tie-breaking.
    pub created_at: i64,
}

impl Ord for QueuedIntent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match other.priority.cmp(&self.priority) {
            std::cmp::Ordering::Equal => other.created_at.cmp(&self.created_at),
            ordering => ordering,
        }
    }
}

impl PartialOrd for QueuedIntent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Why a running slot was released, as reported by the Engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The intent finished (successfully or not) and will not be requeued.
    Done,
    /// The scheduler cancelled this slot for a higher-priority arrival;
    /// the intent returns to the head of its lane's queue.
    Preempted,
}

/// A grant of one execution slot, delivered to whatever spawns the Engine.
#[derive(Debug)]
pub struct Grant {
    /// The admitted intent.
    pub id: IntentId,
    /// The lane it was admitted from.
    pub lane: Lane,
    /// Cancellation token the Engine must honor — cancelled on
    /// preemption or on an explicit `cancel()`.
    pub cancel: CancellationToken,
}

struct RunningSlot {
    lane: Lane,
    cancel: CancellationToken,
}

struct Inner {
    queues: HashMap<Lane, BinaryHeap<QueuedIntent>>,
    running: HashMap<IntentId, RunningSlot>,
    running_count: HashMap<Lane, usize>,
    pending_preemption: HashSet<IntentId>,
    budgets: HashMap<Lane, LaneBudget>,
    pool_size: usize,
    paused: bool,
}

impl Inner {
    fn new(config: &SchedulerConfig) -> Self {
        let mut queues = HashMap::with_capacity(3);
        queues.insert(Lane::Express, BinaryHeap::new());
        queues.insert(Lane::Standard, BinaryHeap::new());
        queues.insert(Lane::Background, BinaryHeap::new());

        let mut running_count = HashMap::with_capacity(3);
        running_count.insert(Lane::Express, 0);
        running_count.insert(Lane::Standard, 0);
        running_count.insert(Lane::Background, 0);

        Self {
            queues,
            running: HashMap::new(),
            running_count,
            pending_preemption: HashSet::new(),
            budgets: budgets_for(config.pool_size),
            pool_size: config.pool_size,
            paused: false,
        }
    }

    fn total_running(&self) -> usize {
        self.running_count.values().sum()
    }
}

/// Guards `Inner` with a `tokio::sync::Mutex`, matching the teacher's
/// single-lock-per-subsystem convention (`queue_state.queue`).
pub struct LaneScheduler {
    inner: tokio::sync::Mutex<Inner>,
    grants: tokio::sync::mpsc::Sender<Grant>,
}

impl std::fmt::Debug for LaneScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneScheduler").finish_non_exhaustive()
    }
}

impl LaneScheduler {
    /// Build a scheduler and its grant channel. Callers poll `grants` to
    /// learn when to spawn the Engine for a newly admitted intent.
    pub fn new(config: &SchedulerConfig) -> (Self, tokio::sync::mpsc::Receiver<Grant>) {
        let (tx, rx) = tokio::sync::mpsc::channel(config.pool_size.max(1) * 2);
        (
            Self {
                inner: tokio::sync::Mutex::new(Inner::new(config)),
                grants: tx,
            },
            rx,
        )
    }

    /// Enqueue an intent for admission. Idempotent on `id`: re-submitting
    /// an id already queued or running with a new priority moves it
    /// between lanes via an upsert (remove-then-reinsert), which the
    /// caller performs by calling `cancel` and `submit` in sequence if it
    /// needs to change a *running* intent's lane; for queued intents this
    /// method alone is correct, matching `submit`'s documented idempotency.
    pub async fn submit(&self, item: QueuedIntent) {
        let mut inner = self.inner.lock().await;
        if inner.running.contains_key(&item.id) {
            // Already holding a slot; the new priority takes effect the
            // next time this id is queued (after release or preemption).
            drop(inner);
            return;
        }
        let lane = Lane::from_priority(item.priority);
        if let Some(queue) = inner.queues.get_mut(&lane) {
            queue.retain(|existing| existing.id != item.id);
            queue.push(item);
        }
        drop(inner);
        self.tick().await;
    }

    /// Remove a queued intent, or signal a running one to abort.
    /// Returns `true` if the intent was found in either state.
    pub async fn cancel(&self, id: IntentId) -> bool {
        let mut inner = self.inner.lock().await;
        for queue in inner.queues.values_mut() {
            let before = queue.len();
            queue.retain(|q| q.id != id);
            if queue.len() != before {
                return true;
            }
        }
        if let Some(slot) = inner.running.get(&id) {
            slot.cancel.cancel();
            return true;
        }
        false
    }

    /// Release a slot previously granted for `id`. Must be called exactly
    /// once by whatever consumed the `Grant`, after the Engine has fully
    /// stopped touching its PartFile handle.
    pub async fn release(&self, id: IntentId, reason: ReleaseReason, requeue: Option<QueuedIntent>) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(slot) = inner.running.remove(&id) {
                *inner.running_count.entry(slot.lane).or_insert(0) -= 1;
            }
            inner.pending_preemption.remove(&id);
            if reason == ReleaseReason::Preempted {
                if let Some(item) = requeue {
                    let lane = Lane::from_priority(item.priority);
                    if let Some(queue) = inner.queues.get_mut(&lane) {
                        queue.push(item);
                    }
                }
            }
        }
        self.tick().await;
    }

    /// Stop admitting new work. Running slots are left alone — per the
    /// design, pausing never preempts.
    pub async fn pause_all(&self) {
        self.inner.lock().await.paused = true;
    }

    /// Resume admission and immediately try to fill any free slots.
    pub async fn resume_all(&self) {
        self.inner.lock().await.paused = false;
        self.tick().await;
    }

    /// Count of slots currently running per lane. Exposed for tests and
    /// for an eventual status/metrics surface.
    pub async fn running_counts(&self) -> HashMap<Lane, usize> {
        self.inner.lock().await.running_count.clone()
    }

    /// Count of intents waiting (not yet admitted) per lane.
    pub async fn queued_counts(&self) -> HashMap<Lane, usize> {
        self.inner
            .lock()
            .await
            .queues
            .iter()
            .map(|(lane, q)| (*lane, q.len()))
            .collect()
    }
}
