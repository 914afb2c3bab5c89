//! Admission policy: the only code path that decides which waiting
//! Intent gets a free execution slot, and the only code path that
//! decides to preempt a running Background Intent for an Express
//! arrival.

use super::{Grant, Inner, Lane, LaneScheduler, RunningSlot};
use tokio_util::sync::CancellationToken;

/// Lanes in admission-priority order. Express-first ordering alone
/// satisfies each lane's guaranteed minimum without needing to consult
/// `LaneBudget::min` directly: Express is always tried first, so it can
/// never be starved by Standard or Background.
const LANE_ORDER: [Lane; 3] = [Lane::Express, Lane::Standard, Lane::Background];

impl LaneScheduler {
    /// Drain ready work into free slots. The only code path that grants
    /// slots; called on every slot release, every submit, and every 1s by
    /// the background ticker (to catch priority-upsert races per §4.4).
    pub async fn tick(&self) {
        let mut grants = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            if !inner.paused {
                admit(&mut inner, &mut grants);
                preempt_for_express(&mut inner);
            }
        }
        for grant in grants {
            if self.grants.send(grant).await.is_err() {
                tracing::warn!("grant channel closed; dropping admitted intent");
            }
        }
    }
}

fn admit(inner: &mut Inner, grants: &mut Vec<Grant>) {
    for &lane in LANE_ORDER.iter() {
        loop {
            if inner.total_running() >= inner.pool_size {
                return;
            }
            let budget = match inner.budgets.get(&lane) {
                Some(b) => *b,
                None => break,
            };
            let running = *inner.running_count.get(&lane).unwrap_or(&0);
            if running >= budget.max {
                break;
            }
            let Some(queue) = inner.queues.get_mut(&lane) else {
                break;
            };
            let Some(item) = queue.pop() else {
                break;
            };

            let cancel = CancellationToken::new();
            inner.running.insert(
                item.id,
                RunningSlot {
                    lane,
                    cancel: cancel.clone(),
                },
            );
            *inner.running_count.entry(lane).or_insert(0) += 1;
            grants.push(Grant {
                id: item.id,
                lane,
                cancel,
            });
        }
    }
}

/// If Express work is waiting and the pool is full, preempt running
/// Background Intents (never Standard — preemption never crosses lanes
/// at the same tier) one at a time, up to the number of Express Intents
/// not already covered by a preemption in flight.
///
/// This only *signals* the preemption (cancels the token); the slot is
/// not freed and re-admitted until the Engine calls
/// [`LaneScheduler::release`] with [`ReleaseReason::Preempted`].
fn preempt_for_express(inner: &mut Inner) {
    let waiting_express = inner
        .queues
        .get(&Lane::Express)
        .map(|q| q.len())
        .unwrap_or(0);
    if waiting_express == 0 || inner.total_running() < inner.pool_size {
        return;
    }

    let already_pending = inner.pending_preemption.len();
    let needed = waiting_express.saturating_sub(already_pending);
    if needed == 0 {
        return;
    }

    let candidates: Vec<crate::types::IntentId> = inner
        .running
        .iter()
        .filter(|(id, slot)| slot.lane == Lane::Background && !inner.pending_preemption.contains(*id))
        .map(|(id, _)| *id)
        .take(needed)
        .collect();

    for id in candidates {
        if let Some(slot) = inner.running.get(&id) {
            tracing::info!(id = %id, "preempting background intent for express arrival");
            slot.cancel.cancel();
            inner.pending_preemption.insert(id);
        }
    }
}
