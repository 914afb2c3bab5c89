//! Journal CRUD and recovery-support operations.

use crate::error::{Error, JournalError, Result};
use crate::types::{IntentId, Kind};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::path::PathBuf;

use super::{BumpFailureOutcome, DeadLetter, Intent, IntentState, Journal};

fn row_to_intent(row: SqliteRow) -> Result<Intent> {
    let state_json: String = row.try_get("state_blob").map_err(JournalError::Storage)?;
    let state: IntentState = serde_json::from_str(&state_json)
        .map_err(|e| Error::Journal(JournalError::MigrationFailed(e.to_string())))?;
    Ok(Intent {
        id: row.try_get("id").map_err(JournalError::Storage)?,
        kind: Kind::from_i32(row.try_get::<i32, _>("kind").map_err(JournalError::Storage)?),
        target_path: PathBuf::from(
            row.try_get::<String, _>("target_path")
                .map_err(JournalError::Storage)?,
        ),
        state,
        priority: row.try_get::<i64, _>("priority").map_err(JournalError::Storage)? as u16,
        failure_count: row
            .try_get::<i64, _>("failure_count")
            .map_err(JournalError::Storage)? as u32,
        last_heartbeat_ticks: row
            .try_get("last_heartbeat_ticks")
            .map_err(JournalError::Storage)?,
        created_at: row.try_get("created_at").map_err(JournalError::Storage)?,
    })
}

fn row_to_dead_letter(row: SqliteRow) -> Result<DeadLetter> {
    let state_json: String = row.try_get("state_blob").map_err(JournalError::Storage)?;
    let state: IntentState = serde_json::from_str(&state_json)
        .map_err(|e| Error::Journal(JournalError::MigrationFailed(e.to_string())))?;
    Ok(DeadLetter {
        id: row.try_get("id").map_err(JournalError::Storage)?,
        kind: Kind::from_i32(row.try_get::<i32, _>("kind").map_err(JournalError::Storage)?),
        target_path: PathBuf::from(
            row.try_get::<String, _>("target_path")
                .map_err(JournalError::Storage)?,
        ),
        state,
        priority: row.try_get::<i64, _>("priority").map_err(JournalError::Storage)? as u16,
        failure_count: row
            .try_get::<i64, _>("failure_count")
            .map_err(JournalError::Storage)? as u32,
        created_at: row.try_get("created_at").map_err(JournalError::Storage)?,
        dead_lettered_at: row
            .try_get("dead_lettered_at")
            .map_err(JournalError::Storage)?,
    })
}

impl Journal {
    /// Durably record `intent`. A second `put` with the same id is an
    /// **upsert**: `target_path`, `state`, and `priority` are replaced but
    /// `failure_count` and `created_at` are preserved, per the uniqueness
    /// invariant in the data model. This also resolves the design's first
    /// open question: a changed `priority` on re-submit takes effect
    /// in-place rather than being rejected.
    pub async fn put(&self, intent: &Intent) -> Result<()> {
        let state_json = serde_json::to_string(&intent.state)
            .map_err(|e| Error::Journal(JournalError::MigrationFailed(e.to_string())))?;

        sqlx::query(
            r#"
            INSERT INTO active_intents
                (id, kind, target_path, state_blob, priority, failure_count, last_heartbeat_ticks, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                target_path = excluded.target_path,
                state_blob = excluded.state_blob,
                priority = excluded.priority
            "#,
        )
        .bind(intent.id)
        .bind(intent.kind.to_i32())
        .bind(intent.target_path.to_string_lossy().to_string())
        .bind(&state_json)
        .bind(intent.priority as i64)
        .bind(intent.failure_count as i64)
        .bind(intent.last_heartbeat_ticks)
        .bind(intent.created_at)
        .execute(self.pool())
        .await
        .map_err(JournalError::Storage)?;

        Ok(())
    }

    /// Look up an active intent by id.
    pub async fn get(&self, id: IntentId) -> Result<Option<Intent>> {
        let row = sqlx::query("SELECT * FROM active_intents WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(JournalError::Storage)?;

        row.map(row_to_intent).transpose()
    }

    /// Atomically update `confirmed_bytes` and `last_heartbeat_ticks` for
    /// `id`. A no-op if `id` is absent (crash-recovery safe: a stray
    /// heartbeat for an intent the journal no longer tracks is silently
    /// dropped). The write itself is suppressed unless `confirmed_bytes`
    /// exceeds the stored value by at least `heartbeat_min_delta` — this
    /// bounds flash wear during high-throughput transfers and is a policy
    /// threshold, not an invariant.
    pub async fn heartbeat(&self, id: IntentId, confirmed_bytes: u64) -> Result<()> {
        let Some(current) = self.get(id).await? else {
            return Ok(());
        };

        let stored = current.state.confirmed_bytes();
        if confirmed_bytes < stored.saturating_add(self.heartbeat_min_delta()) {
            return Ok(());
        }

        let new_state = match current.state {
            IntentState::Download {
                source_key,
                expected_size,
                expected_digest,
                attempt_count,
                ..
            } => IntentState::Download {
                source_key,
                expected_size,
                expected_digest,
                confirmed_bytes,
                attempt_count,
            },
            other @ IntentState::TagWrite { .. } => other,
        };
        let state_json = serde_json::to_string(&new_state)
            .map_err(|e| Error::Journal(JournalError::MigrationFailed(e.to_string())))?;

        sqlx::query(
            "UPDATE active_intents SET state_blob = ?, last_heartbeat_ticks = ? WHERE id = ?",
        )
        .bind(&state_json)
        .bind(self.now_ticks())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(JournalError::Storage)?;

        Ok(())
    }

    /// Increment `failure_count`. Crossing `max_failures` moves the row
    /// to the dead-letter sink and removes it from `active`.
    pub async fn bump_failure(&self, id: IntentId) -> Result<BumpFailureOutcome> {
        let mut tx = self.pool().begin().await.map_err(JournalError::Storage)?;

        let row = sqlx::query("SELECT * FROM active_intents WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(JournalError::Storage)?;

        let Some(row) = row else {
            tx.commit().await.map_err(JournalError::Storage)?;
            return Ok(BumpFailureOutcome::StillActive(0));
        };
        let intent = row_to_intent(row)?;
        let new_failure_count = intent.failure_count + 1;

        if new_failure_count > self.max_failures() {
            let state_json = serde_json::to_string(&intent.state)
                .map_err(|e| Error::Journal(JournalError::MigrationFailed(e.to_string())))?;
            let now = chrono::Utc::now().timestamp();

            sqlx::query(
                r#"
                INSERT INTO dead_letters
                    (id, kind, target_path, state_blob, priority, failure_count, created_at, dead_lettered_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(intent.id)
            .bind(intent.kind.to_i32())
            .bind(intent.target_path.to_string_lossy().to_string())
            .bind(&state_json)
            .bind(intent.priority as i64)
            .bind(new_failure_count as i64)
            .bind(intent.created_at)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(JournalError::Storage)?;

            sqlx::query("DELETE FROM active_intents WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(JournalError::Storage)?;

            tx.commit().await.map_err(JournalError::Storage)?;
            return Ok(BumpFailureOutcome::DeadLettered(new_failure_count));
        }

        sqlx::query("UPDATE active_intents SET failure_count = ? WHERE id = ?")
            .bind(new_failure_count as i64)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(JournalError::Storage)?;

        tx.commit().await.map_err(JournalError::Storage)?;
        Ok(BumpFailureOutcome::StillActive(new_failure_count))
    }

    /// Reset `failure_count` to 0. If `id` is in `dead_letter`, restores
    /// it to `active` with a fresh failure count. Returns `true` if a row
    /// was found and mutated (in either table).
    pub async fn reset_failure(&self, id: IntentId) -> Result<bool> {
        let mut tx = self.pool().begin().await.map_err(JournalError::Storage)?;

        let active_row = sqlx::query("SELECT * FROM active_intents WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(JournalError::Storage)?;

        if active_row.is_some() {
            sqlx::query("UPDATE active_intents SET failure_count = 0 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(JournalError::Storage)?;
            tx.commit().await.map_err(JournalError::Storage)?;
            return Ok(true);
        }

        let dead_row = sqlx::query("SELECT * FROM dead_letters WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(JournalError::Storage)?;

        let Some(dead_row) = dead_row else {
            tx.commit().await.map_err(JournalError::Storage)?;
            return Ok(false);
        };
        let dead = row_to_dead_letter(dead_row)?;
        let state_json = serde_json::to_string(&dead.state)
            .map_err(|e| Error::Journal(JournalError::MigrationFailed(e.to_string())))?;

        sqlx::query(
            r#"
            INSERT INTO active_intents
                (id, kind, target_path, state_blob, priority, failure_count, last_heartbeat_ticks, created_at)
            VALUES (?, ?, ?, ?, ?, 0, 0, ?)
            "#,
        )
        .bind(dead.id)
        .bind(dead.kind.to_i32())
        .bind(dead.target_path.to_string_lossy().to_string())
        .bind(&state_json)
        .bind(dead.priority as i64)
        .bind(dead.created_at)
        .execute(&mut *tx)
        .await
        .map_err(JournalError::Storage)?;

        sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(JournalError::Storage)?;

        tx.commit().await.map_err(JournalError::Storage)?;
        Ok(true)
    }

    /// Delete the row for `id`. Idempotent: calling this on an id that
    /// does not exist (e.g. a repeated boot-sweep `commit`) succeeds
    /// silently. MUST only be called after `PartFile::commit` succeeds.
    pub async fn commit(&self, id: IntentId) -> Result<()> {
        sqlx::query("DELETE FROM active_intents WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(JournalError::Storage)?;
        Ok(())
    }

    /// All active rows ordered by `priority` ascending then `created_at`
    /// ascending — the exact order the boot recovery sweep and
    /// `LaneScheduler` fairness policy require.
    pub async fn list_active_ordered(&self) -> Result<Vec<Intent>> {
        let rows = sqlx::query(
            "SELECT * FROM active_intents ORDER BY priority ASC, created_at ASC",
        )
        .fetch_all(self.pool())
        .await
        .map_err(JournalError::Storage)?;

        rows.into_iter().map(row_to_intent).collect()
    }

    /// Active rows whose `last_heartbeat_ticks` is older than `age`,
    /// measured against this process's monotonic clock. Only meaningful
    /// for rows heartbeated during the current process's lifetime — a
    /// fresh boot should use `list_active_ordered` directly, since a
    /// prior run's monotonic readings carry no meaning here.
    pub async fn list_stale(&self, age: std::time::Duration) -> Result<Vec<Intent>> {
        let threshold = self.now_ticks() - age.as_millis() as i64;
        let rows = sqlx::query(
            "SELECT * FROM active_intents WHERE last_heartbeat_ticks < ? ORDER BY priority ASC, created_at ASC",
        )
        .bind(threshold)
        .fetch_all(self.pool())
        .await
        .map_err(JournalError::Storage)?;

        rows.into_iter().map(row_to_intent).collect()
    }

    /// Look up a dead-lettered row by id, if present. Used by `submit` to
    /// reject re-submission of a poisoned id (S4: a second `submit` on a
    /// dead-lettered id is rejected until `reset_failure` is called) and
    /// by `reset_failure` itself.
    pub async fn get_dead_letter(&self, id: IntentId) -> Result<Option<DeadLetter>> {
        let row = sqlx::query("SELECT * FROM dead_letters WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(JournalError::Storage)?;

        row.map(row_to_dead_letter).transpose()
    }

    /// Number of rows currently in the dead-letter sink (for diagnostics
    /// and tests; not used by recovery itself).
    pub async fn dead_letter_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(self.pool())
            .await
            .map_err(|e| Error::Journal(JournalError::Storage(e)))
    }
}
