//! Journal storage setup and schema migrations.

use crate::config::{JournalConfig, RetryConfig};
use crate::error::{Error, JournalError, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::str::FromStr;

use super::Journal;

impl Journal {
    /// Open (creating if missing) the journal at `config.database_path`
    /// in WAL mode and run any outstanding migrations.
    ///
    /// WAL mode is what produces the sibling `-wal` file the persisted
    /// layout calls for; SQLite itself enforces exclusive ownership of
    /// the database file, so a second process attempting to open the
    /// same path fails the way the design requires.
    pub async fn open(journal_config: &JournalConfig, retry_config: &RetryConfig) -> Result<Self> {
        if let Some(parent) = journal_config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
            }
        }

        let options =
            SqliteConnectOptions::from_str(&format!(
                "sqlite:{}",
                journal_config.database_path.display()
            ))
            .map_err(|e| Error::Journal(JournalError::MigrationFailed(e.to_string())))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(journal_config.busy_timeout)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(JournalError::Storage)?;

        let journal = Self {
            pool,
            max_failures: journal_config.max_failures,
            heartbeat_min_delta: retry_config.heartbeat_min_delta,
            process_start: std::time::Instant::now(),
        };

        journal.run_migrations().await?;
        Ok(journal)
    }

    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(JournalError::Storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(JournalError::Storage)?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(JournalError::Storage)?;

        if current_version.unwrap_or(0) < 1 {
            Self::migrate_v1(&mut conn).await?;
        }

        Ok(())
    }

    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("applying journal migration v1");

        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(JournalError::Storage)?;

        let result = async {
            sqlx::query(
                r#"
                CREATE TABLE active_intents (
                    id TEXT PRIMARY KEY,
                    kind INTEGER NOT NULL,
                    target_path TEXT NOT NULL,
                    state_blob TEXT NOT NULL,
                    priority INTEGER NOT NULL,
                    failure_count INTEGER NOT NULL DEFAULT 0,
                    last_heartbeat_ticks INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL
                )
                "#,
            )
            .execute(&mut *conn)
            .await
            .map_err(JournalError::Storage)?;

            sqlx::query(
                "CREATE INDEX idx_active_intents_priority ON active_intents(priority ASC, created_at ASC)",
            )
            .execute(&mut *conn)
            .await
            .map_err(JournalError::Storage)?;

            sqlx::query(
                r#"
                CREATE TABLE dead_letters (
                    id TEXT PRIMARY KEY,
                    kind INTEGER NOT NULL,
                    target_path TEXT NOT NULL,
                    state_blob TEXT NOT NULL,
                    priority INTEGER NOT NULL,
                    failure_count INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    dead_lettered_at INTEGER NOT NULL
                )
                "#,
            )
            .execute(&mut *conn)
            .await
            .map_err(JournalError::Storage)?;

            sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (1, strftime('%s','now'))")
                .execute(&mut *conn)
                .await
                .map_err(JournalError::Storage)?;

            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(JournalError::Storage)?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!("journal migration v1 complete");
        Ok(())
    }

    /// Monotonic tick count elapsed since this `Journal` was opened.
    /// Comparisons are only meaningful within this process's lifetime —
    /// stored values from a prior run are not reinterpreted.
    pub(super) fn now_ticks(&self) -> i64 {
        self.process_start.elapsed().as_millis() as i64
    }

    pub(super) fn max_failures(&self) -> u32 {
        self.max_failures
    }

    pub(super) fn heartbeat_min_delta(&self) -> u64 {
        self.heartbeat_min_delta
    }

    pub(super) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Flush and close the underlying pool. Part of graceful shutdown
    /// (§4.6.3): called only after every engine has stopped touching the
    /// journal.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
