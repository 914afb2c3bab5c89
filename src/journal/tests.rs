use super::*;
use crate::config::{JournalConfig, RetryConfig};
use crate::types::Kind;
use std::time::Duration;

async fn test_journal() -> (Journal, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let journal_config = JournalConfig {
        database_path: dir.path().join("journal.db"),
        max_failures: 3,
        busy_timeout: Duration::from_secs(5),
    };
    let retry_config = RetryConfig {
        heartbeat_min_delta: 1024,
        ..RetryConfig::default()
    };
    let journal = Journal::open(&journal_config, &retry_config)
        .await
        .expect("open journal");
    (journal, dir)
}

fn download_intent(id: IntentId, priority: u16, created_at: i64) -> Intent {
    Intent {
        id,
        kind: Kind::Download,
        target_path: PathBuf::from(format!("/tmp/{id}")),
        state: IntentState::Download {
            source_key: b"src".to_vec(),
            expected_size: Some(10_000_000),
            expected_digest: None,
            confirmed_bytes: 0,
            attempt_count: 0,
        },
        priority,
        failure_count: 0,
        last_heartbeat_ticks: 0,
        created_at,
    }
}

#[tokio::test]
async fn put_then_get_round_trips() {
    let (journal, _dir) = test_journal().await;
    let id = IntentId::new();
    let intent = download_intent(id, 5, 1_000);
    journal.put(&intent).await.expect("put");

    let fetched = journal.get(id).await.expect("get").expect("present");
    assert_eq!(fetched.id, id);
    assert_eq!(fetched.priority, 5);
    assert_eq!(fetched.state.confirmed_bytes(), 0);
}

#[tokio::test]
async fn get_on_missing_id_returns_none() {
    let (journal, _dir) = test_journal().await;
    assert!(journal.get(IntentId::new()).await.expect("get").is_none());
}

#[tokio::test]
async fn upsert_with_same_id_updates_priority_but_preserves_failure_count_and_created_at() {
    let (journal, _dir) = test_journal().await;
    let id = IntentId::new();
    let mut intent = download_intent(id, 50, 1_000);
    journal.put(&intent).await.expect("put");

    // Simulate a prior recovery-time failure before the re-submit.
    journal.bump_failure(id).await.expect("bump");

    // Re-submit with a different priority (Express now).
    intent.priority = 2;
    journal.put(&intent).await.expect("put again");

    let fetched = journal.get(id).await.expect("get").expect("present");
    assert_eq!(fetched.priority, 2, "priority must update in place");
    assert_eq!(fetched.failure_count, 1, "failure_count must be preserved");
    assert_eq!(fetched.created_at, 1_000, "created_at must be preserved");
}

#[tokio::test]
async fn heartbeat_on_nonexistent_id_is_a_silent_no_op() {
    let (journal, _dir) = test_journal().await;
    journal
        .heartbeat(IntentId::new(), 5_000)
        .await
        .expect("heartbeat on missing id must not error");
}

#[tokio::test]
async fn heartbeat_below_min_delta_is_suppressed() {
    let (journal, _dir) = test_journal().await;
    let id = IntentId::new();
    journal.put(&download_intent(id, 5, 0)).await.expect("put");

    journal.heartbeat(id, 500).await.expect("heartbeat"); // below 1024 threshold
    let fetched = journal.get(id).await.expect("get").expect("present");
    assert_eq!(fetched.state.confirmed_bytes(), 0);
}

#[tokio::test]
async fn heartbeat_at_or_above_min_delta_writes_through() {
    let (journal, _dir) = test_journal().await;
    let id = IntentId::new();
    journal.put(&download_intent(id, 5, 0)).await.expect("put");

    journal.heartbeat(id, 2048).await.expect("heartbeat");
    let fetched = journal.get(id).await.expect("get").expect("present");
    assert_eq!(fetched.state.confirmed_bytes(), 2048);
}

#[tokio::test]
async fn bump_failure_crosses_threshold_and_dead_letters() {
    let (journal, _dir) = test_journal().await;
    let id = IntentId::new();
    journal.put(&download_intent(id, 5, 0)).await.expect("put");

    assert_eq!(
        journal.bump_failure(id).await.expect("bump 1"),
        BumpFailureOutcome::StillActive(1)
    );
    assert_eq!(
        journal.bump_failure(id).await.expect("bump 2"),
        BumpFailureOutcome::StillActive(2)
    );
    assert_eq!(
        journal.bump_failure(id).await.expect("bump 3"),
        BumpFailureOutcome::StillActive(3)
    );
    assert_eq!(
        journal.bump_failure(id).await.expect("bump 4"),
        BumpFailureOutcome::DeadLettered(4)
    );

    assert!(journal.get(id).await.expect("get").is_none());
    assert_eq!(journal.dead_letter_count().await.expect("count"), 1);
}

#[tokio::test]
async fn reset_failure_on_unknown_id_returns_false_and_mutates_nothing() {
    let (journal, _dir) = test_journal().await;
    assert!(!journal.reset_failure(IntentId::new()).await.expect("reset"));
    assert_eq!(journal.dead_letter_count().await.expect("count"), 0);
}

#[tokio::test]
async fn reset_failure_restores_dead_lettered_row_to_active_with_zero_count() {
    let (journal, _dir) = test_journal().await;
    let id = IntentId::new();
    journal.put(&download_intent(id, 5, 0)).await.expect("put");
    for _ in 0..4 {
        journal.bump_failure(id).await.expect("bump");
    }
    assert!(journal.get(id).await.expect("get").is_none());

    assert!(journal.reset_failure(id).await.expect("reset"));
    let fetched = journal.get(id).await.expect("get").expect("restored");
    assert_eq!(fetched.failure_count, 0);
    assert_eq!(journal.dead_letter_count().await.expect("count"), 0);
}

#[tokio::test]
async fn commit_deletes_row_and_is_idempotent() {
    let (journal, _dir) = test_journal().await;
    let id = IntentId::new();
    journal.put(&download_intent(id, 5, 0)).await.expect("put");

    journal.commit(id).await.expect("commit");
    assert!(journal.get(id).await.expect("get").is_none());

    // Idempotent: committing again (e.g. boot-sweep re-resolving a Ghost
    // File) must not error.
    journal.commit(id).await.expect("commit again");
}

#[tokio::test]
async fn list_active_ordered_sorts_by_priority_then_created_at() {
    let (journal, _dir) = test_journal().await;
    let a = IntentId::new();
    let b = IntentId::new();
    let c = IntentId::new();
    journal.put(&download_intent(a, 50, 200)).await.expect("put a");
    journal.put(&download_intent(b, 1, 100)).await.expect("put b");
    journal.put(&download_intent(c, 50, 100)).await.expect("put c");

    let ordered = journal.list_active_ordered().await.expect("list");
    let ids: Vec<IntentId> = ordered.iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![b, c, a]);
}
