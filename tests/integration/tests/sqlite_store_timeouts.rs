use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use ticketbot_core::ResponsePayload;
use ticketbot_slack_runtime::{
    ChatPlatform, ErrorClass, MessageEvent, MessageEventKind, ReconcileError, ReconcileSettings,
    ReconciliationEngine,
};
use ticketbot_store::{
    LinkStore, MessageHandle, ResponseKey, ResponseLedger, SqliteLinkStore, Team, TeamRegistry,
};

#[derive(Default)]
struct CountingPlatform {
    posts: AtomicUsize,
    deletes: AtomicUsize,
}

#[async_trait]
impl ChatPlatform for CountingPlatform {
    async fn post(
        &self,
        _team: &Team,
        channel_id: &str,
        _payload: &ResponsePayload,
    ) -> Result<MessageHandle> {
        let sequence = self.posts.fetch_add(1, Ordering::SeqCst);
        Ok(MessageHandle {
            channel_id: channel_id.to_string(),
            ts: format!("1700000900.{sequence:06}"),
        })
    }

    async fn update(
        &self,
        _team: &Team,
        handle: &MessageHandle,
        _payload: &ResponsePayload,
    ) -> Result<MessageHandle> {
        Ok(handle.clone())
    }

    async fn delete(&self, _team: &Team, _handle: &MessageHandle) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn integration_locked_sqlite_ledger_times_out_within_store_timeout() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let db_path = workspace.path().join("ticketbot.sqlite3");
    let store = Arc::new(
        SqliteLinkStore::new(&db_path)
            .expect("open sqlite store")
            .with_busy_timeout(Duration::from_millis(300)),
    );
    store.upsert_team("T1", "xoxb-t1").await.expect("install");
    store
        .set_tracker_url("T1", "https://jira.example.com/browse")
        .await
        .expect("tracker url");

    let platform = Arc::new(CountingPlatform::default());
    let engine = ReconciliationEngine::new(
        store.clone() as Arc<dyn LinkStore>,
        platform.clone(),
        ReconcileSettings {
            store_timeout_ms: 100,
            store_retry_max_attempts: 1,
            store_retry_base_delay_ms: 1,
        },
    );

    let holder = rusqlite::Connection::open(&db_path).expect("open holder");
    holder
        .execute_batch("BEGIN IMMEDIATE;")
        .expect("hold write lock");

    let key = ResponseKey::new("T1", "C1", "1700000000.000100");
    let event = MessageEvent {
        event_id: Some("Ev-locked".to_string()),
        key: key.clone(),
        author_is_bot: false,
        kind: MessageEventKind::Created,
        current_text: Some("blocked on JIRA-42".to_string()),
        previous_text: None,
    };

    let started = Instant::now();
    let error = engine.reconcile(&event).await.expect_err("ledger locked");
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_secs(1),
        "store timeout ignored: {elapsed:?}"
    );
    assert!(matches!(
        error,
        ReconcileError::StoreTimeout {
            operation: "insert_response",
            timeout_ms: 100
        }
    ));
    assert_eq!(error.class(), ErrorClass::Transport);
    assert_eq!(platform.posts.load(Ordering::SeqCst), 1);
    assert_eq!(platform.deletes.load(Ordering::SeqCst), 1);

    // The abandoned insert gives up once its busy wait lapses.
    tokio::time::sleep(Duration::from_millis(500)).await;
    holder.execute_batch("ROLLBACK;").expect("release write lock");
    assert!(store
        .get_response(&key)
        .await
        .expect("ledger read")
        .is_none());
}
