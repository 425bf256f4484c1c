use super::*;
use std::time::Duration;

use shared::{
    domain::{
        CONVERSATION_MEMBERS_KEY, CONVERSATION_RECORD_TYPE, MESSAGE_CONVERSATION_KEY,
        MESSAGE_RECORD_TYPE,
    },
    error::StoreError,
    protocol::{FiresOn, QueryPredicate, Subscription},
};
use storage::{MemoryCursorStore, MemoryRecordStore};

use crate::test_support::{conversation_record, message_record, seeded_store};

struct Harness {
    store: Arc<MemoryRecordStore>,
    cursors: Arc<MemoryCursorStore>,
    reconciler: NotificationReconciler,
}

async fn harness() -> Harness {
    let store = seeded_store().await;
    store
        .save_subscriptions(vec![
            Subscription {
                subscription_id: "M-room".into(),
                record_type: MESSAGE_RECORD_TYPE.into(),
                predicate: QueryPredicate::ReferenceEquals {
                    field: MESSAGE_CONVERSATION_KEY.into(),
                    target: RecordId::from("room"),
                },
                fires_on: FiresOn::CREATION,
                alert_body: None,
            },
            Subscription {
                subscription_id: "G-alice".into(),
                record_type: CONVERSATION_RECORD_TYPE.into(),
                predicate: QueryPredicate::ReferenceListContains {
                    field: CONVERSATION_MEMBERS_KEY.into(),
                    target: RecordId::from("alice"),
                },
                fires_on: FiresOn::CREATION_AND_UPDATE,
                alert_body: None,
            },
        ])
        .await
        .expect("subscriptions");
    let cursors = Arc::new(MemoryCursorStore::new());
    let reconciler = reconciler_for(&store, &cursors).await;
    Harness {
        store,
        cursors,
        reconciler,
    }
}

async fn reconciler_for(
    store: &Arc<MemoryRecordStore>,
    cursors: &Arc<MemoryCursorStore>,
) -> NotificationReconciler {
    let fetcher = Arc::new(RemoteCollectionFetcher::new(
        store.clone(),
        Duration::from_secs(5),
    ));
    NotificationReconciler::load(store.clone(), cursors.clone(), fetcher)
        .await
        .expect("reconciler")
}

async fn bob_says(store: &MemoryRecordStore, id: &str, seconds: i64) {
    store
        .save_records(vec![message_record(id, "room", "bob", "hello", seconds)])
        .await
        .expect("save message");
}

#[tokio::test]
async fn redelivered_notification_yields_one_message() {
    let h = harness().await;
    bob_says(&h.store, "m1", 1).await;
    assert!(h.store.redeliver_notification(&RecordId::from("m1")).await);

    let report = h.reconciler.fetch_changes().await.expect("cycle");
    assert_eq!(report.messages.len(), 1);
    assert_eq!(report.messages[0].id, RecordId::from("m1"));
    assert!(report.messages[0].is_fetched());
    assert_eq!(h.reconciler.unfetched().await.len(), 1);
    assert_eq!(h.reconciler.state().await, ReconcilerState::Idle);
}

#[tokio::test]
async fn failed_hydration_leaves_cursor_and_stubs_untouched() {
    let h = harness().await;
    bob_says(&h.store, "m1", 1).await;
    let first = h.reconciler.fetch_changes().await.expect("first cycle");
    assert_eq!(first.messages.len(), 1);
    h.reconciler.mark_processed(&[RecordId::from("m1")]).await;
    let committed = h.reconciler.cursor().await;
    assert!(committed.is_some());

    bob_says(&h.store, "m2", 2).await;
    h.store
        .fail_record(
            RecordId::from("m2"),
            StoreError::Unavailable("flaky".into()),
        )
        .await;

    let err = h.reconciler.fetch_changes().await.expect_err("hydration fails");
    assert!(err.is_partial());
    assert_eq!(h.reconciler.cursor().await, committed);
    assert_eq!(h.cursors.load_cursor().await.expect("load"), committed);
    assert_eq!(
        h.reconciler
            .unfetched()
            .await
            .iter()
            .map(|m| m.id.clone())
            .collect::<Vec<_>>(),
        vec![RecordId::from("m2")]
    );
    assert_eq!(h.reconciler.state().await, ReconcilerState::Idle);

    h.store.clear_faults().await;
    let retry = h.reconciler.fetch_changes().await.expect("retry");
    assert_eq!(retry.messages.len(), 1);
    assert_eq!(retry.messages[0].id, RecordId::from("m2"));
    assert_ne!(h.reconciler.cursor().await, committed);
}

#[tokio::test]
async fn notification_fetch_failure_is_surfaced() {
    let h = harness().await;
    h.store
        .fail_next_notification_fetch(StoreError::Unavailable("offline".into()))
        .await;

    let err = h.reconciler.fetch_changes().await.expect_err("offline");
    assert_eq!(err, SyncError::Remote(StoreError::Unavailable("offline".into())));
    assert!(h.reconciler.cursor().await.is_none());
}

#[tokio::test]
async fn unacknowledged_messages_are_delivered_again() {
    let h = harness().await;
    bob_says(&h.store, "m1", 1).await;
    bob_says(&h.store, "m2", 2).await;
    h.reconciler.fetch_changes().await.expect("first");

    assert_eq!(h.reconciler.mark_processed(&[RecordId::from("m1")]).await, 1);
    assert_eq!(h.reconciler.mark_processed(&[RecordId::from("m1")]).await, 0);

    let again = h.reconciler.fetch_changes().await.expect("second");
    assert_eq!(
        again.messages.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        vec!["m2"]
    );
}

#[tokio::test]
async fn conversation_notifications_are_reported_as_invites() {
    let h = harness().await;
    h.store
        .save_records(vec![conversation_record(
            "den",
            "Den",
            "bob",
            &["bob", "alice"],
        )])
        .await
        .expect("invite");

    let report = h.reconciler.fetch_changes().await.expect("cycle");
    assert!(report.messages.is_empty());
    assert_eq!(report.conversation_invites, vec![RecordId::from("den")]);
}

#[tokio::test]
async fn persisted_cursor_survives_restart_and_reset() {
    let h = harness().await;
    bob_says(&h.store, "m1", 1).await;
    h.reconciler.fetch_changes().await.expect("cycle");

    let restarted = reconciler_for(&h.store, &h.cursors).await;
    assert_eq!(restarted.cursor().await, h.reconciler.cursor().await);
    let nothing_new = restarted.fetch_changes().await.expect("cycle");
    assert!(nothing_new.messages.is_empty());

    restarted.reset_cursor().await.expect("reset");
    assert!(h.cursors.load_cursor().await.expect("load").is_none());
    let replay = restarted.fetch_changes().await.expect("replay");
    assert_eq!(replay.messages.len(), 1);
}

#[tokio::test]
async fn acknowledging_a_dead_stub_lets_the_cursor_move_on() {
    let h = harness().await;
    bob_says(&h.store, "m1", 1).await;
    h.reconciler.fetch_changes().await.expect("first cycle");
    h.reconciler.mark_processed(&[RecordId::from("m1")]).await;
    let committed = h.reconciler.cursor().await;

    bob_says(&h.store, "m2", 2).await;
    h.store
        .fail_record(RecordId::from("m2"), StoreError::NotFound(RecordId::from("m2")))
        .await;
    h.store
        .save_records(vec![conversation_record(
            "den",
            "Den",
            "bob",
            &["bob", "alice"],
        )])
        .await
        .expect("invite");

    let err = h.reconciler.fetch_changes().await.expect_err("m2 is gone");
    let SyncError::PartialBatchFailure { failed } = err else {
        panic!("unexpected error: {err:?}");
    };
    assert_eq!(failed, vec![RecordId::from("m2")]);
    assert_eq!(h.reconciler.cursor().await, committed);

    assert_eq!(h.reconciler.mark_processed(&failed).await, 1);
    let report = h.reconciler.fetch_changes().await.expect("unblocked");
    assert!(report.messages.is_empty());
    assert_eq!(report.conversation_invites, vec![RecordId::from("den")]);
    assert!(h.reconciler.unfetched().await.is_empty());
    assert_ne!(h.reconciler.cursor().await, committed);
}
