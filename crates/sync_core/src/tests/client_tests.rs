use super::*;
use storage::{MemoryCursorStore, MemoryRecordStore};
use tokio_stream::StreamExt;

use crate::test_support::{message_record, seeded_store};

async fn client_for(store: &Arc<MemoryRecordStore>) -> Arc<SyncClient> {
    let settings = SyncSettings {
        cursor_database_url: "sqlite::memory:".into(),
        fetch_timeout_ms: 5_000,
        ..SyncSettings::default()
    };
    SyncClient::new(store.clone(), Arc::new(MemoryCursorStore::new()), settings)
        .await
        .expect("client")
}

async fn alice_with_details(store: &Arc<MemoryRecordStore>) -> Arc<SyncClient> {
    let client = client_for(store).await;
    client.login(false).await.expect("login");
    client.fetch_conversations(true).await.expect("conversations");
    client
}

fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn brand_new_account_gets_discovered_name() {
    let store = Arc::new(MemoryRecordStore::new());
    store.set_current_user(RecordId::from("newbie")).await;
    store
        .set_discoverable_name(RecordId::from("newbie"), "Nova")
        .await;
    let client = client_for(&store).await;

    let user = client.login(true).await.expect("login");
    assert_eq!(user.name.as_deref(), Some("Nova"));
    assert!(user.is_fetched());
    assert_eq!(
        client.current_user().await.and_then(|u| u.name),
        Some("Nova".to_string())
    );
}

#[tokio::test]
async fn undiscoverable_account_falls_back_to_record_name() {
    let store = Arc::new(MemoryRecordStore::new());
    store.set_current_user(RecordId::from("quiet")).await;
    let client = client_for(&store).await;

    let user = client.login(true).await.expect("login");
    assert_eq!(user.name.as_deref(), Some("User_quiet"));
}

#[tokio::test]
async fn unnamed_user_cannot_list_conversations() {
    let store = Arc::new(MemoryRecordStore::new());
    store.set_current_user(RecordId::from("quiet")).await;
    let client = client_for(&store).await;

    let user = client.login(false).await.expect("login");
    assert!(!user.is_fetched());
    let err = client
        .fetch_conversations(false)
        .await
        .expect_err("stub user");
    assert_eq!(err.kind(), shared::error::ErrorKind::EntityNotFetched);

    let renamed = client.set_user_name("Quinn").await.expect("rename");
    assert!(renamed.is_fetched());
    assert!(client.fetch_conversations(false).await.is_ok());
}

#[tokio::test]
async fn sending_before_login_is_refused() {
    let store = seeded_store().await;
    let client = client_for(&store).await;
    let err = client
        .send_message(&RecordId::from("room"), "hi")
        .await
        .expect_err("no session");
    assert_eq!(err, SyncError::Remote(StoreError::NotAuthenticated));
}

#[tokio::test]
async fn conversations_are_listed_with_details() {
    let store = seeded_store().await;
    store
        .insert_record(message_record("m1", "room", "bob", "hey", 10))
        .await;
    let client = alice_with_details(&store).await;

    let room = client
        .cache()
        .conversation(&RecordId::from("room"))
        .await
        .expect("cached room");
    assert!(room.is_fetched());
    assert_eq!(room.last_message().map(|m| m.id.as_str()), Some("m1"));
    assert_eq!(
        room.display_name(Some(&RecordId::from("alice"))),
        Some("Bob")
    );
    let alice = client.current_user().await.expect("session");
    assert!(alice.belongs_to(&RecordId::from("room")));
}

#[tokio::test]
async fn pending_message_is_ignored_until_confirmed() {
    let store = seeded_store().await;
    let client = alice_with_details(&store).await;
    let room = RecordId::from("room");
    let mut events = client.subscribe_events();

    store
        .fail_next_save(StoreError::Unavailable("offline".into()))
        .await;
    let err = client
        .send_message(&room, "are we still on?")
        .await
        .expect_err("offline");
    assert_eq!(err, SyncError::Remote(StoreError::Unavailable("offline".into())));

    let pending = client.outbox(&room).await.expect("outbox");
    assert_eq!(pending.pending().len(), 1);
    let cached = client.cache().conversation(&room).await.expect("room");
    assert!(cached.last_message().is_none());

    let sent = client.retry_pending(&room).await.expect("retry");
    assert_eq!(sent.len(), 1);
    assert!(client.outbox(&room).await.expect("outbox").is_empty());
    let cached = client.cache().conversation(&room).await.expect("room");
    assert_eq!(cached.last_message().map(|m| &m.id), Some(&sent[0].id));
    assert!(!sent[0].is_incoming(Some(&RecordId::from("alice"))));

    let kinds: Vec<&str> = drain(&mut events)
        .iter()
        .map(|event| match event {
            SyncEvent::MessageStaged { .. } => "staged",
            SyncEvent::MessageFailed { .. } => "failed",
            SyncEvent::MessageSent { .. } => "sent",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["staged", "failed", "sent"]);
}

#[tokio::test]
async fn failed_retry_keeps_pending_order() {
    let store = seeded_store().await;
    let client = alice_with_details(&store).await;
    let room = RecordId::from("room");
    let bodies = |outbox: Outbox| -> Vec<String> {
        outbox
            .pending()
            .iter()
            .filter_map(|m| m.body.clone())
            .collect()
    };

    for body in ["first", "second"] {
        store
            .fail_next_save(StoreError::Unavailable("offline".into()))
            .await;
        client.send_message(&room, body).await.expect_err("offline");
    }
    let before = bodies(client.outbox(&room).await.expect("outbox"));
    assert_eq!(before, vec!["first", "second"]);

    store
        .fail_next_save(StoreError::Unavailable("still offline".into()))
        .await;
    client.retry_pending(&room).await.expect_err("still offline");
    assert_eq!(bodies(client.outbox(&room).await.expect("outbox")), before);

    let sent = client.retry_pending(&room).await.expect("online");
    assert_eq!(
        sent.iter().filter_map(|m| m.body.as_deref()).collect::<Vec<_>>(),
        vec!["first", "second"]
    );
    assert!(client.outbox(&room).await.expect("outbox").is_empty());
}

#[tokio::test]
async fn non_member_send_is_rejected_before_any_write() {
    let store = seeded_store().await;
    store
        .insert_record(crate::test_support::conversation_record(
            "den",
            "Den",
            "bob",
            &["bob", "carol"],
        ))
        .await;
    let client = alice_with_details(&store).await;
    let saves_before = store.calls().await.saves;

    let err = client
        .send_message(&RecordId::from("den"), "let me in")
        .await
        .expect_err("not a member");
    assert_eq!(
        err,
        SyncError::WrongConversationMembership {
            user: RecordId::from("alice"),
            conversation: RecordId::from("den"),
        }
    );
    assert_eq!(store.calls().await.saves, saves_before);
    assert!(client
        .outbox(&RecordId::from("den"))
        .await
        .expect("outbox")
        .is_empty());
}

#[tokio::test]
async fn incoming_messages_flow_through_notifications() {
    let store = seeded_store().await;
    let client = alice_with_details(&store).await;
    assert!(matches!(
        client.subscribe_to_changes().await.expect("subscribe"),
        SubscriptionOutcome::Registered(_)
    ));
    let mut stream = client.event_stream();

    store
        .save_records(vec![message_record("m1", "room", "bob", "lunch?", 30)])
        .await
        .expect("bob sends");
    store.redeliver_notification(&RecordId::from("m1")).await;

    let report = client.fetch_notification_changes().await.expect("cycle");
    assert_eq!(report.messages.len(), 1);
    assert!(report.messages[0].is_incoming(Some(&RecordId::from("alice"))));

    match stream.next().await {
        Some(Ok(SyncEvent::NewMessages(messages))) => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].id, RecordId::from("m1"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let room = client
        .cache()
        .conversation(&RecordId::from("room"))
        .await
        .expect("room");
    assert_eq!(room.last_message().map(|m| m.id.as_str()), Some("m1"));

    assert_eq!(
        client
            .mark_messages_processed(&[RecordId::from("m1")])
            .await,
        1
    );
    let quiet = client.fetch_notification_changes().await.expect("cycle");
    assert!(quiet.messages.is_empty());
    assert!(client.change_cursor().await.is_some());
}

#[tokio::test]
async fn resubscribing_is_tolerated_and_reset_starts_over() {
    let store = seeded_store().await;
    let client = alice_with_details(&store).await;

    client.subscribe_to_changes().await.expect("first");
    assert!(matches!(
        client.subscribe_to_changes().await.expect("again"),
        SubscriptionOutcome::AlreadyRegistered { .. }
    ));

    let outcome = client.reset_subscriptions().await.expect("reset");
    assert_eq!(
        outcome,
        SubscriptionOutcome::Registered(vec!["M-room".into(), "G-alice".into()])
    );
    assert_eq!(client.list_subscriptions().await.expect("list").len(), 2);
}

#[tokio::test]
async fn new_conversation_reaches_session_and_invitees() {
    let store = seeded_store().await;
    store.add_contact(RecordId::from("alice"), None).await;
    store
        .add_contact(RecordId::from("carol"), Some("carol@example.com"))
        .await;
    let client = alice_with_details(&store).await;
    client.subscribe_to_changes().await.expect("subscribe");

    let contacts = client.discover_contacts().await.expect("contacts");
    assert!(contacts.is_complete());
    assert_eq!(contacts.value.len(), 1);
    let carol = client
        .discover_user_by_email("carol@example.com")
        .await
        .expect("carol");
    assert_eq!(carol.id, contacts.value[0].id);

    let trip = client
        .create_conversation("Trip", &contacts.value)
        .await
        .expect("create");
    assert!(trip.has_member(&RecordId::from("alice")));
    assert!(trip.has_member(&RecordId::from("carol")));

    let alice = client.current_user().await.expect("session");
    assert!(alice.belongs_to(&trip.id));
    let cached_carol = client
        .cache()
        .user(&RecordId::from("carol"))
        .await
        .expect("carol cached");
    assert!(cached_carol.belongs_to(&trip.id));

    let report = client.fetch_notification_changes().await.expect("cycle");
    assert_eq!(report.conversation_invites, vec![trip.id.clone()]);

    client
        .send_message(&trip.id, "packing list?")
        .await
        .expect("owner can send");
}

#[tokio::test]
async fn message_paging_keeps_the_latest() {
    let store = seeded_store().await;
    for (id, seconds) in [("m1", 10), ("m2", 20), ("m3", 30)] {
        store
            .insert_record(message_record(id, "room", "bob", "tick", seconds))
            .await;
    }
    let client = client_for(&store).await;
    client.login(false).await.expect("login");

    let page = client
        .fetch_messages(&RecordId::from("room"), Some(2))
        .await
        .expect("page");
    assert_eq!(
        page.value.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        vec!["m2", "m3"]
    );
    let all = client
        .fetch_messages(&RecordId::from("room"), None)
        .await
        .expect("all");
    assert_eq!(all.value.len(), 3);

    let room = client
        .cache()
        .conversation(&RecordId::from("room"))
        .await
        .expect("room");
    assert_eq!(room.messages.as_deref().map(<[_]>::len), Some(3));
}

#[tokio::test]
async fn drafts_survive_sends() {
    let store = seeded_store().await;
    let client = alice_with_details(&store).await;
    let room = RecordId::from("room");

    client.set_draft(&room, "half").await.expect("draft");
    client.send_message(&room, "whole").await.expect("send");
    assert_eq!(client.outbox(&room).await.expect("outbox").draft(), "half");
}

#[tokio::test]
async fn handle_trait_delegates_to_client() {
    let store = seeded_store().await;
    let client = client_for(&store).await;
    let handle: Arc<dyn SyncHandle> = Arc::new(client.clone());

    handle.login(false).await.expect("login");
    handle
        .fetch_conversations(false)
        .await
        .expect("conversations");
    let recent = handle
        .fetch_recent_messages(&RecordId::from("room"))
        .await
        .expect("recent");
    assert!(recent.value.is_empty());
    assert!(client.current_user().await.is_some());
}
