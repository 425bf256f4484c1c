use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{
        RecordId, CONVERSATION_MEMBERS_KEY, CONVERSATION_NAME_KEY, CONVERSATION_OWNER_KEY,
        CONVERSATION_RECORD_TYPE, MESSAGE_BODY_KEY, MESSAGE_CONVERSATION_KEY, MESSAGE_RECORD_TYPE,
        MESSAGE_SENDER_KEY, MESSAGE_SENT_AT_KEY, USER_NAME_KEY, USER_RECORD_TYPE,
    },
    protocol::{FieldValue, RawRecord},
};
use storage::MemoryRecordStore;

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("timestamp")
}

pub(crate) fn user_record(id: &str, name: &str) -> RawRecord {
    RawRecord::new(RecordId::from(id), USER_RECORD_TYPE)
        .with_field(USER_NAME_KEY, FieldValue::Text(name.into()))
}

pub(crate) fn conversation_record(id: &str, name: &str, owner: &str, members: &[&str]) -> RawRecord {
    RawRecord::new(RecordId::from(id), CONVERSATION_RECORD_TYPE)
        .with_field(CONVERSATION_NAME_KEY, FieldValue::Text(name.into()))
        .with_field(
            CONVERSATION_OWNER_KEY,
            FieldValue::Reference(RecordId::from(owner)),
        )
        .with_field(
            CONVERSATION_MEMBERS_KEY,
            FieldValue::ReferenceList(members.iter().map(|m| RecordId::from(*m)).collect()),
        )
}

pub(crate) fn message_record(
    id: &str,
    conversation: &str,
    sender: &str,
    body: &str,
    seconds: i64,
) -> RawRecord {
    RawRecord::new(RecordId::from(id), MESSAGE_RECORD_TYPE)
        .with_field(MESSAGE_BODY_KEY, FieldValue::Text(body.into()))
        .with_field(
            MESSAGE_CONVERSATION_KEY,
            FieldValue::Reference(RecordId::from(conversation)),
        )
        .with_field(MESSAGE_SENDER_KEY, FieldValue::Reference(RecordId::from(sender)))
        .with_field(MESSAGE_SENT_AT_KEY, FieldValue::Timestamp(at(seconds)))
}

/// Alice (signed in), Bob and Carol; Alice and Bob share "room", which has no
/// messages and whose message record type has never been created.
pub(crate) async fn seeded_store() -> Arc<MemoryRecordStore> {
    let store = Arc::new(MemoryRecordStore::new());
    store.insert_record(user_record("alice", "Alice")).await;
    store.insert_record(user_record("bob", "Bob")).await;
    store.insert_record(user_record("carol", "Carol")).await;
    store
        .insert_record(conversation_record("room", "Lunch", "alice", &["alice", "bob"]))
        .await;
    store.set_current_user(RecordId::from("alice")).await;
    store
}
