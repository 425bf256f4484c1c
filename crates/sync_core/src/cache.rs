//! Identity map of the entities the client has seen.
//!
//! All mutation goes through one lock so a completion that appends to a
//! conversation cannot interleave with another writer.

use std::collections::HashMap;

use shared::{
    domain::RecordId,
    model::{Conversation, Entity, Message, User},
};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct EntityCache {
    inner: RwLock<CacheState>,
}

#[derive(Default)]
struct CacheState {
    users: HashMap<RecordId, User>,
    conversations: HashMap<RecordId, Conversation>,
    messages: HashMap<RecordId, Message>,
}

/// Stores `incoming` unless that would replace a fetched copy with a stub.
fn upsert_into<T: Clone>(
    map: &mut HashMap<RecordId, T>,
    id: RecordId,
    incoming: T,
    is_fetched: impl Fn(&T) -> bool,
) -> T {
    match map.get(&id) {
        Some(existing) if is_fetched(existing) && !is_fetched(&incoming) => existing.clone(),
        _ => {
            map.insert(id, incoming.clone());
            incoming
        }
    }
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the copy the cache holds after the merge.
    pub async fn upsert(&self, entity: Entity) -> Entity {
        let mut guard = self.inner.write().await;
        match entity {
            Entity::User(user) => Entity::User(upsert_into(
                &mut guard.users,
                user.id.clone(),
                user,
                User::is_fetched,
            )),
            Entity::Conversation(conversation) => Entity::Conversation(upsert_into(
                &mut guard.conversations,
                conversation.id.clone(),
                conversation,
                Conversation::is_fetched,
            )),
            Entity::Message(message) => Entity::Message(upsert_into(
                &mut guard.messages,
                message.id.clone(),
                message,
                Message::is_fetched,
            )),
        }
    }

    pub async fn upsert_all(&self, entities: impl IntoIterator<Item = Entity>) {
        for entity in entities {
            self.upsert(entity).await;
        }
    }

    pub async fn user(&self, id: &RecordId) -> Option<User> {
        self.inner.read().await.users.get(id).cloned()
    }

    pub async fn conversation(&self, id: &RecordId) -> Option<Conversation> {
        self.inner.read().await.conversations.get(id).cloned()
    }

    pub async fn message(&self, id: &RecordId) -> Option<Message> {
        self.inner.read().await.messages.get(id).cloned()
    }

    /// Appends a confirmed message to a cached, fetched conversation.
    pub async fn append_message(&self, conversation_id: &RecordId, message: Message) -> bool {
        let mut guard = self.inner.write().await;
        guard.messages.insert(message.id.clone(), message.clone());
        guard
            .conversations
            .get_mut(conversation_id)
            .is_some_and(|conversation| conversation.append_message(message))
    }

    /// Adds `conversation` to a fetched user's list; stubs and unknown users are skipped.
    pub async fn add_conversation_to_user(
        &self,
        user_id: &RecordId,
        conversation: &Conversation,
    ) -> bool {
        let mut guard = self.inner.write().await;
        let Some(list) = guard
            .users
            .get_mut(user_id)
            .filter(|user| user.is_fetched())
            .and_then(|user| user.conversations.as_mut())
        else {
            return false;
        };
        if list.contains(conversation) {
            return false;
        }
        list.push(conversation.clone());
        true
    }

    pub async fn set_conversation_messages(
        &self,
        conversation_id: &RecordId,
        messages: Vec<Message>,
    ) -> Option<Conversation> {
        let mut guard = self.inner.write().await;
        for message in &messages {
            guard.messages.insert(message.id.clone(), message.clone());
        }
        let conversation = guard.conversations.get_mut(conversation_id)?;
        conversation.messages = Some(messages);
        Some(conversation.clone())
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
