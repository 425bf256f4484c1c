//! Local copies of remote entities.
//!
//! Every entity is either a *stub* (identifier only) or *fetched* (every
//! required field of its kind present). Equality and hashing look at the
//! record identifier only, so a stub and its hydrated copy compare equal.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        RecordId, RecordKind, CONVERSATION_MEMBERS_KEY, CONVERSATION_MESSAGES_KEY,
        CONVERSATION_NAME_KEY, CONVERSATION_OWNER_KEY, MESSAGE_BODY_KEY, MESSAGE_CONVERSATION_KEY,
        MESSAGE_SENDER_KEY, MESSAGE_SENT_AT_KEY, USER_CONVERSATIONS_KEY, USER_NAME_KEY,
    },
    error::SyncError,
    protocol::{FieldValue, RawRecord},
};

macro_rules! identity_eq {
    ($name:ident) => {
        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.id == other.id
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.id.hash(state);
            }
        }
    };
}

fn ensure_kind(record: &RawRecord, expected: RecordKind) -> Result<(), SyncError> {
    if record.kind() == Some(expected) {
        Ok(())
    } else {
        Err(SyncError::TypeMismatch {
            id: record.id.clone(),
            expected,
            actual: record.record_type.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: RecordId,
    pub name: Option<String>,
    pub conversations: Option<Vec<Conversation>>,
}

identity_eq!(User);

impl User {
    pub fn stub(id: RecordId) -> Self {
        Self {
            id,
            name: None,
            conversations: None,
        }
    }

    pub fn from_record(record: &RawRecord) -> Result<Self, SyncError> {
        ensure_kind(record, RecordKind::User)?;
        Ok(Self {
            id: record.id.clone(),
            name: record.text(USER_NAME_KEY).map(str::to_string),
            conversations: Some(
                record
                    .reference_list(USER_CONVERSATIONS_KEY)
                    .unwrap_or_default()
                    .iter()
                    .cloned()
                    .map(Conversation::stub)
                    .collect(),
            ),
        })
    }

    pub fn is_fetched(&self) -> bool {
        self.name.is_some() && self.conversations.is_some()
    }

    pub fn belongs_to(&self, conversation_id: &RecordId) -> bool {
        self.conversations
            .as_deref()
            .is_some_and(|list| list.iter().any(|c| &c.id == conversation_id))
    }

    /// Replaces every field at once with those of a hydrated copy.
    pub fn merge_from(&mut self, fetched: Entity) -> Result<(), SyncError> {
        match fetched {
            Entity::User(user) if user.id == self.id => {
                self.name = user.name;
                self.conversations = user.conversations;
                Ok(())
            }
            Entity::User(user) => Err(SyncError::NotFound(user.id)),
            other => Err(SyncError::UnknownModelKind {
                expected: RecordKind::User,
                actual: other.kind(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: RecordId,
    pub name: Option<String>,
    pub owner: Option<User>,
    pub members: Option<Vec<User>>,
    pub messages: Option<Vec<Message>>,
}

identity_eq!(Conversation);

impl Conversation {
    pub fn stub(id: RecordId) -> Self {
        Self {
            id,
            name: None,
            owner: None,
            members: None,
            messages: None,
        }
    }

    pub fn from_record(record: &RawRecord) -> Result<Self, SyncError> {
        ensure_kind(record, RecordKind::Conversation)?;
        let references = |key: &str| -> Vec<RecordId> {
            record.reference_list(key).unwrap_or_default().to_vec()
        };
        Ok(Self {
            id: record.id.clone(),
            name: record.text(CONVERSATION_NAME_KEY).map(str::to_string),
            owner: record
                .reference(CONVERSATION_OWNER_KEY)
                .cloned()
                .map(User::stub),
            members: Some(
                references(CONVERSATION_MEMBERS_KEY)
                    .into_iter()
                    .map(User::stub)
                    .collect(),
            ),
            messages: Some(
                references(CONVERSATION_MESSAGES_KEY)
                    .into_iter()
                    .map(Message::stub)
                    .collect(),
            ),
        })
    }

    pub fn is_fetched(&self) -> bool {
        self.name.is_some()
            && self.owner.is_some()
            && self.members.is_some()
            && self.messages.is_some()
    }

    pub fn has_member(&self, user_id: &RecordId) -> bool {
        self.members
            .as_deref()
            .is_some_and(|members| members.iter().any(|m| &m.id == user_id))
    }

    /// The fetched message with the greatest send time.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages
            .as_deref()?
            .iter()
            .filter(|m| m.is_fetched())
            .fold(None, |latest: Option<&Message>, candidate| match latest {
                Some(current) if !current.precedes(candidate) => Some(current),
                _ => Some(candidate),
            })
    }

    /// The conversation name, except for two-member conversations where the
    /// other member's name is preferred when known.
    pub fn display_name(&self, current_user: Option<&RecordId>) -> Option<&str> {
        if !self.is_fetched() {
            return None;
        }
        let members = self.members.as_deref().unwrap_or_default();
        if members.len() != 2 {
            return self.name.as_deref();
        }
        let Some(current_user) = current_user else {
            return self.name.as_deref();
        };
        let mut others = members.iter().filter(|m| &m.id != current_user);
        match (others.next(), others.next()) {
            (Some(other), None) => other.name.as_deref().or(self.name.as_deref()),
            _ => self.name.as_deref(),
        }
    }

    /// Appends a confirmed message unless an equal one is already listed.
    /// Returns whether the list changed. Stubs are left untouched.
    pub fn append_message(&mut self, message: Message) -> bool {
        let Some(messages) = self.messages.as_mut() else {
            return false;
        };
        if messages.contains(&message) {
            return false;
        }
        messages.push(message);
        true
    }

    pub fn merge_from(&mut self, fetched: Entity) -> Result<(), SyncError> {
        match fetched {
            Entity::Conversation(conversation) if conversation.id == self.id => {
                self.name = conversation.name;
                self.owner = conversation.owner;
                self.members = conversation.members;
                self.messages = conversation.messages;
                Ok(())
            }
            Entity::Conversation(conversation) => Err(SyncError::NotFound(conversation.id)),
            other => Err(SyncError::UnknownModelKind {
                expected: RecordKind::Conversation,
                actual: other.kind(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: RecordId,
    pub sender: Option<User>,
    pub conversation: Option<Conversation>,
    pub body: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

identity_eq!(Message);

impl Message {
    pub fn stub(id: RecordId) -> Self {
        Self {
            id,
            sender: None,
            conversation: None,
            body: None,
            sent_at: None,
        }
    }

    /// A locally constructed message that has not been saved yet.
    pub fn compose(
        sender: RecordId,
        conversation: RecordId,
        body: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecordId::generate(),
            sender: Some(User::stub(sender)),
            conversation: Some(Conversation::stub(conversation)),
            body: Some(body.into()),
            sent_at: Some(sent_at),
        }
    }

    pub fn from_record(record: &RawRecord) -> Result<Self, SyncError> {
        ensure_kind(record, RecordKind::Message)?;
        Ok(Self {
            id: record.id.clone(),
            sender: record.reference(MESSAGE_SENDER_KEY).cloned().map(User::stub),
            conversation: record
                .reference(MESSAGE_CONVERSATION_KEY)
                .cloned()
                .map(Conversation::stub),
            body: record.text(MESSAGE_BODY_KEY).map(str::to_string),
            sent_at: record.timestamp(MESSAGE_SENT_AT_KEY),
        })
    }

    pub fn to_record(&self) -> Result<RawRecord, SyncError> {
        let (Some(sender), Some(conversation), Some(body), Some(sent_at)) = (
            self.sender.as_ref(),
            self.conversation.as_ref(),
            self.body.as_ref(),
            self.sent_at,
        ) else {
            return Err(SyncError::EntityNotFetched {
                kind: RecordKind::Message,
                id: self.id.clone(),
            });
        };
        Ok(RawRecord::new(self.id.clone(), RecordKind::Message.record_type())
            .with_field(MESSAGE_BODY_KEY, FieldValue::Text(body.clone()))
            .with_field(MESSAGE_SENDER_KEY, FieldValue::Reference(sender.id.clone()))
            .with_field(
                MESSAGE_CONVERSATION_KEY,
                FieldValue::Reference(conversation.id.clone()),
            )
            .with_field(MESSAGE_SENT_AT_KEY, FieldValue::Timestamp(sent_at)))
    }

    pub fn is_fetched(&self) -> bool {
        self.sender.is_some()
            && self.conversation.is_some()
            && self.body.is_some()
            && self.sent_at.is_some()
    }

    /// True iff both messages are fetched and `self` was sent strictly before `other`.
    pub fn precedes(&self, other: &Message) -> bool {
        match (self.is_fetched(), other.is_fetched(), self.sent_at, other.sent_at) {
            (true, true, Some(lhs), Some(rhs)) => lhs < rhs,
            _ => false,
        }
    }

    pub fn sender_id(&self) -> Option<&RecordId> {
        self.sender.as_ref().map(|s| &s.id)
    }

    pub fn conversation_id(&self) -> Option<&RecordId> {
        self.conversation.as_ref().map(|c| &c.id)
    }

    /// Stubs count as incoming until their sender is known.
    pub fn is_incoming(&self, current_user: Option<&RecordId>) -> bool {
        match (self.is_fetched(), self.sender_id(), current_user) {
            (true, Some(sender), Some(current)) => sender != current,
            _ => true,
        }
    }

    pub fn merge_from(&mut self, fetched: Entity) -> Result<(), SyncError> {
        match fetched {
            Entity::Message(message) if message.id == self.id => {
                self.sender = message.sender;
                self.conversation = message.conversation;
                self.body = message.body;
                self.sent_at = message.sent_at;
                Ok(())
            }
            Entity::Message(message) => Err(SyncError::NotFound(message.id)),
            other => Err(SyncError::UnknownModelKind {
                expected: RecordKind::Message,
                actual: other.kind(),
            }),
        }
    }
}

/// Any of the three entity kinds, produced directly by hydration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entity", rename_all = "snake_case")]
pub enum Entity {
    User(User),
    Conversation(Conversation),
    Message(Message),
}

impl Entity {
    pub fn stub(kind: RecordKind, id: RecordId) -> Self {
        match kind {
            RecordKind::User => Self::User(User::stub(id)),
            RecordKind::Conversation => Self::Conversation(Conversation::stub(id)),
            RecordKind::Message => Self::Message(Message::stub(id)),
        }
    }

    pub fn from_record(record: &RawRecord) -> Result<Self, SyncError> {
        match record.kind() {
            Some(RecordKind::User) => User::from_record(record).map(Self::User),
            Some(RecordKind::Conversation) => {
                Conversation::from_record(record).map(Self::Conversation)
            }
            Some(RecordKind::Message) => Message::from_record(record).map(Self::Message),
            None => Err(SyncError::UnknownRecordKind(record.record_type.clone())),
        }
    }

    /// Decodes `record` as the kind of the stub that asked for it.
    pub fn from_record_as(record: &RawRecord, expected: RecordKind) -> Result<Self, SyncError> {
        if record.kind().is_none() {
            return Err(SyncError::UnknownRecordKind(record.record_type.clone()));
        }
        match expected {
            RecordKind::User => User::from_record(record).map(Self::User),
            RecordKind::Conversation => Conversation::from_record(record).map(Self::Conversation),
            RecordKind::Message => Message::from_record(record).map(Self::Message),
        }
    }

    pub fn id(&self) -> &RecordId {
        match self {
            Self::User(user) => &user.id,
            Self::Conversation(conversation) => &conversation.id,
            Self::Message(message) => &message.id,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Self::User(_) => RecordKind::User,
            Self::Conversation(_) => RecordKind::Conversation,
            Self::Message(_) => RecordKind::Message,
        }
    }

    pub fn is_fetched(&self) -> bool {
        match self {
            Self::User(user) => user.is_fetched(),
            Self::Conversation(conversation) => conversation.is_fetched(),
            Self::Message(message) => message.is_fetched(),
        }
    }

    pub fn all_fetched<'a>(entities: impl IntoIterator<Item = &'a Entity>) -> bool {
        entities.into_iter().all(Entity::is_fetched)
    }

    pub fn into_user(self) -> Option<User> {
        match self {
            Self::User(user) => Some(user),
            _ => None,
        }
    }

    pub fn into_conversation(self) -> Option<Conversation> {
        match self {
            Self::Conversation(conversation) => Some(conversation),
            _ => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }
}

impl From<User> for Entity {
    fn from(value: User) -> Self {
        Self::User(value)
    }
}

impl From<Conversation> for Entity {
    fn from(value: Conversation) -> Self {
        Self::Conversation(value)
    }
}

impl From<Message> for Entity {
    fn from(value: Message) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
#[path = "tests/model_tests.rs"]
mod tests;
