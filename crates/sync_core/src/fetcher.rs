//! Hydrates stubs into fetched entities against a [`RecordStore`].
//!
//! Derived lists (a conversation's messages, a user's conversations) are
//! rebuilt from reverse reference queries. Conversation details fan out per
//! conversation (messages, owner, members) and again across conversations;
//! both levels are joined with [`gather`].

use std::{future::Future, sync::Arc, time::Duration};

use shared::{
    domain::{
        RecordId, RecordKind, CONVERSATION_MEMBERS_KEY, CONVERSATION_RECORD_TYPE,
        MESSAGE_CONVERSATION_KEY, MESSAGE_RECORD_TYPE, MESSAGE_SENT_AT_KEY,
    },
    error::{Partial, SyncError},
    model::{Conversation, Entity, Message, User},
    protocol::{QueryPredicate, RecordQuery},
};
use storage::RecordStore;
use tracing::{debug, warn};

use crate::join::gather;

pub struct RemoteCollectionFetcher {
    store: Arc<dyn RecordStore>,
    timeout: Duration,
}

enum DetailRequest {
    Messages(Vec<Message>),
    Owner(User),
    Members(Vec<User>),
}

enum Detail {
    Messages(Vec<Message>),
    Owner(User),
    Members(Vec<User>),
}

/// Surfaces the error alone when nothing succeeded.
fn settle<T>(values: Vec<T>, error: Option<SyncError>) -> Result<Partial<Vec<T>>, SyncError> {
    match error {
        Some(err) if values.is_empty() => Err(err),
        error => Ok(Partial { value: values, error }),
    }
}

fn sort_by_sent_at(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id)));
}

impl RemoteCollectionFetcher {
    pub fn new(store: Arc<dyn RecordStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Hydrates every entity in `entities` (mixed kinds allowed).
    ///
    /// Items that could not be fetched, or whose record is of another kind
    /// than their stub, are left out and reported through the partial error. Items whose record type has never been created come
    /// back as the stubs they were.
    pub async fn fetch_collection(
        &self,
        entities: &[Entity],
    ) -> Result<Partial<Vec<Entity>>, SyncError> {
        self.bounded(self.collect(entities)).await
    }

    pub async fn hydrate_entity(&self, entity: &Entity) -> Result<Entity, SyncError> {
        self.bounded(self.hydrate(entity)).await
    }

    /// Hydrates message stubs and returns them ordered by send time.
    pub async fn fetch_messages(
        &self,
        stubs: &[Message],
    ) -> Result<Partial<Vec<Message>>, SyncError> {
        self.bounded(self.collect_messages(stubs)).await
    }

    /// Hydrates the messages, owner and members of each fetched conversation.
    pub async fn hydrate_conversation_details(
        &self,
        conversations: Vec<Conversation>,
    ) -> Result<Partial<Vec<Conversation>>, SyncError> {
        self.bounded(async {
            let gathered = gather(
                conversations
                    .into_iter()
                    .map(|conversation| self.conversation_details(conversation)),
            )
            .await;
            let first_error = gathered.first_error.clone();
            if let Some(err) = &first_error {
                warn!(error = %err, "fetch: conversation details incomplete");
            }
            settle(gathered.successes(), first_error)
        })
        .await
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "fetch: timed out");
                Err(SyncError::Timeout(self.timeout))
            }
        }
    }

    async fn collect(&self, entities: &[Entity]) -> Result<Partial<Vec<Entity>>, SyncError> {
        if entities.is_empty() {
            return Ok(Partial::complete(Vec::new()));
        }
        let ids: Vec<RecordId> = entities.iter().map(|e| e.id().clone()).collect();
        debug!(count = ids.len(), "fetch: batch fetching records");
        let batch = self.store.fetch_records(&ids).await?;

        let mut first_error = None;
        let mut unborn = Vec::new();
        let mut failed = Vec::new();
        for (id, err) in batch.failures {
            if err.is_first_time_record_type_missing() {
                unborn.extend(entities.iter().filter(|e| e.id() == &id).cloned());
            } else {
                failed.push(id);
            }
        }
        if !failed.is_empty() {
            warn!(failed = failed.len(), "fetch: batch partially failed");
            first_error = Some(SyncError::PartialBatchFailure { failed });
        }

        let mut hydrated = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            let requested = entities.iter().find(|e| e.id() == &record.id).map(Entity::kind);
            let decoded = match requested {
                Some(kind) => Entity::from_record_as(record, kind),
                None => Entity::from_record(record),
            };
            match decoded {
                Ok(entity) => hydrated.push(entity),
                Err(err) => {
                    warn!(record_id = %record.id, error = %err, "fetch: skipping record");
                    first_error.get_or_insert(err);
                }
            }
        }

        let gathered = gather(hydrated.into_iter().map(|entity| self.expand(entity))).await;
        if first_error.is_none() {
            first_error = gathered.first_error.clone();
        }
        let mut values = gathered.successes();
        values.extend(unborn);
        settle(values, first_error)
    }

    async fn hydrate(&self, entity: &Entity) -> Result<Entity, SyncError> {
        let record = match self.store.fetch_record(entity.id()).await {
            Ok(record) => record,
            Err(err) if err.is_first_time_record_type_missing() => {
                debug!(record_id = %entity.id(), "fetch: record type not created yet");
                return Ok(entity.clone());
            }
            Err(err) => return Err(err.into()),
        };
        let hydrated = Entity::from_record_as(&record, entity.kind())?;
        Ok(self.expand(hydrated).await?.into_value())
    }

    async fn collect_messages(
        &self,
        stubs: &[Message],
    ) -> Result<Partial<Vec<Message>>, SyncError> {
        let entities: Vec<Entity> = stubs.iter().cloned().map(Entity::Message).collect();
        Ok(self.collect(&entities).await?.map(|entities| {
            let mut messages: Vec<Message> =
                entities.into_iter().filter_map(Entity::into_message).collect();
            sort_by_sent_at(&mut messages);
            messages
        }))
    }

    /// Fills in the derived list of a freshly decoded entity.
    async fn expand(&self, entity: Entity) -> Result<Partial<Entity>, SyncError> {
        match entity {
            Entity::Conversation(mut conversation) => {
                let ids = self
                    .derived_references(&RecordQuery {
                        record_type: MESSAGE_RECORD_TYPE.into(),
                        predicate: QueryPredicate::ReferenceEquals {
                            field: MESSAGE_CONVERSATION_KEY.into(),
                            target: conversation.id.clone(),
                        },
                        sort_ascending_by: Some(MESSAGE_SENT_AT_KEY.into()),
                    })
                    .await?;
                conversation.messages = Some(ids.into_iter().map(Message::stub).collect());
                Ok(Partial::complete(conversation.into()))
            }
            Entity::User(mut user) => {
                let ids = self
                    .derived_references(&RecordQuery {
                        record_type: CONVERSATION_RECORD_TYPE.into(),
                        predicate: QueryPredicate::ReferenceListContains {
                            field: CONVERSATION_MEMBERS_KEY.into(),
                            target: user.id.clone(),
                        },
                        sort_ascending_by: None,
                    })
                    .await?;
                user.conversations = Some(ids.into_iter().map(Conversation::stub).collect());
                Ok(Partial::complete(user.into()))
            }
            message @ Entity::Message(_) => Ok(Partial::complete(message)),
        }
    }

    async fn derived_references(&self, query: &RecordQuery) -> Result<Vec<RecordId>, SyncError> {
        match self.store.query_references(query).await {
            Ok(ids) => Ok(ids),
            Err(err) if err.is_first_time_record_type_missing() => {
                debug!(record_type = %query.record_type, "fetch: reverse query on uncreated type");
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn conversation_details(
        &self,
        mut conversation: Conversation,
    ) -> Result<Partial<Conversation>, SyncError> {
        let (Some(messages), Some(owner), Some(members)) = (
            conversation.messages.clone(),
            conversation.owner.clone(),
            conversation.members.clone(),
        ) else {
            return Err(SyncError::EntityNotFetched {
                kind: RecordKind::Conversation,
                id: conversation.id,
            });
        };

        let gathered = gather([
            DetailRequest::Messages(messages),
            DetailRequest::Owner(owner),
            DetailRequest::Members(members),
        ]
        .into_iter()
        .map(|request| self.detail(request)))
        .await;

        for detail in gathered.slots.into_iter().flatten() {
            match detail {
                Detail::Messages(messages) => conversation.messages = Some(messages),
                Detail::Owner(owner) => conversation.owner = Some(owner),
                Detail::Members(members) => conversation.members = Some(members),
            }
        }
        if let Some(err) = &gathered.first_error {
            debug!(conversation_id = %conversation.id, error = %err, "fetch: detail sub-fetch failed");
        }
        Ok(Partial {
            value: conversation,
            error: gathered.first_error,
        })
    }

    async fn detail(&self, request: DetailRequest) -> Result<Partial<Detail>, SyncError> {
        match request {
            DetailRequest::Messages(stubs) => Ok(self
                .collect_messages(&stubs)
                .await?
                .map(Detail::Messages)),
            DetailRequest::Owner(owner) => {
                let hydrated = self.hydrate(&Entity::User(owner.clone())).await?;
                Ok(Partial::complete(Detail::Owner(
                    hydrated.into_user().unwrap_or(owner),
                )))
            }
            DetailRequest::Members(members) => {
                let entities: Vec<Entity> = members.into_iter().map(Entity::User).collect();
                Ok(self.collect(&entities).await?.map(|entities| {
                    Detail::Members(entities.into_iter().filter_map(Entity::into_user).collect())
                }))
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/fetcher_tests.rs"]
mod tests;
