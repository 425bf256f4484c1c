use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{
        RecordId, RecordKind, CONVERSATION_MEMBERS_KEY, CONVERSATION_NAME_KEY,
        CONVERSATION_OWNER_KEY, CONVERSATION_RECORD_TYPE, USER_NAME_KEY, USER_RECORD_TYPE,
    },
    error::{Partial, StoreError, SyncError},
    model::{Conversation, Entity, Message, User},
    protocol::{ChangeCursor, FieldValue, RawRecord, Subscription},
};
use storage::{CursorStore, RecordStore, SqliteCursorStore, StoreResult};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

pub mod cache;
pub mod config;
pub mod fetcher;
mod join;
pub mod outbox;
pub mod reconciler;
pub mod subscriptions;

pub use cache::EntityCache;
pub use config::{load_settings, SyncSettings};
pub use fetcher::RemoteCollectionFetcher;
pub use outbox::{Outbox, OutboxHandle};
pub use reconciler::{NotificationReconciler, NotificationReport, ReconcilerState};
pub use subscriptions::{SubscriptionManager, SubscriptionOutcome};

#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Hydrated messages from a notification cycle, awaiting acknowledgement.
    NewMessages(Vec<Message>),
    ConversationInvites(Vec<RecordId>),
    ConversationsUpdated(Vec<Conversation>),
    MessageStaged {
        conversation: RecordId,
        message: Message,
    },
    MessageSent {
        conversation: RecordId,
        message: Message,
    },
    MessageFailed {
        conversation: RecordId,
        message_id: RecordId,
        error: SyncError,
    },
    Error(SyncError),
}

#[async_trait]
pub trait SyncHandle: Send + Sync {
    async fn login(&self, discover_name: bool) -> Result<User, SyncError>;
    async fn fetch_conversations(
        &self,
        include_details: bool,
    ) -> Result<Partial<Vec<Conversation>>, SyncError>;
    async fn fetch_recent_messages(
        &self,
        conversation: &RecordId,
    ) -> Result<Partial<Vec<Message>>, SyncError>;
    async fn send_message(&self, conversation: &RecordId, body: &str)
        -> Result<Message, SyncError>;
    async fn retry_pending(&self, conversation: &RecordId) -> Result<Vec<Message>, SyncError>;
    async fn fetch_notification_changes(&self) -> Result<NotificationReport, SyncError>;
    async fn mark_messages_processed(&self, message_ids: &[RecordId]) -> usize;
    async fn reset_subscriptions(&self) -> Result<SubscriptionOutcome, SyncError>;
    fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent>;
}

/// Composition root: owns the cache, outbox, reconciler and subscription
/// manager for one signed-in account.
pub struct SyncClient {
    store: Arc<dyn RecordStore>,
    fetcher: Arc<RemoteCollectionFetcher>,
    cache: EntityCache,
    outbox: OutboxHandle,
    reconciler: NotificationReconciler,
    subscriptions: SubscriptionManager,
    current_user: RwLock<Option<User>>,
    settings: SyncSettings,
    events: broadcast::Sender<SyncEvent>,
}

fn into_kind<T>(
    entity: Entity,
    expected: RecordKind,
    pick: fn(Entity) -> Option<T>,
) -> Result<T, SyncError> {
    let actual = entity.kind();
    pick(entity).ok_or(SyncError::UnknownModelKind { expected, actual })
}

impl SyncClient {
    /// Must be called from within a Tokio runtime; the outbox task is spawned here.
    pub async fn new(
        store: Arc<dyn RecordStore>,
        cursor_store: Arc<dyn CursorStore>,
        settings: SyncSettings,
    ) -> Result<Arc<Self>, SyncError> {
        let timeout = settings.fetch_timeout();
        let fetcher = Arc::new(RemoteCollectionFetcher::new(store.clone(), timeout));
        let reconciler =
            NotificationReconciler::load(store.clone(), cursor_store, fetcher.clone()).await?;
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Ok(Arc::new(Self {
            subscriptions: SubscriptionManager::new(store.clone(), timeout),
            outbox: OutboxHandle::spawn(settings.outbox_capacity),
            cache: EntityCache::new(),
            current_user: RwLock::new(None),
            store,
            fetcher,
            reconciler,
            settings,
            events,
        }))
    }

    /// Opens the SQLite cursor store named by `settings` and builds a client on it.
    pub async fn connect(
        store: Arc<dyn RecordStore>,
        settings: SyncSettings,
    ) -> anyhow::Result<Arc<Self>> {
        let cursor_store = Arc::new(SqliteCursorStore::new(&settings.cursor_store_url()).await?);
        Ok(Self::new(store, cursor_store, settings).await?)
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub async fn current_user(&self) -> Option<User> {
        self.current_user.read().await.clone()
    }

    /// Resolves the signed-in user. A brand-new account without a name gets
    /// one from discovery when `discover_name` is set, else `User_<id>`.
    pub async fn login(&self, discover_name: bool) -> Result<User, SyncError> {
        let id = self.remote(self.store.current_user_id()).await?;
        let mut user = self.hydrate_user(&id).await?;

        if !user.is_fetched() && discover_name {
            let name = self
                .remote(self.store.discover_user_name(&id))
                .await?
                .unwrap_or_else(|| format!("User_{id}"));
            debug!(user_id = %id, name = %name, "sync: assigning discovered name");
            user = self.write_user_name(&id, name).await?;
        }

        self.cache.upsert(user.clone().into()).await;
        *self.current_user.write().await = Some(user.clone());
        info!(user_id = %user.id, fetched = user.is_fetched(), "sync: logged in");
        Ok(user)
    }

    pub async fn set_user_name(&self, name: &str) -> Result<User, SyncError> {
        let current = self.require_current_user().await?;
        let user = self.write_user_name(&current.id, name.to_string()).await?;
        self.cache.upsert(user.clone().into()).await;
        *self.current_user.write().await = Some(user.clone());
        info!(user_id = %user.id, "sync: user name updated");
        Ok(user)
    }

    /// Discoverable contacts other than the current user, hydrated.
    pub async fn discover_contacts(&self) -> Result<Partial<Vec<User>>, SyncError> {
        let ids = self.remote(self.store.discover_contacts()).await?;
        let current = self.current_user_id().await;
        let stubs: Vec<Entity> = ids
            .into_iter()
            .filter(|id| Some(id) != current.as_ref())
            .map(|id| User::stub(id).into())
            .collect();
        let fetched = self.fetcher.fetch_collection(&stubs).await?;
        self.cache.upsert_all(fetched.value.iter().cloned()).await;
        Ok(fetched.map(|entities| entities.into_iter().filter_map(Entity::into_user).collect()))
    }

    pub async fn discover_user_by_email(&self, email: &str) -> Result<User, SyncError> {
        let id = self.remote(self.store.discover_user_by_email(email)).await?;
        Ok(User::stub(id))
    }

    /// Creates a conversation owned by the current user with `members` plus the owner.
    pub async fn create_conversation(
        &self,
        name: &str,
        members: &[User],
    ) -> Result<Conversation, SyncError> {
        let owner = self.require_current_user().await?;
        let mut participants: Vec<User> = Vec::with_capacity(members.len() + 1);
        for member in members {
            if member.id != owner.id && !participants.contains(member) {
                participants.push(member.clone());
            }
        }
        participants.push(owner.clone());

        let id = RecordId::generate();
        let record = RawRecord::new(id.clone(), CONVERSATION_RECORD_TYPE)
            .with_field(CONVERSATION_NAME_KEY, FieldValue::Text(name.to_string()))
            .with_field(
                CONVERSATION_OWNER_KEY,
                FieldValue::Reference(owner.id.clone()),
            )
            .with_field(
                CONVERSATION_MEMBERS_KEY,
                FieldValue::ReferenceList(participants.iter().map(|u| u.id.clone()).collect()),
            );
        self.remote(self.store.save_records(vec![record])).await?;

        let conversation = Conversation {
            id,
            name: Some(name.to_string()),
            owner: Some(owner),
            members: Some(participants),
            messages: Some(Vec::new()),
        };
        self.cache.upsert(conversation.clone().into()).await;
        for member in conversation.members.as_deref().unwrap_or_default() {
            self.cache
                .add_conversation_to_user(&member.id, &conversation)
                .await;
        }
        if let Some(list) = self
            .current_user
            .write()
            .await
            .as_mut()
            .and_then(|user| user.conversations.as_mut())
        {
            if !list.contains(&conversation) {
                list.push(conversation.clone());
            }
        }

        info!(conversation_id = %conversation.id, "sync: conversation created");
        self.emit(SyncEvent::ConversationsUpdated(vec![conversation.clone()]));
        Ok(conversation)
    }

    /// Refreshes the current user's conversations; `include_details` also
    /// hydrates messages, owner and members of each one.
    pub async fn fetch_conversations(
        &self,
        include_details: bool,
    ) -> Result<Partial<Vec<Conversation>>, SyncError> {
        let current = self.require_fetched_user().await?;
        let mut user = self.hydrate_user(&current.id).await?;

        let stubs: Vec<Entity> = user
            .conversations
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(Entity::from)
            .collect();
        let fetched = self.fetcher.fetch_collection(&stubs).await?;
        let mut error = fetched.error;
        let mut conversations: Vec<Conversation> = fetched
            .value
            .into_iter()
            .filter_map(Entity::into_conversation)
            .collect();

        if include_details && !conversations.is_empty() {
            match self
                .fetcher
                .hydrate_conversation_details(conversations.clone())
                .await
            {
                Ok(details) => {
                    conversations = details.value;
                    error = error.or(details.error);
                }
                Err(err) => {
                    warn!(error = %err, "sync: conversation details unavailable");
                    error.get_or_insert(err);
                }
            }
        }

        self.cache
            .upsert_all(conversations.iter().cloned().map(Entity::from))
            .await;
        user.conversations = Some(conversations.clone());
        self.cache.upsert(user.clone().into()).await;
        *self.current_user.write().await = Some(user);

        debug!(count = conversations.len(), partial = error.is_some(), "sync: conversations fetched");
        self.emit(SyncEvent::ConversationsUpdated(conversations.clone()));
        Ok(Partial {
            value: conversations,
            error,
        })
    }

    /// Refreshes the conversation, hydrates its trailing `limit` messages
    /// (all when `None`) and stores them, ordered by send time, as its
    /// message list.
    pub async fn fetch_messages(
        &self,
        conversation_id: &RecordId,
        limit: Option<usize>,
    ) -> Result<Partial<Vec<Message>>, SyncError> {
        let entity = self
            .fetcher
            .hydrate_entity(&Conversation::stub(conversation_id.clone()).into())
            .await?;
        let conversation = into_kind(entity, RecordKind::Conversation, Entity::into_conversation)?;
        let Some(references) = conversation.messages.clone().filter(|_| conversation.is_fetched())
        else {
            return Err(SyncError::EntityNotFetched {
                kind: RecordKind::Conversation,
                id: conversation.id,
            });
        };

        let start = limit.map_or(0, |limit| references.len().saturating_sub(limit));
        let fetched = self.fetcher.fetch_messages(&references[start..]).await?;
        self.cache.upsert(conversation.into()).await;
        self.cache
            .set_conversation_messages(conversation_id, fetched.value.clone())
            .await;
        Ok(fetched)
    }

    pub async fn fetch_recent_messages(
        &self,
        conversation_id: &RecordId,
    ) -> Result<Partial<Vec<Message>>, SyncError> {
        self.fetch_messages(conversation_id, Some(self.settings.message_page_size))
            .await
    }

    /// Sends `body` as the current user. Validation happens before any
    /// remote write; a failed save leaves the message in the outbox.
    pub async fn send_message(
        &self,
        conversation_id: &RecordId,
        body: &str,
    ) -> Result<Message, SyncError> {
        let sender = self.require_fetched_user().await?;
        let is_member = sender.belongs_to(conversation_id)
            || self
                .cache
                .conversation(conversation_id)
                .await
                .is_some_and(|c| c.has_member(&sender.id));
        if !is_member {
            return Err(SyncError::WrongConversationMembership {
                user: sender.id,
                conversation: conversation_id.clone(),
            });
        }

        let message = Message::compose(sender.id, conversation_id.clone(), body, Utc::now());
        let record = message.to_record()?;
        self.stage(conversation_id, &message).await?;
        self.deliver(conversation_id, message, record).await
    }

    /// Re-sends every pending message of a conversation in outbox order,
    /// stopping at the first failure. Pending messages keep their order.
    pub async fn retry_pending(
        &self,
        conversation_id: &RecordId,
    ) -> Result<Vec<Message>, SyncError> {
        let pending = self.outbox.snapshot(conversation_id.clone()).await?;
        let mut sent = Vec::with_capacity(pending.pending().len());
        for message in pending.pending() {
            let record = message.to_record()?;
            sent.push(self.deliver(conversation_id, message.clone(), record).await?);
        }
        Ok(sent)
    }

    pub async fn outbox(&self, conversation_id: &RecordId) -> Result<Outbox, SyncError> {
        self.outbox.snapshot(conversation_id.clone()).await
    }

    pub async fn set_draft(&self, conversation_id: &RecordId, draft: &str) -> Result<(), SyncError> {
        self.outbox.set_draft(conversation_id.clone(), draft).await
    }

    pub async fn discard_pending(&self, conversation_id: &RecordId) -> Result<(), SyncError> {
        self.outbox.delete_all(conversation_id.clone()).await
    }

    /// Runs a notification cycle and publishes its results.
    pub async fn fetch_notification_changes(&self) -> Result<NotificationReport, SyncError> {
        let report = match self.reconciler.fetch_changes().await {
            Ok(report) => report,
            Err(err) => {
                self.emit(SyncEvent::Error(err.clone()));
                return Err(err);
            }
        };

        for message in &report.messages {
            match message.conversation_id() {
                Some(conversation_id) => {
                    self.cache
                        .append_message(conversation_id, message.clone())
                        .await;
                }
                None => {
                    self.cache.upsert(message.clone().into()).await;
                }
            }
        }
        if !report.messages.is_empty() {
            self.emit(SyncEvent::NewMessages(report.messages.clone()));
        }
        if !report.conversation_invites.is_empty() {
            self.emit(SyncEvent::ConversationInvites(
                report.conversation_invites.clone(),
            ));
        }
        if let Some(err) = &report.error {
            self.emit(SyncEvent::Error(err.clone()));
        }
        Ok(report)
    }

    pub async fn mark_messages_processed(&self, message_ids: &[RecordId]) -> usize {
        self.reconciler.mark_processed(message_ids).await
    }

    pub async fn change_cursor(&self) -> Option<ChangeCursor> {
        self.reconciler.cursor().await
    }

    pub async fn reset_change_cursor(&self) -> Result<(), SyncError> {
        self.reconciler.reset_cursor().await
    }

    /// Registers subscriptions for the current user; existing ones are tolerated.
    pub async fn subscribe_to_changes(&self) -> Result<SubscriptionOutcome, SyncError> {
        let user = self.require_fetched_user().await?;
        self.subscriptions.ensure_subscribed(&user).await
    }

    pub async fn reset_subscriptions(&self) -> Result<SubscriptionOutcome, SyncError> {
        self.subscriptions.clear_all().await?;
        self.subscribe_to_changes().await
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>, SyncError> {
        self.subscriptions.list().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<SyncEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    async fn stage(&self, conversation_id: &RecordId, message: &Message) -> Result<(), SyncError> {
        self.outbox
            .add_message(conversation_id.clone(), message.clone())
            .await?;
        self.emit(SyncEvent::MessageStaged {
            conversation: conversation_id.clone(),
            message: message.clone(),
        });
        Ok(())
    }

    /// Saves a staged message; it leaves the outbox only once the store confirms it.
    async fn deliver(
        &self,
        conversation_id: &RecordId,
        message: Message,
        record: RawRecord,
    ) -> Result<Message, SyncError> {
        if let Err(err) = self.remote(self.store.save_records(vec![record])).await {
            warn!(
                conversation_id = %conversation_id,
                message_id = %message.id,
                error = %err,
                "sync: send failed, message kept in outbox"
            );
            self.emit(SyncEvent::MessageFailed {
                conversation: conversation_id.clone(),
                message_id: message.id.clone(),
                error: err.clone(),
            });
            return Err(err);
        }

        self.outbox
            .delete_message(conversation_id.clone(), message.id.clone())
            .await?;
        self.cache
            .append_message(conversation_id, message.clone())
            .await;
        info!(conversation_id = %conversation_id, message_id = %message.id, "sync: message sent");
        self.emit(SyncEvent::MessageSent {
            conversation: conversation_id.clone(),
            message: message.clone(),
        });
        Ok(message)
    }

    async fn hydrate_user(&self, id: &RecordId) -> Result<User, SyncError> {
        let entity = self
            .fetcher
            .hydrate_entity(&User::stub(id.clone()).into())
            .await?;
        into_kind(entity, RecordKind::User, Entity::into_user)
    }

    async fn write_user_name(&self, id: &RecordId, name: String) -> Result<User, SyncError> {
        let mut record = match self.remote(self.store.fetch_record(id)).await {
            Ok(record) => record,
            Err(SyncError::NotFound(_))
            | Err(SyncError::Remote(StoreError::RecordTypeMissing(_))) => {
                RawRecord::new(id.clone(), USER_RECORD_TYPE)
            }
            Err(err) => return Err(err),
        };
        record.set(USER_NAME_KEY, FieldValue::Text(name));
        self.remote(self.store.save_records(vec![record])).await?;
        self.hydrate_user(id).await
    }

    async fn current_user_id(&self) -> Option<RecordId> {
        self.current_user.read().await.as_ref().map(|u| u.id.clone())
    }

    async fn require_current_user(&self) -> Result<User, SyncError> {
        self.current_user
            .read()
            .await
            .clone()
            .ok_or(SyncError::Remote(StoreError::NotAuthenticated))
    }

    async fn require_fetched_user(&self) -> Result<User, SyncError> {
        let user = self.require_current_user().await?;
        if user.is_fetched() {
            Ok(user)
        } else {
            Err(SyncError::EntityNotFetched {
                kind: RecordKind::User,
                id: user.id,
            })
        }
    }

    async fn remote<T>(
        &self,
        operation: impl Future<Output = StoreResult<T>>,
    ) -> Result<T, SyncError> {
        let timeout = self.fetcher.timeout();
        match tokio::time::timeout(timeout, operation).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Timeout(timeout)),
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl SyncHandle for Arc<SyncClient> {
    async fn login(&self, discover_name: bool) -> Result<User, SyncError> {
        SyncClient::login(self, discover_name).await
    }

    async fn fetch_conversations(
        &self,
        include_details: bool,
    ) -> Result<Partial<Vec<Conversation>>, SyncError> {
        SyncClient::fetch_conversations(self, include_details).await
    }

    async fn fetch_recent_messages(
        &self,
        conversation: &RecordId,
    ) -> Result<Partial<Vec<Message>>, SyncError> {
        SyncClient::fetch_recent_messages(self, conversation).await
    }

    async fn send_message(
        &self,
        conversation: &RecordId,
        body: &str,
    ) -> Result<Message, SyncError> {
        SyncClient::send_message(self, conversation, body).await
    }

    async fn retry_pending(&self, conversation: &RecordId) -> Result<Vec<Message>, SyncError> {
        SyncClient::retry_pending(self, conversation).await
    }

    async fn fetch_notification_changes(&self) -> Result<NotificationReport, SyncError> {
        SyncClient::fetch_notification_changes(self).await
    }

    async fn mark_messages_processed(&self, message_ids: &[RecordId]) -> usize {
        SyncClient::mark_messages_processed(self, message_ids).await
    }

    async fn reset_subscriptions(&self) -> Result<SubscriptionOutcome, SyncError> {
        SyncClient::reset_subscriptions(self).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        SyncClient::subscribe_events(self)
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
