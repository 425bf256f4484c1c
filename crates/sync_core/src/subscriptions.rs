//! Standing interest registered with the remote store.
//!
//! One `M-<conversation>` subscription per conversation of the user fires on
//! new messages; one `G-<user>` subscription fires when the user is added to
//! a conversation.

use std::{sync::Arc, time::Duration};

use shared::{
    domain::{
        RecordId, RecordKind, CONVERSATION_MEMBERS_KEY, CONVERSATION_RECORD_TYPE,
        MESSAGE_CONVERSATION_KEY, MESSAGE_RECORD_TYPE,
    },
    error::{StoreError, SyncError},
    model::{Conversation, User},
    protocol::{FiresOn, QueryPredicate, Subscription},
};
use storage::RecordStore;
use tracing::{info, warn};

pub const MESSAGE_SUBSCRIPTION_PREFIX: &str = "M-";
pub const INVITE_SUBSCRIPTION_PREFIX: &str = "G-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    Registered(Vec<String>),
    /// Some or all subscriptions were present already; the rest were saved.
    AlreadyRegistered {
        saved: Vec<String>,
        existing: Vec<String>,
    },
}

pub struct SubscriptionManager {
    store: Arc<dyn RecordStore>,
    timeout: Duration,
}

pub fn message_subscription(conversation: &Conversation) -> Subscription {
    let alert_body = match conversation.name.as_deref() {
        Some(name) => format!("You have a new message from {name}."),
        None => "You have a new message!".to_string(),
    };
    Subscription {
        subscription_id: format!("{MESSAGE_SUBSCRIPTION_PREFIX}{}", conversation.id),
        record_type: MESSAGE_RECORD_TYPE.into(),
        predicate: QueryPredicate::ReferenceEquals {
            field: MESSAGE_CONVERSATION_KEY.into(),
            target: conversation.id.clone(),
        },
        fires_on: FiresOn::CREATION,
        alert_body: Some(alert_body),
    }
}

pub fn invite_subscription(user_id: &RecordId) -> Subscription {
    Subscription {
        subscription_id: format!("{INVITE_SUBSCRIPTION_PREFIX}{user_id}"),
        record_type: CONVERSATION_RECORD_TYPE.into(),
        predicate: QueryPredicate::ReferenceListContains {
            field: CONVERSATION_MEMBERS_KEY.into(),
            target: user_id.clone(),
        },
        fires_on: FiresOn::CREATION_AND_UPDATE,
        alert_body: Some("Someone invited you to a group chat!".into()),
    }
}

fn subscriptions_for(user: &User) -> Result<Vec<Subscription>, SyncError> {
    let Some(conversations) = user.conversations.as_deref().filter(|_| user.is_fetched()) else {
        return Err(SyncError::EntityNotFetched {
            kind: RecordKind::User,
            id: user.id.clone(),
        });
    };
    let mut subscriptions: Vec<Subscription> =
        conversations.iter().map(message_subscription).collect();
    subscriptions.push(invite_subscription(&user.id));
    Ok(subscriptions)
}

fn rejected_ids(err: StoreError) -> Vec<String> {
    match err {
        StoreError::PartialFailure { failures } => failures.into_iter().map(|(id, _)| id).collect(),
        _ => Vec::new(),
    }
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn RecordStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Registers message and invite subscriptions for a fetched user.
    ///
    /// Returns `SyncError::DuplicateSubscription` when the store reports
    /// existing subscriptions; see [`SubscriptionManager::ensure_subscribed`]
    /// for the variant that folds that case into an outcome.
    pub async fn subscribe_user(&self, user: &User) -> Result<Vec<String>, SyncError> {
        let subscriptions = subscriptions_for(user)?;
        match self.bounded(self.store.save_subscriptions(subscriptions)).await? {
            Ok(saved) => {
                info!(user_id = %user.id, saved = saved.len(), "subscriptions: registered");
                Ok(saved)
            }
            Err(err) if err.is_duplicate_subscription() => Err(SyncError::DuplicateSubscription {
                subscription_ids: rejected_ids(err),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Like [`SubscriptionManager::subscribe_user`], treating duplicates as a no-op.
    pub async fn ensure_subscribed(&self, user: &User) -> Result<SubscriptionOutcome, SyncError> {
        match self.subscribe_user(user).await {
            Ok(saved) => Ok(SubscriptionOutcome::Registered(saved)),
            Err(SyncError::DuplicateSubscription { subscription_ids }) => {
                let saved = subscriptions_for(user)?
                    .into_iter()
                    .map(|s| s.subscription_id)
                    .filter(|id| !subscription_ids.contains(id))
                    .collect();
                info!(
                    user_id = %user.id,
                    existing = subscription_ids.len(),
                    "subscriptions: already registered"
                );
                Ok(SubscriptionOutcome::AlreadyRegistered {
                    saved,
                    existing: subscription_ids,
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn list(&self) -> Result<Vec<Subscription>, SyncError> {
        Ok(self.bounded(self.store.fetch_subscriptions()).await??)
    }

    /// Deletes every subscription; returns the deleted identifiers.
    pub async fn clear_all(&self) -> Result<Vec<String>, SyncError> {
        let ids: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .map(|s| s.subscription_id)
            .collect();
        if ids.is_empty() {
            return Ok(ids);
        }
        let deleted = self.bounded(self.store.delete_subscriptions(&ids)).await??;
        if deleted.len() != ids.len() {
            warn!(
                requested = ids.len(),
                deleted = deleted.len(),
                "subscriptions: some were already gone"
            );
        }
        info!(deleted = deleted.len(), "subscriptions: cleared");
        Ok(deleted)
    }

    async fn bounded<T>(
        &self,
        operation: impl std::future::Future<Output = T>,
    ) -> Result<T, SyncError> {
        tokio::time::timeout(self.timeout, operation)
            .await
            .map_err(|_| SyncError::Timeout(self.timeout))
    }
}

#[cfg(test)]
#[path = "tests/subscriptions_tests.rs"]
mod tests;
