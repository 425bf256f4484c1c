//! In-process [`RecordStore`] used by tests, demos and offline hosts.
//!
//! Derived fields (a user's conversations, a conversation's messages) are
//! never stored; they only exist as answers to reverse queries, the same way
//! the hosted store behaves. Per-record faults and latencies can be injected
//! to exercise partial failures and interleaved completions.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{RecordId, USER_RECORD_TYPE},
    error::StoreError,
    protocol::{
        BatchFetch, ChangeCursor, ChangeNotification, ChangeReason, NotificationBatch, QueryPredicate,
        RawRecord, RecordQuery, Subscription,
    },
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{RecordStore, StoreResult};

#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    current_user: Option<RecordId>,
    records: HashMap<RecordId, RawRecord>,
    record_types: HashSet<String>,
    subscriptions: BTreeMap<String, Subscription>,
    notifications: Vec<ChangeNotification>,
    next_notification: u64,
    contacts: Vec<RecordId>,
    emails: HashMap<String, RecordId>,
    discoverable_names: HashMap<RecordId, String>,
    faults: Faults,
    calls: CallCounts,
}

#[derive(Default)]
struct Faults {
    record_failures: HashMap<RecordId, StoreError>,
    query_failures: HashMap<RecordId, StoreError>,
    latencies: HashMap<RecordId, Duration>,
    next_save_failure: Option<StoreError>,
    next_notification_failure: Option<StoreError>,
    subscription_rejections: HashMap<String, StoreError>,
}

/// Number of remote round trips served, for assertions in tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub record_fetches: usize,
    pub batch_fetches: usize,
    pub queries: usize,
    pub saves: usize,
    pub notification_fetches: usize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_current_user(&self, id: RecordId) {
        let mut guard = self.inner.lock().await;
        guard.record_types.insert(USER_RECORD_TYPE.to_string());
        guard
            .records
            .entry(id.clone())
            .or_insert_with(|| RawRecord::new(id.clone(), USER_RECORD_TYPE));
        guard.current_user = Some(id);
    }

    /// Stores a record without firing subscriptions.
    pub async fn insert_record(&self, record: RawRecord) {
        let mut guard = self.inner.lock().await;
        guard.record_types.insert(record.record_type.clone());
        guard.records.insert(record.id.clone(), record);
    }

    pub async fn record(&self, id: &RecordId) -> Option<RawRecord> {
        self.inner.lock().await.records.get(id).cloned()
    }

    pub async fn add_contact(&self, id: RecordId, email: Option<&str>) {
        let mut guard = self.inner.lock().await;
        if let Some(email) = email {
            guard.emails.insert(email.to_ascii_lowercase(), id.clone());
        }
        guard.contacts.push(id);
    }

    pub async fn set_discoverable_name(&self, id: RecordId, name: impl Into<String>) {
        self.inner
            .lock()
            .await
            .discoverable_names
            .insert(id, name.into());
    }

    pub async fn fail_record(&self, id: RecordId, error: StoreError) {
        self.inner
            .lock()
            .await
            .faults
            .record_failures
            .insert(id, error);
    }

    /// Fails every reference query whose predicate targets `id`.
    pub async fn fail_queries_targeting(&self, id: RecordId, error: StoreError) {
        self.inner
            .lock()
            .await
            .faults
            .query_failures
            .insert(id, error);
    }

    /// Delays fetches of `id` and queries targeting it.
    pub async fn set_latency(&self, id: RecordId, latency: Duration) {
        self.inner.lock().await.faults.latencies.insert(id, latency);
    }

    pub async fn fail_next_save(&self, error: StoreError) {
        self.inner.lock().await.faults.next_save_failure = Some(error);
    }

    /// Every save of `subscription_id` is refused with `error` until faults are cleared.
    pub async fn reject_subscription(&self, subscription_id: impl Into<String>, error: StoreError) {
        self.inner
            .lock()
            .await
            .faults
            .subscription_rejections
            .insert(subscription_id.into(), error);
    }

    pub async fn fail_next_notification_fetch(&self, error: StoreError) {
        self.inner.lock().await.faults.next_notification_failure = Some(error);
    }

    pub async fn clear_faults(&self) {
        self.inner.lock().await.faults = Faults::default();
    }

    /// Records a notification as if the push infrastructure delivered it again.
    pub async fn redeliver_notification(&self, record_id: &RecordId) -> bool {
        let mut guard = self.inner.lock().await;
        let Some(original) = guard
            .notifications
            .iter()
            .rev()
            .find(|n| &n.record_id == record_id)
            .cloned()
        else {
            return false;
        };
        let notification_id = guard.next_notification_id();
        guard.notifications.push(ChangeNotification {
            notification_id,
            ..original
        });
        true
    }

    pub async fn notification_count(&self) -> usize {
        self.inner.lock().await.notifications.len()
    }

    pub async fn calls(&self) -> CallCounts {
        self.inner.lock().await.calls
    }

    async fn delay_for(&self, ids: impl IntoIterator<Item = &RecordId>) {
        let latency = {
            let guard = self.inner.lock().await;
            ids.into_iter()
                .filter_map(|id| guard.faults.latencies.get(id).copied())
                .max()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl MemoryState {
    fn next_notification_id(&mut self) -> String {
        self.next_notification += 1;
        format!("N-{}", self.next_notification)
    }

    fn lookup(&self, id: &RecordId) -> StoreResult<RawRecord> {
        if let Some(err) = self.faults.record_failures.get(id) {
            return Err(err.clone());
        }
        self.records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn fire_subscriptions(&mut self, record: &RawRecord, reason: ChangeReason) {
        let fired: Vec<String> = self
            .subscriptions
            .values()
            .filter(|s| {
                s.record_type == record.record_type
                    && s.fires_on.fires_for(reason)
                    && s.predicate.matches(record)
            })
            .map(|s| s.subscription_id.clone())
            .collect();
        for subscription_id in fired {
            let notification_id = self.next_notification_id();
            self.notifications.push(ChangeNotification {
                notification_id,
                subscription_id,
                record_id: record.id.clone(),
                record_type: record.record_type.clone(),
                reason,
            });
        }
    }
}

fn predicate_target(predicate: &QueryPredicate) -> &RecordId {
    match predicate {
        QueryPredicate::ReferenceEquals { target, .. }
        | QueryPredicate::ReferenceListContains { target, .. } => target,
    }
}

fn encode_position(position: usize) -> ChangeCursor {
    ChangeCursor((position as u64).to_be_bytes().to_vec())
}

fn decode_position(cursor: &ChangeCursor) -> StoreResult<usize> {
    let bytes: [u8; 8] = cursor
        .as_bytes()
        .try_into()
        .map_err(|_| StoreError::ServerRejected("malformed change token".into()))?;
    Ok(u64::from_be_bytes(bytes) as usize)
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn current_user_id(&self) -> StoreResult<RecordId> {
        self.inner
            .lock()
            .await
            .current_user
            .clone()
            .ok_or(StoreError::NotAuthenticated)
    }

    async fn fetch_record(&self, id: &RecordId) -> StoreResult<RawRecord> {
        self.delay_for([id]).await;
        let mut guard = self.inner.lock().await;
        guard.calls.record_fetches += 1;
        guard.lookup(id)
    }

    async fn fetch_records(&self, ids: &[RecordId]) -> StoreResult<BatchFetch> {
        self.delay_for(ids).await;
        let mut guard = self.inner.lock().await;
        guard.calls.batch_fetches += 1;
        let mut batch = BatchFetch::default();
        for id in ids {
            match guard.lookup(id) {
                Ok(record) => batch.records.push(record),
                Err(err) => batch.failures.push((id.clone(), err)),
            }
        }
        Ok(batch)
    }

    async fn query_references(&self, query: &RecordQuery) -> StoreResult<Vec<RecordId>> {
        let target = predicate_target(&query.predicate);
        self.delay_for([target]).await;
        let mut guard = self.inner.lock().await;
        guard.calls.queries += 1;
        if let Some(err) = guard.faults.query_failures.get(target) {
            return Err(err.clone());
        }
        if !guard.record_types.contains(&query.record_type) {
            return Err(StoreError::RecordTypeMissing(query.record_type.clone()));
        }
        let mut matches: Vec<&RawRecord> = guard
            .records
            .values()
            .filter(|r| r.record_type == query.record_type && query.predicate.matches(r))
            .collect();
        match &query.sort_ascending_by {
            Some(key) => matches.sort_by(|a, b| {
                a.timestamp(key)
                    .cmp(&b.timestamp(key))
                    .then_with(|| a.id.cmp(&b.id))
            }),
            None => matches.sort_by(|a, b| a.id.cmp(&b.id)),
        }
        Ok(matches.into_iter().map(|r| r.id.clone()).collect())
    }

    async fn save_records(&self, records: Vec<RawRecord>) -> StoreResult<Vec<RawRecord>> {
        let mut guard = self.inner.lock().await;
        guard.calls.saves += 1;
        if let Some(err) = guard.faults.next_save_failure.take() {
            return Err(err);
        }
        for record in &records {
            let reason = if guard.records.contains_key(&record.id) {
                ChangeReason::RecordUpdated
            } else {
                ChangeReason::RecordCreated
            };
            guard.record_types.insert(record.record_type.clone());
            guard.records.insert(record.id.clone(), record.clone());
            guard.fire_subscriptions(record, reason);
            debug!(record_id = %record.id, record_type = %record.record_type, "memory store saved record");
        }
        Ok(records)
    }

    async fn save_subscriptions(
        &self,
        subscriptions: Vec<Subscription>,
    ) -> StoreResult<Vec<String>> {
        let mut guard = self.inner.lock().await;
        let mut saved = Vec::new();
        let mut failures = Vec::new();
        for subscription in subscriptions {
            let id = subscription.subscription_id.clone();
            if let Some(err) = guard.faults.subscription_rejections.get(&id) {
                failures.push((id, err.clone()));
            } else if guard.subscriptions.contains_key(&id) {
                failures.push((id.clone(), StoreError::DuplicateSubscription(id)));
            } else {
                guard.subscriptions.insert(id.clone(), subscription);
                saved.push(id);
            }
        }
        if failures.is_empty() {
            Ok(saved)
        } else {
            Err(StoreError::PartialFailure { failures })
        }
    }

    async fn delete_subscriptions(&self, subscription_ids: &[String]) -> StoreResult<Vec<String>> {
        let mut guard = self.inner.lock().await;
        Ok(subscription_ids
            .iter()
            .filter(|id| guard.subscriptions.remove(*id).is_some())
            .cloned()
            .collect())
    }

    async fn fetch_subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .await
            .subscriptions
            .values()
            .cloned()
            .collect())
    }

    async fn fetch_notification_changes(
        &self,
        since: Option<&ChangeCursor>,
    ) -> StoreResult<NotificationBatch> {
        let mut guard = self.inner.lock().await;
        guard.calls.notification_fetches += 1;
        if let Some(err) = guard.faults.next_notification_failure.take() {
            return Err(err);
        }
        let start = match since {
            Some(cursor) => decode_position(cursor)?.min(guard.notifications.len()),
            None => 0,
        };
        Ok(NotificationBatch {
            notifications: guard.notifications[start..].to_vec(),
            cursor: encode_position(guard.notifications.len()),
        })
    }

    async fn discover_user_name(&self, id: &RecordId) -> StoreResult<Option<String>> {
        Ok(self.inner.lock().await.discoverable_names.get(id).cloned())
    }

    async fn discover_contacts(&self) -> StoreResult<Vec<RecordId>> {
        Ok(self.inner.lock().await.contacts.clone())
    }

    async fn discover_user_by_email(&self, email: &str) -> StoreResult<RecordId> {
        self.inner
            .lock()
            .await
            .emails
            .get(&email.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(RecordId::new(email)))
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
