//! Turns remote change notifications into hydrated messages.
//!
//! A cycle moves Idle -> Fetching -> Hydrating -> Idle. The change cursor is
//! only committed once hydration has produced a result, so a failed cycle is
//! retried from the same position. Message stubs stay in the unfetched set
//! until the caller acknowledges them with [`NotificationReconciler::mark_processed`].

use std::{collections::HashSet, sync::Arc};

use shared::{
    domain::{RecordId, RecordKind},
    error::SyncError,
    model::Message,
    protocol::{ChangeCursor, NotificationBatch},
};
use storage::{CursorStore, RecordStore};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::fetcher::RemoteCollectionFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    Fetching,
    Hydrating,
}

/// Outcome of one notification cycle.
#[derive(Debug, Clone, Default)]
pub struct NotificationReport {
    pub messages: Vec<Message>,
    /// Conversations the current user was added to.
    pub conversation_invites: Vec<RecordId>,
    /// Set when some stubs could not be hydrated; they stay pending.
    pub error: Option<SyncError>,
}

pub struct NotificationReconciler {
    store: Arc<dyn RecordStore>,
    cursor_store: Arc<dyn CursorStore>,
    fetcher: Arc<RemoteCollectionFetcher>,
    cycle: Mutex<()>,
    state: RwLock<ReconcilerState>,
    cursor: RwLock<Option<ChangeCursor>>,
    pending: Mutex<Pending>,
}

#[derive(Default)]
struct Pending {
    unfetched: Vec<Message>,
    /// Acknowledged since the last commit; notifications replayed from the
    /// uncommitted cursor must not bring them back.
    acknowledged: HashSet<RecordId>,
}

fn cursor_error(err: anyhow::Error) -> SyncError {
    SyncError::Cursor(format!("{err:#}"))
}

impl NotificationReconciler {
    /// Restores the persisted cursor; absence means "from the beginning".
    pub async fn load(
        store: Arc<dyn RecordStore>,
        cursor_store: Arc<dyn CursorStore>,
        fetcher: Arc<RemoteCollectionFetcher>,
    ) -> Result<Self, SyncError> {
        let cursor = cursor_store.load_cursor().await.map_err(cursor_error)?;
        debug!(has_cursor = cursor.is_some(), "sync: restored change cursor");
        Ok(Self {
            store,
            cursor_store,
            fetcher,
            cycle: Mutex::new(()),
            state: RwLock::new(ReconcilerState::Idle),
            cursor: RwLock::new(cursor),
            pending: Mutex::new(Pending::default()),
        })
    }

    pub async fn state(&self) -> ReconcilerState {
        *self.state.read().await
    }

    pub async fn cursor(&self) -> Option<ChangeCursor> {
        self.cursor.read().await.clone()
    }

    pub async fn unfetched(&self) -> Vec<Message> {
        self.pending.lock().await.unfetched.clone()
    }

    /// Runs one cycle. Concurrent callers are serialized.
    pub async fn fetch_changes(&self) -> Result<NotificationReport, SyncError> {
        let _cycle = self.cycle.lock().await;
        let result = self.run_cycle().await;
        self.transition(ReconcilerState::Idle).await;
        if let Err(err) = &result {
            warn!(error = %err, "sync: notification cycle failed, cursor unchanged");
        }
        result
    }

    /// Drops acknowledged messages from the unfetched set; returns how many were removed.
    ///
    /// A stub that can never be hydrated (its record was deleted) fails every
    /// cycle and holds the cursor back. Acknowledging the ids reported in
    /// `SyncError::PartialBatchFailure` gives it up: the next cycle skips its
    /// replayed notification and can commit again.
    pub async fn mark_processed(&self, message_ids: &[RecordId]) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.unfetched.len();
        pending.unfetched.retain(|m| !message_ids.contains(&m.id));
        pending.acknowledged.extend(message_ids.iter().cloned());
        let removed = before - pending.unfetched.len();
        debug!(removed, remaining = pending.unfetched.len(), "sync: messages acknowledged");
        removed
    }

    pub async fn reset_cursor(&self) -> Result<(), SyncError> {
        let _cycle = self.cycle.lock().await;
        self.cursor_store.clear_cursor().await.map_err(cursor_error)?;
        *self.cursor.write().await = None;
        self.pending.lock().await.acknowledged.clear();
        info!("sync: change cursor reset");
        Ok(())
    }

    async fn transition(&self, next: ReconcilerState) {
        let mut state = self.state.write().await;
        if *state != next {
            debug!(from = ?*state, to = ?next, "sync: reconciler transition");
            *state = next;
        }
    }

    async fn run_cycle(&self) -> Result<NotificationReport, SyncError> {
        self.transition(ReconcilerState::Fetching).await;
        let since = self.cursor().await;
        let batch = self.fetch_batch(since.as_ref()).await?;
        info!(
            notifications = batch.notifications.len(),
            "sync: notification batch fetched"
        );

        let conversation_invites = self.absorb(&batch).await;

        self.transition(ReconcilerState::Hydrating).await;
        let stubs = self.unfetched().await;
        let hydrated = self.fetcher.fetch_messages(&stubs).await?;

        self.cursor_store
            .save_cursor(&batch.cursor)
            .await
            .map_err(cursor_error)?;
        *self.cursor.write().await = Some(batch.cursor);
        self.pending.lock().await.acknowledged.clear();
        info!(
            messages = hydrated.value.len(),
            invites = conversation_invites.len(),
            partial = hydrated.error.is_some(),
            "sync: change cursor committed"
        );

        Ok(NotificationReport {
            messages: hydrated.value,
            conversation_invites,
            error: hydrated.error,
        })
    }

    async fn fetch_batch(
        &self,
        since: Option<&ChangeCursor>,
    ) -> Result<NotificationBatch, SyncError> {
        let timeout = self.fetcher.timeout();
        match tokio::time::timeout(timeout, self.store.fetch_notification_changes(since)).await {
            Ok(batch) => Ok(batch?),
            Err(_) => Err(SyncError::Timeout(timeout)),
        }
    }

    /// Adds message stubs not already pending; returns invited conversation ids.
    async fn absorb(&self, batch: &NotificationBatch) -> Vec<RecordId> {
        let mut invites: Vec<RecordId> = Vec::new();
        let mut pending = self.pending.lock().await;
        for notification in &batch.notifications {
            let id = &notification.record_id;
            match RecordKind::from_record_type(&notification.record_type) {
                Some(RecordKind::Message) => {
                    if pending.acknowledged.contains(id) {
                        debug!(record_id = %id, "sync: notification already acknowledged");
                    } else if pending.unfetched.iter().any(|m| &m.id == id) {
                        debug!(record_id = %id, "sync: duplicate notification ignored");
                    } else {
                        pending.unfetched.push(Message::stub(id.clone()));
                    }
                }
                Some(RecordKind::Conversation) => {
                    if !invites.contains(id) {
                        invites.push(id.clone());
                    }
                }
                _ => debug!(
                    record_type = %notification.record_type,
                    "sync: notification for untracked record type"
                ),
            }
        }
        invites
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
