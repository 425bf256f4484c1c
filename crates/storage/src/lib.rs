use async_trait::async_trait;
use shared::{
    domain::RecordId,
    error::StoreError,
    protocol::{BatchFetch, ChangeCursor, NotificationBatch, RawRecord, RecordQuery, Subscription},
};

mod cursor;
mod memory;

pub use cursor::{MemoryCursorStore, SqliteCursorStore, NOTIFICATION_CURSOR_SCOPE};
pub use memory::{CallCounts, MemoryRecordStore};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Record-oriented remote store the sync core is built on.
///
/// Implementations own transport and authentication; callers only see records
/// keyed by [`RecordId`] and the [`StoreError`] taxonomy.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Identifier of the user record of the authenticated account.
    async fn current_user_id(&self) -> StoreResult<RecordId>;

    async fn fetch_record(&self, id: &RecordId) -> StoreResult<RawRecord>;

    /// Items that cannot be fetched land in [`BatchFetch::failures`]; an `Err`
    /// means the whole batch failed.
    async fn fetch_records(&self, ids: &[RecordId]) -> StoreResult<BatchFetch>;

    /// Reference-only query: identifiers of matching records, no fields.
    async fn query_references(&self, query: &RecordQuery) -> StoreResult<Vec<RecordId>>;

    async fn save_records(&self, records: Vec<RawRecord>) -> StoreResult<Vec<RawRecord>>;

    /// Returns identifiers of the subscriptions saved. Already registered
    /// subscriptions are reported as a `PartialFailure` of `DuplicateSubscription`
    /// items.
    async fn save_subscriptions(&self, subscriptions: Vec<Subscription>)
        -> StoreResult<Vec<String>>;

    async fn delete_subscriptions(&self, subscription_ids: &[String]) -> StoreResult<Vec<String>>;

    async fn fetch_subscriptions(&self) -> StoreResult<Vec<Subscription>>;

    /// Notifications recorded after `since`, or from the beginning when absent.
    async fn fetch_notification_changes(
        &self,
        since: Option<&ChangeCursor>,
    ) -> StoreResult<NotificationBatch>;

    /// Display name published by the platform's user discovery service.
    async fn discover_user_name(&self, id: &RecordId) -> StoreResult<Option<String>>;

    async fn discover_contacts(&self) -> StoreResult<Vec<RecordId>>;

    async fn discover_user_by_email(&self, email: &str) -> StoreResult<RecordId>;
}

/// Persistence for the single opaque notification cursor.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(&self) -> anyhow::Result<Option<ChangeCursor>>;
    async fn save_cursor(&self, cursor: &ChangeCursor) -> anyhow::Result<()>;
    async fn clear_cursor(&self) -> anyhow::Result<()>;
}
