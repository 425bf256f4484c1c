use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{RecordId, RecordKind};

/// Failure reported by the remote record store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(RecordId),
    /// The store has never seen a record of this type; queries against it fail
    /// until the first record is created.
    #[error("record type `{0}` has not been created yet")]
    RecordTypeMissing(String),
    #[error("server rejected request: {0}")]
    ServerRejected(String),
    #[error("subscription `{0}` already exists")]
    DuplicateSubscription(String),
    #[error("batch partially failed for {} item(s)", .failures.len())]
    PartialFailure { failures: Vec<(String, StoreError)> },
    #[error("not authenticated with the remote store")]
    NotAuthenticated,
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_partial_failure(&self) -> bool {
        matches!(self, Self::PartialFailure { .. })
    }

    /// A brand-new entity whose record type does not exist yet is treated as
    /// "stub, not found yet" instead of a hard failure.
    pub fn is_first_time_record_type_missing(&self) -> bool {
        matches!(self, Self::RecordTypeMissing(_))
    }

    /// Every rejected item of a subscription save was already present.
    pub fn is_duplicate_subscription(&self) -> bool {
        match self {
            Self::DuplicateSubscription(_) => true,
            Self::PartialFailure { failures } => {
                !failures.is_empty()
                    && failures
                        .iter()
                        .all(|(_, err)| matches!(err, Self::DuplicateSubscription(_)))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownRecordKind,
    UnknownModelKind,
    TypeMismatch,
    EntityNotFetched,
    WrongConversationMembership,
    PartialBatchFailure,
    DuplicateSubscription,
    NotFound,
    Timeout,
    Remote,
    Cursor,
    OutboxClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("unknown type of record `{0}`")]
    UnknownRecordKind(String),
    #[error("cannot merge a {actual} into a {expected}")]
    UnknownModelKind {
        expected: RecordKind,
        actual: RecordKind,
    },
    #[error("record {id} is a `{actual}`, expected `{expected}`")]
    TypeMismatch {
        id: RecordId,
        expected: RecordKind,
        actual: String,
    },
    #[error("{kind} {id} not fetched")]
    EntityNotFetched { kind: RecordKind, id: RecordId },
    #[error("user {user} attempts to send a message to conversation {conversation} they do not belong to")]
    WrongConversationMembership {
        user: RecordId,
        conversation: RecordId,
    },
    #[error("batch partially failed for {} record(s)", .failed.len())]
    PartialBatchFailure { failed: Vec<RecordId> },
    #[error("subscriptions already registered: {}", .subscription_ids.join(", "))]
    DuplicateSubscription { subscription_ids: Vec<String> },
    #[error("record {0} not found")]
    NotFound(RecordId),
    #[error("remote operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote store error: {0}")]
    Remote(StoreError),
    #[error("change cursor persistence failed: {0}")]
    Cursor(String),
    #[error("outbox worker is not running")]
    OutboxClosed,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownRecordKind(_) => ErrorKind::UnknownRecordKind,
            Self::UnknownModelKind { .. } => ErrorKind::UnknownModelKind,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::EntityNotFetched { .. } => ErrorKind::EntityNotFetched,
            Self::WrongConversationMembership { .. } => ErrorKind::WrongConversationMembership,
            Self::PartialBatchFailure { .. } => ErrorKind::PartialBatchFailure,
            Self::DuplicateSubscription { .. } => ErrorKind::DuplicateSubscription,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Remote(_) => ErrorKind::Remote,
            Self::Cursor(_) => ErrorKind::Cursor,
            Self::OutboxClosed => ErrorKind::OutboxClosed,
        }
    }

    /// Conditions callers may treat as a no-op outcome.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::DuplicateSubscription { .. })
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Self::PartialBatchFailure { .. })
    }
}

impl From<StoreError> for SyncError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::PartialFailure { failures } => Self::PartialBatchFailure {
                failed: failures
                    .into_iter()
                    .map(|(id, _)| RecordId::new(id))
                    .collect(),
            },
            other => Self::Remote(other),
        }
    }
}

/// A successful value that may carry the error of a partially failed batch.
#[derive(Debug, Clone)]
pub struct Partial<T> {
    pub value: T,
    pub error: Option<SyncError>,
}

impl<T> Partial<T> {
    pub fn complete(value: T) -> Self {
        Self { value, error: None }
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Partial<U> {
        Partial {
            value: f(self.value),
            error: self.error,
        }
    }

    /// Drops the partial error; use when the caller already reported it.
    pub fn into_value(self) -> T {
        self.value
    }
}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
