use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{RecordId, RecordKind},
    error::StoreError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Timestamp(DateTime<Utc>),
    Reference(RecordId),
    ReferenceList(Vec<RecordId>),
}

/// A record as the remote store returns it: identifier, declared type and an
/// untyped field map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: RecordId,
    pub record_type: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl RawRecord {
    pub fn new(id: RecordId, record_type: impl Into<String>) -> Self {
        Self {
            id,
            record_type: record_type.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> Option<RecordKind> {
        RecordKind::from_record_type(&self.record_type)
    }

    pub fn with_field(mut self, key: &str, value: FieldValue) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn set(&mut self, key: &str, value: FieldValue) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.fields.get(key) {
            Some(FieldValue::Text(value)) => Some(value),
            _ => None,
        }
    }

    pub fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.fields.get(key) {
            Some(FieldValue::Timestamp(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn reference(&self, key: &str) -> Option<&RecordId> {
        match self.fields.get(key) {
            Some(FieldValue::Reference(value)) => Some(value),
            _ => None,
        }
    }

    pub fn reference_list(&self, key: &str) -> Option<&[RecordId]> {
        match self.fields.get(key) {
            Some(FieldValue::ReferenceList(values)) => Some(values),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueryPredicate {
    /// `field` holds a single reference equal to `target`.
    ReferenceEquals { field: String, target: RecordId },
    /// `field` holds a reference list containing `target`.
    ReferenceListContains { field: String, target: RecordId },
}

impl QueryPredicate {
    pub fn matches(&self, record: &RawRecord) -> bool {
        match self {
            Self::ReferenceEquals { field, target } => record.reference(field) == Some(target),
            Self::ReferenceListContains { field, target } => record
                .reference_list(field)
                .is_some_and(|ids| ids.contains(target)),
        }
    }
}

/// Reference-only query: the store answers with matching identifiers, no fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub record_type: String,
    pub predicate: QueryPredicate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_ascending_by: Option<String>,
}

/// Result of a batch fetch-by-id. Items that could not be fetched are listed
/// in `failures` instead of failing the whole call.
#[derive(Debug, Clone, Default)]
pub struct BatchFetch {
    pub records: Vec<RawRecord>,
    pub failures: Vec<(RecordId, StoreError)>,
}

/// Opaque incremental-fetch position handed out by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeCursor(pub Vec<u8>);

impl ChangeCursor {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    RecordCreated,
    RecordUpdated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub notification_id: String,
    pub subscription_id: String,
    pub record_id: RecordId,
    pub record_type: String,
    pub reason: ChangeReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationBatch {
    pub notifications: Vec<ChangeNotification>,
    pub cursor: ChangeCursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiresOn {
    pub creation: bool,
    pub update: bool,
}

impl FiresOn {
    pub const CREATION: Self = Self {
        creation: true,
        update: false,
    };
    pub const CREATION_AND_UPDATE: Self = Self {
        creation: true,
        update: true,
    };

    pub fn fires_for(self, reason: ChangeReason) -> bool {
        match reason {
            ChangeReason::RecordCreated => self.creation,
            ChangeReason::RecordUpdated => self.update,
        }
    }
}

/// Standing interest registered with the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: String,
    pub record_type: String,
    pub predicate: QueryPredicate,
    pub fires_on: FiresOn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_body: Option<String>,
}
