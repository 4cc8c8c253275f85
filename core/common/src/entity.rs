//! Field-level view of replicated records.
//!
//! The reconciliation engine never inspects concrete record types directly.
//! It compares and copies values through [`SyncEntity`], which exposes each
//! semantically meaningful field as a named [`FieldValue`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{Contact, Record};

/// A replicated collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    /// People the user tracks.
    Contacts,
    /// Conversation records owned by a contact.
    Records,
}

impl Collection {
    /// All collections, in reconciliation order.
    pub const ALL: [Collection; 2] = [Collection::Contacts, Collection::Records];

    /// Stable name used in logs and persisted state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Contacts => "contacts",
            Collection::Records => "records",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single field value, normalized for comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(DateTime<Utc>),
    Bytes(Vec<u8>),
    List(Vec<String>),
}

impl FieldValue {
    /// Whether the value counts as absent for conflict purposes.
    ///
    /// Booleans are always present.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.is_empty(),
            FieldValue::Bytes(b) => b.is_empty(),
            FieldValue::List(l) => l.is_empty(),
            FieldValue::Bool(_) | FieldValue::Int(_) | FieldValue::Float(_) | FieldValue::Date(_) => {
                false
            }
        }
    }
}

impl From<&Option<String>> for FieldValue {
    fn from(value: &Option<String>) -> Self {
        value
            .as_ref()
            .map(|s| FieldValue::Text(s.clone()))
            .unwrap_or(FieldValue::Null)
    }
}

impl From<&Option<DateTime<Utc>>> for FieldValue {
    fn from(value: &Option<DateTime<Utc>>) -> Self {
        value.map(FieldValue::Date).unwrap_or(FieldValue::Null)
    }
}

impl From<&Option<f64>> for FieldValue {
    fn from(value: &Option<f64>) -> Self {
        value.map(FieldValue::Float).unwrap_or(FieldValue::Null)
    }
}

impl From<&Option<i32>> for FieldValue {
    fn from(value: &Option<i32>) -> Self {
        value.map(|v| FieldValue::Int(v as i64)).unwrap_or(FieldValue::Null)
    }
}

impl From<&Option<Uuid>> for FieldValue {
    fn from(value: &Option<Uuid>) -> Self {
        value
            .map(|v| FieldValue::Text(v.to_string()))
            .unwrap_or(FieldValue::Null)
    }
}

/// Either record type, for stores that keep both collections side by side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collection", rename_all = "camelCase")]
pub enum AnyEntity {
    Contact(Contact),
    Record(Record),
}

impl AnyEntity {
    /// Identifier of the wrapped record.
    pub fn id(&self) -> Uuid {
        match self {
            AnyEntity::Contact(c) => c.id,
            AnyEntity::Record(r) => r.id,
        }
    }

    /// Collection of the wrapped record.
    pub fn collection(&self) -> Collection {
        match self {
            AnyEntity::Contact(_) => Collection::Contacts,
            AnyEntity::Record(_) => Collection::Records,
        }
    }
}

/// A record type the engine can reconcile.
///
/// The identifier is the merge key across replicas. `fields` must list every
/// semantically meaningful field (timestamps and the id excluded) in a stable
/// order, and `copy_field` must accept every name `fields` returns.
pub trait SyncEntity:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Collection this type lives in.
    const COLLECTION: Collection;

    fn id(&self) -> Uuid;
    fn created_at(&self) -> DateTime<Utc>;
    fn modified_at(&self) -> DateTime<Utc>;
    fn set_modified_at(&mut self, at: DateTime<Utc>);

    /// Named field values for pairwise comparison.
    fn fields(&self) -> Vec<(&'static str, FieldValue)>;

    /// Copy the field called `name` from `other` into `self`.
    fn copy_field(&mut self, name: &str, other: &Self);

    fn into_any(self) -> AnyEntity;
    fn from_any(any: AnyEntity) -> Option<Self>;

    /// Whether both versions hold identical field values.
    fn same_content(&self, other: &Self) -> bool {
        self.fields() == other.fields()
    }

    /// True if the record was created or modified strictly after `at`.
    fn changed_after(&self, at: DateTime<Utc>) -> bool {
        self.modified_at() > at || self.created_at() > at
    }

    /// Check values the wire format cannot carry faithfully.
    ///
    /// # Errors
    /// - `Validation` naming the offending field
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}
