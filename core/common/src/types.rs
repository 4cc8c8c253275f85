//! Replicated record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{AnyEntity, Collection, FieldValue, SyncEntity};
use crate::error::{Error, Result};

/// A person the user keeps track of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Merge key across replicas.
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub is_direct_report: bool,
    /// Next planned conversation.
    #[serde(default)]
    pub scheduled_date: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::wire::base64_opt")]
    pub photo: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Contact {
    /// Create a contact stamped with the current time.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: Some(name.into()),
            role: None,
            notes: None,
            timezone: None,
            is_direct_report: false,
            scheduled_date: None,
            photo: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Override both timestamps.
    pub fn stamped(mut self, created_at: DateTime<Utc>, modified_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.modified_at = modified_at;
        self
    }
}

impl SyncEntity for Contact {
    const COLLECTION: Collection = Collection::Contacts;

    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    fn set_modified_at(&mut self, at: DateTime<Utc>) {
        self.modified_at = at;
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("name", (&self.name).into()),
            ("role", (&self.role).into()),
            ("notes", (&self.notes).into()),
            ("timezone", (&self.timezone).into()),
            ("isDirectReport", FieldValue::Bool(self.is_direct_report)),
            ("scheduledDate", (&self.scheduled_date).into()),
            (
                "photo",
                self.photo
                    .clone()
                    .map(FieldValue::Bytes)
                    .unwrap_or(FieldValue::Null),
            ),
        ]
    }

    fn copy_field(&mut self, name: &str, other: &Self) {
        match name {
            "name" => self.name = other.name.clone(),
            "role" => self.role = other.role.clone(),
            "notes" => self.notes = other.notes.clone(),
            "timezone" => self.timezone = other.timezone.clone(),
            "isDirectReport" => self.is_direct_report = other.is_direct_report,
            "scheduledDate" => self.scheduled_date = other.scheduled_date,
            "photo" => self.photo = other.photo.clone(),
            _ => {}
        }
    }

    fn into_any(self) -> AnyEntity {
        AnyEntity::Contact(self)
    }

    fn from_any(any: AnyEntity) -> Option<Self> {
        match any {
            AnyEntity::Contact(c) => Some(c),
            _ => None,
        }
    }
}

/// A conversation record owned by one contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Merge key across replicas.
    pub id: Uuid,
    /// Owning contact. `None` is a broken link, reported by validation.
    #[serde(default)]
    pub contact_id: Option<Uuid>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<i32>,
    #[serde(default)]
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub sentiment_score: Option<f64>,
    #[serde(default)]
    pub sentiment_label: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Record {
    /// Create a record for `contact_id` stamped with the current time.
    pub fn new(contact_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            contact_id: Some(contact_id),
            notes: None,
            summary: None,
            duration_minutes: None,
            quality_score: None,
            sentiment_score: None,
            sentiment_label: None,
            topics: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }

    /// Override both timestamps.
    pub fn stamped(mut self, created_at: DateTime<Utc>, modified_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.modified_at = modified_at;
        self
    }
}

impl SyncEntity for Record {
    const COLLECTION: Collection = Collection::Records;

    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    fn set_modified_at(&mut self, at: DateTime<Utc>) {
        self.modified_at = at;
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("contactId", (&self.contact_id).into()),
            ("notes", (&self.notes).into()),
            ("summary", (&self.summary).into()),
            ("durationMinutes", (&self.duration_minutes).into()),
            ("qualityScore", (&self.quality_score).into()),
            ("sentimentScore", (&self.sentiment_score).into()),
            ("sentimentLabel", (&self.sentiment_label).into()),
            ("topics", FieldValue::List(self.topics.clone())),
        ]
    }

    fn copy_field(&mut self, name: &str, other: &Self) {
        match name {
            "contactId" => self.contact_id = other.contact_id,
            "notes" => self.notes = other.notes.clone(),
            "summary" => self.summary = other.summary.clone(),
            "durationMinutes" => self.duration_minutes = other.duration_minutes,
            "qualityScore" => self.quality_score = other.quality_score,
            "sentimentScore" => self.sentiment_score = other.sentiment_score,
            "sentimentLabel" => self.sentiment_label = other.sentiment_label.clone(),
            "topics" => self.topics = other.topics.clone(),
            _ => {}
        }
    }

    /// Scores must be finite: JSON has no NaN or infinity, so such a value
    /// would come back from the remote store as `None`.
    fn validate(&self) -> Result<()> {
        for (name, score) in [
            ("qualityScore", self.quality_score),
            ("sentimentScore", self.sentiment_score),
        ] {
            if score.is_some_and(|value| !value.is_finite()) {
                return Err(Error::Validation(format!(
                    "record {} has non-finite {}",
                    self.id, name
                )));
            }
        }
        Ok(())
    }

    fn into_any(self) -> AnyEntity {
        AnyEntity::Record(self)
    }

    fn from_any(any: AnyEntity) -> Option<Self> {
        match any {
            AnyEntity::Record(r) => Some(r),
            _ => None,
        }
    }
}

/// Soft-delete marker carried by every remote row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    #[serde(default, rename = "isDeleted")]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Tombstone {
    /// A tombstone marking deletion at `at`.
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            deleted: true,
            deleted_at: Some(at),
        }
    }
}

/// A record as stored on the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRow<E> {
    #[serde(flatten)]
    pub record: E,
    #[serde(flatten)]
    pub tombstone: Tombstone,
    /// Replica that last wrote the row.
    #[serde(default)]
    pub device_id: Option<String>,
    /// When the remote store accepted the last write. Assigned by the store,
    /// never by the writing replica.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl<E: SyncEntity> RemoteRow<E> {
    /// A live row written by `device_id`.
    pub fn live(record: E, device_id: impl Into<String>) -> Self {
        Self {
            record,
            tombstone: Tombstone::default(),
            device_id: Some(device_id.into()),
            updated_at: None,
        }
    }

    /// Mark the row deleted at `at`.
    pub fn tombstoned(mut self, at: DateTime<Utc>) -> Self {
        self.tombstone = Tombstone::at(at);
        self
    }

    /// Set the store acceptance time.
    pub fn accepted_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    pub fn id(&self) -> Uuid {
        self.record.id()
    }

    pub fn is_deleted(&self) -> bool {
        self.tombstone.deleted
    }

    /// Remote-side modification time: the store acceptance time, or the
    /// record's own timestamp for rows written before the store tracked it.
    pub fn remote_modified_at(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or_else(|| self.record.modified_at())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_contact_fields_cover_copy() {
        let mut a = Contact::new("A");
        let mut b = Contact::new("B");
        b.role = Some("Engineer".to_string());
        b.notes = Some("likes tea".to_string());
        b.timezone = Some("Europe/Berlin".to_string());
        b.is_direct_report = true;
        b.scheduled_date = Some(Utc::now() + Duration::days(3));
        b.photo = Some(vec![1, 2, 3]);

        for (name, _) in b.fields() {
            a.copy_field(name, &b);
        }
        assert!(a.same_content(&b));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_record_fields_cover_copy() {
        let owner = Uuid::new_v4();
        let mut a = Record::new(Uuid::new_v4());
        let mut b = Record::new(owner);
        b.notes = Some("1:1".to_string());
        b.summary = Some("career growth".to_string());
        b.duration_minutes = Some(30);
        b.quality_score = Some(0.8);
        b.sentiment_score = Some(0.4);
        b.sentiment_label = Some("positive".to_string());
        b.topics = vec!["roadmap".to_string(), "hiring".to_string()];

        for (name, _) in b.fields() {
            a.copy_field(name, &b);
        }
        assert!(a.same_content(&b));
        assert_eq!(a.contact_id, Some(owner));
    }

    #[test]
    fn test_remote_row_wire_shape() {
        let contact = Contact::new("Barbara");
        let mut row = RemoteRow::live(contact.clone(), "device-1");
        row.tombstone = Tombstone::at(contact.modified_at);

        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["isDeleted"], true);
        assert_eq!(value["name"], "Barbara");
        assert_eq!(value["deviceId"], "device-1");
        assert!(value["deletedAt"].is_string());

        let back: RemoteRow<Contact> = serde_json::from_value(value).unwrap();
        assert!(back.is_deleted());
        assert_eq!(back.record, contact);
    }

    #[test]
    fn test_remote_modified_at_prefers_store_time() {
        let written = Utc::now() - Duration::hours(2);
        let contact = Contact::new("Grace").stamped(written, written);
        let row = RemoteRow::live(contact, "peer");
        assert_eq!(row.remote_modified_at(), written);

        let accepted = Utc::now();
        let row = row.accepted_at(accepted);
        assert_eq!(row.remote_modified_at(), accepted);

        let value = serde_json::to_value(&row).unwrap();
        assert!(value["updatedAt"].is_string());
        let back: RemoteRow<Contact> = serde_json::from_value(value).unwrap();
        assert_eq!(back.updated_at, Some(accepted));
    }

    #[test]
    fn test_non_finite_scores_are_rejected() {
        let mut record = Record::new(Uuid::new_v4());
        record.quality_score = Some(0.7);
        assert!(record.validate().is_ok());

        record.sentiment_score = Some(f64::NAN);
        assert!(matches!(record.validate(), Err(Error::Validation(_))));

        record.sentiment_score = None;
        record.quality_score = Some(f64::INFINITY);
        assert!(matches!(record.validate(), Err(Error::Validation(_))));

        assert!(Contact::new("Ada").validate().is_ok());
    }

    #[test]
    fn test_missing_tombstone_defaults_to_live() {
        let contact = Contact::new("Edsger");
        let value = serde_json::to_value(&contact).unwrap();
        let row: RemoteRow<Contact> = serde_json::from_value(value).unwrap();
        assert!(!row.is_deleted());
        assert!(row.device_id.is_none());
        assert!(row.updated_at.is_none());
    }
}
