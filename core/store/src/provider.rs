//! Store collaborator trait definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use twinsync_common::{RemoteRow, Result, SyncEntity};

/// Keyset position inside a `(modified_at, id)` ordered scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor {
    pub modified_at: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    /// Position just after `record`.
    pub fn after<E: SyncEntity>(record: &E) -> Self {
        Self {
            modified_at: record.modified_at(),
            id: record.id(),
        }
    }

    /// Whether `record` sorts strictly after this position.
    pub fn precedes<E: SyncEntity>(&self, record: &E) -> bool {
        (record.modified_at(), record.id()) > (self.modified_at, self.id)
    }
}

/// Local embedded store.
///
/// Writes (`upsert`, `delete`) are pending until `save` commits them as one
/// transaction. Reads through the same store observe pending writes.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the store name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Records created or modified strictly after `since`.
    ///
    /// Results are ordered by `(modified_at, id)`, start after `after` when
    /// given, and hold at most `limit` records.
    async fn changed_since<E: SyncEntity>(
        &self,
        since: DateTime<Utc>,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<E>>;

    /// Look up one record by identifier.
    async fn fetch<E: SyncEntity>(&self, id: Uuid) -> Result<Option<E>>;

    /// Every record of the collection.
    async fn fetch_all<E: SyncEntity>(&self) -> Result<Vec<E>>;

    /// Create or overwrite a record.
    async fn upsert<E: SyncEntity>(&self, record: E) -> Result<()>;

    /// Remove a record. Removing an absent record is not an error.
    async fn delete<E: SyncEntity>(&self, id: Uuid) -> Result<()>;

    /// Commit all pending changes, or fail with `Error::Database` and keep
    /// them pending.
    async fn save(&self) -> Result<()>;

    /// Discard all pending changes.
    async fn rollback(&self) -> Result<()>;
}

/// Remote networked store.
///
/// Deletion is always a tombstone: the row stays, flagged deleted with a
/// timestamp. Selects filter tombstoned rows unless asked not to. Every
/// accepted write (insert, update, tombstone) sets the row's `updated_at`
/// from the store's clock.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the store name.
    fn name(&self) -> &str;

    /// Cheap reachability check (a one-row select).
    async fn probe(&self) -> Result<()>;

    /// Every row of the collection.
    async fn select_all<E: SyncEntity>(&self, include_deleted: bool) -> Result<Vec<RemoteRow<E>>>;

    /// One row by identifier, tombstoned or not.
    async fn select_by_id<E: SyncEntity>(&self, id: Uuid) -> Result<Option<RemoteRow<E>>>;

    /// Rows the store accepted a write for at or after `since`.
    ///
    /// Filters on the store-assigned `updated_at`, not the record's own
    /// `modified_at`, so rows uploaded late by another replica are included.
    async fn select_updated_since<E: SyncEntity>(
        &self,
        since: DateTime<Utc>,
        include_deleted: bool,
    ) -> Result<Vec<RemoteRow<E>>>;

    /// Insert a new live row.
    ///
    /// # Errors
    /// - `Validation` if a row with the same id exists
    async fn insert<E: SyncEntity>(&self, record: &E, device_id: &str) -> Result<RemoteRow<E>>;

    /// Overwrite the row with the same identifier.
    ///
    /// # Errors
    /// - `Validation` if no such row exists
    async fn update<E: SyncEntity>(&self, record: &E, device_id: &str) -> Result<RemoteRow<E>>;

    /// Mark a row deleted at `at`.
    async fn tombstone<E: SyncEntity>(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use twinsync_common::Contact;

    #[test]
    fn test_cursor_ordering() {
        let now = Utc::now();
        let first = Contact::new("a").stamped(now, now);
        let later = Contact::new("b").stamped(now, now + Duration::seconds(1));

        let cursor = Cursor::after(&first);
        assert!(!cursor.precedes(&first));
        assert!(cursor.precedes(&later));
    }

    #[test]
    fn test_cursor_breaks_ties_by_id() {
        let now = Utc::now();
        let mut a = Contact::new("a").stamped(now, now);
        let mut b = Contact::new("b").stamped(now, now);
        if a.id > b.id {
            std::mem::swap(&mut a, &mut b);
        }
        assert!(Cursor::after(&a).precedes(&b));
        assert!(!Cursor::after(&b).precedes(&a));
    }
}
