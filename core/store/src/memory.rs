//! In-memory store implementations for testing and snapshot replay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;
use uuid::Uuid;

use twinsync_common::wire::{decode, encode};
use twinsync_common::{
    AnyEntity, Collection, Contact, Error, Record, RemoteRow, Result, SyncEntity, Tombstone,
};

use crate::provider::{Cursor, LocalStore, RemoteStore};

type Key = (Collection, Uuid);

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| Error::Database("store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| Error::Database("store lock poisoned".to_string()))
}

/// Serializable content of a local store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalSnapshot {
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub records: Vec<Record>,
}

#[derive(Debug, Default)]
struct LocalTables {
    committed: BTreeMap<Key, AnyEntity>,
    /// `None` marks a pending delete.
    pending: BTreeMap<Key, Option<AnyEntity>>,
    fail_next_save: bool,
}

impl LocalTables {
    fn visible(&self, collection: Collection) -> Vec<AnyEntity> {
        let mut merged: BTreeMap<Uuid, AnyEntity> = self
            .committed
            .iter()
            .filter(|((c, _), _)| *c == collection)
            .map(|((_, id), e)| (*id, e.clone()))
            .collect();

        for ((c, id), change) in &self.pending {
            if *c != collection {
                continue;
            }
            match change {
                Some(entity) => {
                    merged.insert(*id, entity.clone());
                }
                None => {
                    merged.remove(id);
                }
            }
        }

        merged.into_values().collect()
    }
}

/// In-memory local store with a pending-change overlay.
///
/// Useful for testing and for replaying JSON snapshots. All data is lost
/// on drop unless exported with [`MemoryLocalStore::snapshot`].
pub struct MemoryLocalStore {
    tables: RwLock<LocalTables>,
}

impl MemoryLocalStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(LocalTables::default()),
        }
    }

    /// Create a store whose committed state is `snapshot`.
    pub fn from_snapshot(snapshot: LocalSnapshot) -> Self {
        let mut tables = LocalTables::default();
        for contact in snapshot.contacts {
            tables
                .committed
                .insert((Collection::Contacts, contact.id), AnyEntity::Contact(contact));
        }
        for record in snapshot.records {
            tables
                .committed
                .insert((Collection::Records, record.id), AnyEntity::Record(record));
        }
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Export the committed state.
    pub fn snapshot(&self) -> Result<LocalSnapshot> {
        let tables = read(&self.tables)?;
        let mut snapshot = LocalSnapshot::default();
        for entity in tables.committed.values() {
            match entity {
                AnyEntity::Contact(c) => snapshot.contacts.push(c.clone()),
                AnyEntity::Record(r) => snapshot.records.push(r.clone()),
            }
        }
        Ok(snapshot)
    }

    /// Make the next `save` fail with a database error.
    pub fn fail_next_save(&self) -> Result<()> {
        write(&self.tables)?.fail_next_save = true;
        Ok(())
    }

    /// Number of uncommitted changes.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(read(&self.tables)?.pending.len())
    }

    /// Committed records of one collection.
    pub fn committed<E: SyncEntity>(&self) -> Result<Vec<E>> {
        let tables = read(&self.tables)?;
        Ok(tables
            .committed
            .iter()
            .filter(|((c, _), _)| *c == E::COLLECTION)
            .filter_map(|(_, e)| E::from_any(e.clone()))
            .collect())
    }
}

impl Default for MemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn changed_since<E: SyncEntity>(
        &self,
        since: DateTime<Utc>,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<E>> {
        let visible = read(&self.tables)?.visible(E::COLLECTION);

        let mut changed: Vec<E> = visible
            .into_iter()
            .filter_map(E::from_any)
            .filter(|e| e.changed_after(since))
            .filter(|e| after.map_or(true, |cursor| cursor.precedes(e)))
            .collect();

        changed.sort_by_key(|e| (e.modified_at(), e.id()));
        changed.truncate(limit);
        Ok(changed)
    }

    async fn fetch<E: SyncEntity>(&self, id: Uuid) -> Result<Option<E>> {
        let tables = read(&self.tables)?;
        let key = (E::COLLECTION, id);
        let entity = match tables.pending.get(&key) {
            Some(change) => change.clone(),
            None => tables.committed.get(&key).cloned(),
        };
        Ok(entity.and_then(E::from_any))
    }

    async fn fetch_all<E: SyncEntity>(&self) -> Result<Vec<E>> {
        let visible = read(&self.tables)?.visible(E::COLLECTION);
        Ok(visible.into_iter().filter_map(E::from_any).collect())
    }

    async fn upsert<E: SyncEntity>(&self, record: E) -> Result<()> {
        let key = (E::COLLECTION, record.id());
        write(&self.tables)?
            .pending
            .insert(key, Some(record.into_any()));
        Ok(())
    }

    async fn delete<E: SyncEntity>(&self, id: Uuid) -> Result<()> {
        write(&self.tables)?.pending.insert((E::COLLECTION, id), None);
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let mut tables = write(&self.tables)?;
        if tables.fail_next_save {
            tables.fail_next_save = false;
            return Err(Error::Database("save rejected".to_string()));
        }

        let pending = std::mem::take(&mut tables.pending);
        let count = pending.len();
        for (key, change) in pending {
            match change {
                Some(entity) => {
                    tables.committed.insert(key, entity);
                }
                None => {
                    tables.committed.remove(&key);
                }
            }
        }
        debug!("Committed {} local changes", count);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        write(&self.tables)?.pending.clear();
        Ok(())
    }
}

/// Serializable content of a remote store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    #[serde(default)]
    pub contacts: Vec<RemoteRow<Contact>>,
    #[serde(default)]
    pub records: Vec<RemoteRow<Record>>,
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    transient_failures: u32,
    rejected_ids: HashSet<Uuid>,
    change_feed_down: bool,
}

type TimeSource = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// In-memory remote store.
///
/// Rows are kept as JSON documents in the wire format, so every read and
/// write goes through the same encoding a networked store would use. Every
/// accepted write stamps the row's `updated_at` from the store's own time
/// source. Fault injection hooks simulate outages and rejected writes.
pub struct MemoryRemoteStore {
    documents: RwLock<BTreeMap<Key, serde_json::Value>>,
    faults: RwLock<Faults>,
    calls: AtomicU64,
    time: TimeSource,
}

impl MemoryRemoteStore {
    /// Create a new empty store using the system clock.
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(BTreeMap::new()),
            faults: RwLock::new(Faults::default()),
            calls: AtomicU64::new(0),
            time: Arc::new(Utc::now),
        }
    }

    /// Stamp accepted writes with `time` instead of the system clock.
    pub fn with_time_source(
        mut self,
        time: impl Fn() -> DateTime<Utc> + Send + Sync + 'static,
    ) -> Self {
        self.time = Arc::new(time);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.time)()
    }

    /// Create a store holding the rows of `snapshot`.
    pub fn from_snapshot(snapshot: RemoteSnapshot) -> Result<Self> {
        let store = Self::new();
        {
            let mut docs = write(&store.documents)?;
            for row in snapshot.contacts {
                docs.insert((Collection::Contacts, row.id()), encode(&row)?);
            }
            for row in snapshot.records {
                docs.insert((Collection::Records, row.id()), encode(&row)?);
            }
        }
        Ok(store)
    }

    /// Export every row, tombstoned ones included.
    pub fn snapshot(&self) -> Result<RemoteSnapshot> {
        Ok(RemoteSnapshot {
            contacts: self.rows::<Contact>()?,
            records: self.rows::<Record>()?,
        })
    }

    /// Seed a row directly, bypassing faults.
    ///
    /// A row without `updated_at` is stamped as accepted now.
    pub fn put<E: SyncEntity>(&self, mut row: RemoteRow<E>) -> Result<()> {
        if row.updated_at.is_none() {
            row.updated_at = Some(self.now());
        }
        let doc = encode(&row)?;
        write(&self.documents)?.insert((E::COLLECTION, row.id()), doc);
        Ok(())
    }

    /// Simulate losing or regaining connectivity.
    pub fn set_offline(&self, offline: bool) -> Result<()> {
        write(&self.faults)?.offline = offline;
        Ok(())
    }

    /// Fail the next `count` calls with a retryable network error.
    pub fn fail_transiently(&self, count: u32) -> Result<()> {
        write(&self.faults)?.transient_failures = count;
        Ok(())
    }

    /// Fail incremental selects while leaving every other call working.
    pub fn set_change_feed_down(&self, down: bool) -> Result<()> {
        write(&self.faults)?.change_feed_down = down;
        Ok(())
    }

    /// Reject every write to `id` with a validation error.
    pub fn reject_writes_for(&self, id: Uuid) -> Result<()> {
        write(&self.faults)?.rejected_ids.insert(id);
        Ok(())
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) -> Result<()> {
        *write(&self.faults)? = Faults::default();
        Ok(())
    }

    /// Total number of calls served or refused.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn admit(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut faults = write(&self.faults)?;
        if faults.offline {
            return Err(Error::NetworkUnavailable("remote store offline".to_string()));
        }
        if faults.transient_failures > 0 {
            faults.transient_failures -= 1;
            return Err(Error::NetworkUnavailable("connection reset".to_string()));
        }
        Ok(())
    }

    fn admit_write(&self, id: Uuid) -> Result<()> {
        self.admit()?;
        if read(&self.faults)?.rejected_ids.contains(&id) {
            return Err(Error::Validation(format!("row {} rejected", id)));
        }
        Ok(())
    }

    fn rows<E: SyncEntity>(&self) -> Result<Vec<RemoteRow<E>>> {
        let docs = read(&self.documents)?;
        docs.iter()
            .filter(|((c, _), _)| *c == E::COLLECTION)
            .map(|(_, doc)| decode(doc.clone()))
            .collect()
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn probe(&self) -> Result<()> {
        self.admit()
    }

    async fn select_all<E: SyncEntity>(&self, include_deleted: bool) -> Result<Vec<RemoteRow<E>>> {
        self.admit()?;
        Ok(self
            .rows::<E>()?
            .into_iter()
            .filter(|row| include_deleted || !row.is_deleted())
            .collect())
    }

    async fn select_by_id<E: SyncEntity>(&self, id: Uuid) -> Result<Option<RemoteRow<E>>> {
        self.admit()?;
        let docs = read(&self.documents)?;
        docs.get(&(E::COLLECTION, id))
            .map(|doc| decode(doc.clone()))
            .transpose()
    }

    async fn select_updated_since<E: SyncEntity>(
        &self,
        since: DateTime<Utc>,
        include_deleted: bool,
    ) -> Result<Vec<RemoteRow<E>>> {
        self.admit()?;
        if read(&self.faults)?.change_feed_down {
            return Err(Error::NetworkUnavailable("change feed unavailable".to_string()));
        }
        Ok(self
            .rows::<E>()?
            .into_iter()
            .filter(|row| include_deleted || !row.is_deleted())
            .filter(|row| row.remote_modified_at() >= since)
            .collect())
    }

    async fn insert<E: SyncEntity>(&self, record: &E, device_id: &str) -> Result<RemoteRow<E>> {
        self.admit_write(record.id())?;
        record.validate()?;
        let key = (E::COLLECTION, record.id());
        let mut docs = write(&self.documents)?;
        if docs.contains_key(&key) {
            return Err(Error::Validation(format!(
                "duplicate {} id {}",
                E::COLLECTION,
                record.id()
            )));
        }
        let row = RemoteRow::live(record.clone(), device_id).accepted_at(self.now());
        docs.insert(key, encode(&row)?);
        Ok(row)
    }

    async fn update<E: SyncEntity>(&self, record: &E, device_id: &str) -> Result<RemoteRow<E>> {
        self.admit_write(record.id())?;
        record.validate()?;
        let key = (E::COLLECTION, record.id());
        let mut docs = write(&self.documents)?;
        let existing: RemoteRow<E> = match docs.get(&key) {
            Some(doc) => decode(doc.clone())?,
            None => {
                return Err(Error::Validation(format!(
                    "no {} row with id {}",
                    E::COLLECTION,
                    record.id()
                )))
            }
        };
        let row = RemoteRow {
            record: record.clone(),
            tombstone: existing.tombstone,
            device_id: Some(device_id.to_string()),
            updated_at: Some(self.now()),
        };
        docs.insert(key, encode(&row)?);
        Ok(row)
    }

    async fn tombstone<E: SyncEntity>(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.admit_write(id)?;
        let key = (E::COLLECTION, id);
        let mut docs = write(&self.documents)?;
        let mut row: RemoteRow<E> = match docs.get(&key) {
            Some(doc) => decode(doc.clone())?,
            None => {
                return Err(Error::Validation(format!(
                    "no {} row with id {}",
                    E::COLLECTION,
                    id
                )))
            }
        };
        row.tombstone = Tombstone::at(at);
        row.updated_at = Some(self.now());
        docs.insert(key, encode(&row)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_pending_changes_visible_before_save() {
        let store = MemoryLocalStore::new();
        let contact = Contact::new("Ada");
        store.upsert(contact.clone()).await.unwrap();

        assert_eq!(store.fetch::<Contact>(contact.id).await.unwrap(), Some(contact.clone()));
        assert!(store.committed::<Contact>().unwrap().is_empty());

        store.save().await.unwrap();
        assert_eq!(store.committed::<Contact>().unwrap(), vec![contact]);
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rollback_discards_pending() {
        let store = MemoryLocalStore::new();
        let contact = Contact::new("Ada");
        store.upsert(contact.clone()).await.unwrap();
        store.save().await.unwrap();

        store.delete::<Contact>(contact.id).await.unwrap();
        assert!(store.fetch::<Contact>(contact.id).await.unwrap().is_none());

        store.rollback().await.unwrap();
        assert!(store.fetch::<Contact>(contact.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_save_keeps_pending() {
        let store = MemoryLocalStore::new();
        store.upsert(Contact::new("Ada")).await.unwrap();
        store.fail_next_save().unwrap();

        assert!(matches!(store.save().await, Err(Error::Database(_))));
        assert_eq!(store.pending_count().unwrap(), 1);

        store.save().await.unwrap();
        assert_eq!(store.committed::<Contact>().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_since_pages_with_cursor() {
        let store = MemoryLocalStore::new();
        let base = Utc::now() - Duration::hours(1);
        for i in 0..5 {
            let at = base + Duration::minutes(i);
            store
                .upsert(Contact::new(format!("c{}", i)).stamped(at, at))
                .await
                .unwrap();
        }

        let since = base - Duration::seconds(1);
        let first: Vec<Contact> = store.changed_since(since, None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].name.as_deref(), Some("c0"));

        let cursor = Cursor::after(first.last().unwrap());
        let rest: Vec<Contact> = store.changed_since(since, Some(cursor), 10).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].name.as_deref(), Some("c2"));

        let none: Vec<Contact> = store
            .changed_since(base + Duration::minutes(10), None, 10)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_collections_are_separate() {
        let store = MemoryLocalStore::new();
        let contact = Contact::new("Ada");
        store.upsert(contact.clone()).await.unwrap();
        store.upsert(Record::new(contact.id)).await.unwrap();

        assert_eq!(store.fetch_all::<Contact>().await.unwrap().len(), 1);
        assert_eq!(store.fetch_all::<Record>().await.unwrap().len(), 1);
        assert!(store.fetch::<Record>(contact.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_selects_exclude_tombstones() {
        let remote = MemoryRemoteStore::new();
        let live = Contact::new("live");
        let gone = Contact::new("gone");
        remote.insert(&live, "dev").await.unwrap();
        remote.insert(&gone, "dev").await.unwrap();
        remote.tombstone::<Contact>(gone.id, Utc::now()).await.unwrap();

        let all: Vec<RemoteRow<Contact>> = remote.select_all(false).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id(), live.id);

        let since = Utc::now() - Duration::hours(1);
        let updated: Vec<RemoteRow<Contact>> =
            remote.select_updated_since(since, false).await.unwrap();
        assert!(updated.iter().all(|row| !row.is_deleted()));
        assert_eq!(updated.len(), 1);

        let with_deleted: Vec<RemoteRow<Contact>> = remote.select_all(true).await.unwrap();
        assert_eq!(with_deleted.len(), 2);

        let row = remote.select_by_id::<Contact>(gone.id).await.unwrap().unwrap();
        assert!(row.is_deleted());
        assert!(row.tombstone.deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_updated_since_uses_acceptance_time() {
        let clock = Arc::new(RwLock::new(Utc::now()));
        let remote = MemoryRemoteStore::new().with_time_source({
            let clock = clock.clone();
            move || *clock.read().unwrap()
        });
        let start = *clock.read().unwrap();

        // Written offline two hours ago, accepted only now.
        let written = start - Duration::hours(2);
        let late = Contact::new("late").stamped(written, written);
        remote.insert(&late, "peer").await.unwrap();

        let since = start - Duration::minutes(1);
        let rows: Vec<RemoteRow<Contact>> =
            remote.select_updated_since(since, false).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].updated_at, Some(start));

        *clock.write().unwrap() = start + Duration::minutes(5);
        remote.tombstone::<Contact>(late.id, start).await.unwrap();
        let rows: Vec<RemoteRow<Contact>> = remote
            .select_updated_since(start + Duration::minutes(1), true)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_deleted());
        assert_eq!(rows[0].remote_modified_at(), start + Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_put_keeps_explicit_acceptance_time() {
        let remote = MemoryRemoteStore::new();
        let long_ago = Utc::now() - Duration::days(3);
        let contact = Contact::new("old").stamped(long_ago, long_ago);
        remote
            .put(RemoteRow::live(contact.clone(), "peer").accepted_at(long_ago))
            .unwrap();
        remote.put(RemoteRow::live(Contact::new("fresh"), "peer")).unwrap();

        let since = Utc::now() - Duration::hours(1);
        let rows: Vec<RemoteRow<Contact>> =
            remote.select_updated_since(since, false).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_ne!(rows[0].id(), contact.id);
    }

    #[tokio::test]
    async fn test_non_finite_score_is_rejected() {
        let remote = MemoryRemoteStore::new();
        let mut record = Record::new(Uuid::new_v4());
        record.quality_score = Some(f64::NAN);
        assert!(matches!(
            remote.insert(&record, "dev").await,
            Err(Error::Validation(_))
        ));
        assert!(remote.snapshot().unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates_and_update_requires_row() {
        let remote = MemoryRemoteStore::new();
        let contact = Contact::new("Ada");
        remote.insert(&contact, "dev").await.unwrap();
        assert!(matches!(
            remote.insert(&contact, "dev").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            remote.update(&Contact::new("Nobody"), "dev").await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let remote = MemoryRemoteStore::new();
        remote.set_offline(true).unwrap();
        assert!(matches!(remote.probe().await, Err(Error::NetworkUnavailable(_))));

        remote.set_offline(false).unwrap();
        remote.fail_transiently(1).unwrap();
        assert!(remote.probe().await.is_err());
        assert!(remote.probe().await.is_ok());

        let contact = Contact::new("Ada");
        remote.reject_writes_for(contact.id).unwrap();
        assert!(matches!(
            remote.insert(&contact, "dev").await,
            Err(Error::Validation(_))
        ));
        remote.clear_faults().unwrap();
        assert!(remote.insert(&contact, "dev").await.is_ok());

        remote.set_change_feed_down(true).unwrap();
        let since = Utc::now() - Duration::hours(1);
        assert!(remote.select_updated_since::<Contact>(since, false).await.is_err());
        assert!(remote.select_all::<Contact>(false).await.is_ok());
        assert_eq!(remote.call_count(), 7);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let remote = MemoryRemoteStore::new();
        let contact = Contact::new("Ada");
        remote.insert(&contact, "dev").await.unwrap();
        remote.insert(&Record::new(contact.id), "dev").await.unwrap();

        let snapshot = remote.snapshot().unwrap();
        let restored = MemoryRemoteStore::from_snapshot(snapshot).unwrap();
        assert_eq!(restored.snapshot().unwrap().contacts.len(), 1);
        assert_eq!(restored.snapshot().unwrap().records.len(), 1);
    }
}
