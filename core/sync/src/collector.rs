//! Change selection on both replicas.
//!
//! [`ChangeCollector`] walks local changes newer than a watermark in
//! `(modified_at, id)` order, one bounded batch at a time. [`ChangeFetcher`]
//! reads the remote side through the retry executor.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::marker::PhantomData;
use tracing::debug;
use uuid::Uuid;

use twinsync_common::{RemoteRow, Result, SyncEntity};
use twinsync_store::{Cursor, LocalStore, RemoteStore};

use crate::retry::RetryExecutor;
use crate::watermark::is_initial;

/// Reads local changes in keyset-paginated batches.
pub struct ChangeCollector<'a, L: ?Sized> {
    local: &'a L,
    batch_size: usize,
}

impl<'a, L: LocalStore + ?Sized> ChangeCollector<'a, L> {
    pub fn new(local: &'a L, batch_size: usize) -> Self {
        Self {
            local,
            batch_size: batch_size.max(1),
        }
    }

    /// Start a scan of records created or modified after `since`.
    pub fn changes_since<E: SyncEntity>(&self, since: DateTime<Utc>) -> ChangeBatches<'a, L, E> {
        ChangeBatches {
            local: self.local,
            since,
            batch_size: self.batch_size,
            cursor: None,
            seen: HashSet::new(),
            exhausted: false,
            _entity: PhantomData,
        }
    }
}

/// An in-progress scan over local changes.
///
/// Each call to [`next_batch`](Self::next_batch) continues after the last
/// `(modified_at, id)` returned. Records already yielded are not yielded
/// again even if a write in between moved them further along the order.
pub struct ChangeBatches<'a, L: ?Sized, E> {
    local: &'a L,
    since: DateTime<Utc>,
    batch_size: usize,
    cursor: Option<Cursor>,
    seen: HashSet<Uuid>,
    exhausted: bool,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, L: LocalStore + ?Sized, E: SyncEntity> ChangeBatches<'a, L, E> {
    /// The next batch, or `None` once the scan is drained.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<E>>> {
        while !self.exhausted {
            let batch: Vec<E> = self
                .local
                .changed_since(self.since, self.cursor, self.batch_size)
                .await?;

            if batch.len() < self.batch_size {
                self.exhausted = true;
            }
            if let Some(last) = batch.last() {
                self.cursor = Some(Cursor::after(last));
            }

            let fresh: Vec<E> = batch
                .into_iter()
                .filter(|record| self.seen.insert(record.id()))
                .collect();

            if !fresh.is_empty() {
                debug!(
                    "Collected {} local {} changes since {}",
                    fresh.len(),
                    E::COLLECTION,
                    self.since
                );
                return Ok(Some(fresh));
            }
        }
        Ok(None)
    }

    /// Identifiers yielded so far.
    pub fn seen(&self) -> &HashSet<Uuid> {
        &self.seen
    }
}

/// Remote rows of one collection split by tombstone state.
#[derive(Debug, Clone)]
pub struct RemoteRows<E> {
    pub live: Vec<RemoteRow<E>>,
    pub tombstoned: Vec<RemoteRow<E>>,
}

impl<E: SyncEntity> RemoteRows<E> {
    fn partition(rows: Vec<RemoteRow<E>>) -> Self {
        let (tombstoned, live) = rows.into_iter().partition(RemoteRow::is_deleted);
        Self { live, tombstoned }
    }

    pub fn live_ids(&self) -> HashSet<Uuid> {
        self.live.iter().map(RemoteRow::id).collect()
    }

    pub fn tombstoned_ids(&self) -> HashSet<Uuid> {
        self.tombstoned.iter().map(RemoteRow::id).collect()
    }
}

/// Reads remote changes.
pub struct ChangeFetcher<'a, R: ?Sized> {
    remote: &'a R,
    retry: &'a RetryExecutor,
}

impl<'a, R: RemoteStore + ?Sized> ChangeFetcher<'a, R> {
    pub fn new(remote: &'a R, retry: &'a RetryExecutor) -> Self {
        Self { remote, retry }
    }

    /// Live rows changed at or after `since`; every live row on first sync.
    pub async fn fetch_changes<E: SyncEntity>(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteRow<E>>> {
        let rows = if is_initial(since) {
            self.fetch_live::<E>().await?
        } else {
            self.retry
                .execute(|| self.remote.select_updated_since::<E>(since, false))
                .await?
        };

        debug!(
            "Fetched {} remote {} changes since {}",
            rows.len(),
            E::COLLECTION,
            since
        );
        Ok(rows)
    }

    /// Every live row.
    pub async fn fetch_live<E: SyncEntity>(&self) -> Result<Vec<RemoteRow<E>>> {
        self.retry
            .execute(|| self.remote.select_all::<E>(false))
            .await
    }

    /// Every row, split into live and tombstoned.
    pub async fn fetch_rows<E: SyncEntity>(&self) -> Result<RemoteRows<E>> {
        let rows = self
            .retry
            .execute(|| self.remote.select_all::<E>(true))
            .await?;
        Ok(RemoteRows::partition(rows))
    }
}
