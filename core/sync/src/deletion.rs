//! Deletion reconciliation.
//!
//! Decides which records vanished on one replica and should therefore be
//! removed from the other. Planning is pure; the engine applies the plan.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use twinsync_common::{RemoteRow, SyncEntity};

/// Inputs that gate deletion for one collection.
#[derive(Debug, Clone)]
pub struct DeletionContext {
    pub now: DateTime<Utc>,
    /// Records younger than this are never deleted.
    pub grace_window: Duration,
    /// A first sync never deletes anything.
    pub first_sync: bool,
    /// Identifiers that failed earlier in this pass.
    pub protected_ids: HashSet<Uuid>,
    /// Identifiers tombstoned remotely. Only used to label decisions.
    pub tombstoned_ids: HashSet<Uuid>,
}

impl DeletionContext {
    pub fn new(now: DateTime<Utc>, grace_window: Duration) -> Self {
        Self {
            now,
            grace_window,
            first_sync: false,
            protected_ids: HashSet::new(),
            tombstoned_ids: HashSet::new(),
        }
    }

    pub fn first_sync(mut self, first_sync: bool) -> Self {
        self.first_sync = first_sync;
        self
    }

    pub fn protect(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.protected_ids.extend(ids);
        self
    }

    pub fn tombstoned(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.tombstoned_ids.extend(ids);
        self
    }

    /// Latest instant at which a record is old enough to delete.
    fn cutoff(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.grace_window)
            .ok()
            .and_then(|grace| self.now.checked_sub_signed(grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Which side a deferred candidate would have been deleted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionSide {
    Local,
    Remote,
}

/// Deletions for one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionPlan {
    /// Local records whose remote counterpart is gone.
    pub delete_locally: Vec<Uuid>,
    /// Remote rows whose local counterpart is gone.
    pub tombstone_remotely: Vec<Uuid>,
    /// Candidates still inside the grace window.
    pub deferred: Vec<(Uuid, DeletionSide)>,
}

impl DeletionPlan {
    pub fn is_empty(&self) -> bool {
        self.delete_locally.is_empty() && self.tombstone_remotely.is_empty()
    }
}

/// Plans deletions from the two replicas' contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeletionReconciler;

impl DeletionReconciler {
    pub fn new() -> Self {
        Self
    }

    /// Build the plan for one collection.
    ///
    /// `locals` is every local record, `remote_live` every live remote row.
    pub fn plan<E: SyncEntity>(
        &self,
        locals: &[E],
        remote_live: &[RemoteRow<E>],
        ctx: &DeletionContext,
    ) -> DeletionPlan {
        let mut plan = DeletionPlan::default();
        if ctx.first_sync {
            debug!("First {} sync, skipping deletion detection", E::COLLECTION);
            return plan;
        }

        let cutoff = ctx.cutoff();
        let old_enough =
            |created: DateTime<Utc>, modified: DateTime<Utc>| created < cutoff && modified < cutoff;

        let remote_ids: HashSet<Uuid> = remote_live.iter().map(RemoteRow::id).collect();
        let local_ids: HashSet<Uuid> = locals.iter().map(|r| r.id()).collect();

        for record in locals {
            let id = record.id();
            if remote_ids.contains(&id) || ctx.protected_ids.contains(&id) {
                continue;
            }
            if old_enough(record.created_at(), record.modified_at()) {
                let reason = if ctx.tombstoned_ids.contains(&id) {
                    "tombstoned remotely"
                } else {
                    "missing remotely"
                };
                debug!("Deleting local {} {}: {}", E::COLLECTION, id, reason);
                plan.delete_locally.push(id);
            } else {
                debug!(
                    "Deferring deletion of local {} {}: inside grace window",
                    E::COLLECTION,
                    id
                );
                plan.deferred.push((id, DeletionSide::Local));
            }
        }

        for row in remote_live {
            let id = row.id();
            if local_ids.contains(&id) || ctx.protected_ids.contains(&id) {
                continue;
            }
            // A row accepted recently may be a late upload from another
            // replica that this side has not downloaded yet.
            if old_enough(row.record.created_at(), row.record.modified_at())
                && row.remote_modified_at() < cutoff
            {
                debug!("Tombstoning remote {} {}: missing locally", E::COLLECTION, id);
                plan.tombstone_remotely.push(id);
            } else {
                debug!(
                    "Deferring tombstone of remote {} {}: inside grace window",
                    E::COLLECTION,
                    id
                );
                plan.deferred.push((id, DeletionSide::Remote));
            }
        }

        plan
    }
}
