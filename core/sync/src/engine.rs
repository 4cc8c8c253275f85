//! Core sync engine that orchestrates a reconciliation pass.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use twinsync_common::wire::encoded_len;
use twinsync_common::{Contact, Error, Record, RemoteRow, Result, SyncEntity};
use twinsync_store::{LocalStore, RemoteStore};

use crate::clock::{Clock, SystemClock};
use crate::collector::{ChangeCollector, ChangeFetcher};
use crate::config::SyncConfig;
use crate::conflict::{fill_missing, ConflictDetector, ConflictResolver, Resolution};
use crate::deletion::{DeletionContext, DeletionReconciler};
use crate::progress::{EngineStatus, NoProgress, ProgressSink, ProgressTracker};
use crate::relationship::RelationshipValidator;
use crate::retry::RetryExecutor;
use crate::stats::{OutcomeKind, StatsAccumulator, SyncHistory, SyncOutcome, SyncStats};
use crate::watermark::{is_initial, Direction, WatermarkStore};

/// Result of one sync pass.
#[derive(Debug)]
pub enum SyncResult {
    /// Everything reconciled.
    Success(SyncStats),
    /// The pass completed but some records failed; their collections keep
    /// their previous watermarks.
    PartialSuccess(SyncStats, Vec<Error>),
    /// The pass was aborted.
    Failure(Error),
}

impl SyncResult {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            SyncResult::Success(_) => OutcomeKind::Success,
            SyncResult::PartialSuccess(..) => OutcomeKind::PartialSuccess,
            SyncResult::Failure(_) => OutcomeKind::Failure,
        }
    }

    pub fn stats(&self) -> Option<&SyncStats> {
        match self {
            SyncResult::Success(stats) | SyncResult::PartialSuccess(stats, _) => Some(stats),
            SyncResult::Failure(_) => None,
        }
    }

    /// Non-fatal errors of a partial success.
    pub fn errors(&self) -> &[Error] {
        match self {
            SyncResult::PartialSuccess(_, errors) => errors,
            _ => &[],
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SyncResult::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, SyncResult::Failure(_))
    }

    /// Diagnostic record of this result.
    pub fn outcome(&self, started_at: DateTime<Utc>) -> SyncOutcome {
        let errors = match self {
            SyncResult::Success(_) => Vec::new(),
            SyncResult::PartialSuccess(_, errors) => errors.iter().map(ToString::to_string).collect(),
            SyncResult::Failure(err) => vec![err.to_string()],
        };
        SyncOutcome {
            started_at,
            kind: self.kind(),
            stats: self.stats().cloned(),
            errors,
        }
    }
}

/// Releases the single-flight flag when a pass ends, however it ends.
struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// State of the pass in flight.
struct Pass<'a> {
    started_at: DateTime<Utc>,
    stats: StatsAccumulator,
    errors: Vec<Error>,
    progress: ProgressTracker<'a>,
}

#[derive(Debug)]
struct Diagnostics {
    last: Option<SyncOutcome>,
    history: SyncHistory,
}

/// Main sync engine reconciling a local store with a remote store.
///
/// One engine serves one pair of stores. Passes are single-flight: a call
/// to [`perform_sync`](Self::perform_sync) while another runs fails with
/// [`Error::ConcurrentModification`].
pub struct SyncEngine<L, R> {
    local: Arc<L>,
    remote: Arc<R>,
    watermarks: Arc<dyn WatermarkStore>,
    clock: Arc<dyn Clock>,
    progress: Arc<dyn ProgressSink>,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    deletions: DeletionReconciler,
    retry: RetryExecutor,
    config: SyncConfig,
    in_progress: AtomicBool,
    cancelled: AtomicBool,
    status: watch::Sender<EngineStatus>,
    diagnostics: Mutex<Diagnostics>,
}

impl<L: LocalStore, R: RemoteStore> SyncEngine<L, R> {
    /// Create a new sync engine using the system clock.
    pub fn new(
        local: Arc<L>,
        remote: Arc<R>,
        watermarks: Arc<dyn WatermarkStore>,
        config: SyncConfig,
    ) -> Self {
        let (status, _) = watch::channel(EngineStatus::Idle);
        Self {
            local,
            remote,
            watermarks,
            clock: Arc::new(SystemClock::generated()),
            progress: Arc::new(NoProgress),
            detector: ConflictDetector::new(config.conflict_window),
            resolver: ConflictResolver::new(config.conflict_strategy),
            deletions: DeletionReconciler::new(),
            retry: RetryExecutor::new(config.retry.clone()),
            in_progress: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            status,
            diagnostics: Mutex::new(Diagnostics {
                last: None,
                history: SyncHistory::new(config.history_len),
            }),
            config,
        }
    }

    /// Use a different clock (and therefore device id).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Receive `(fraction, status)` updates during each pass.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn local(&self) -> &Arc<L> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn device_id(&self) -> &str {
        self.clock.device_id()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Watch the engine status.
    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    /// Outcome of the most recent finished pass.
    pub fn last_result(&self) -> Option<SyncOutcome> {
        self.diagnostics().last.clone()
    }

    /// Recent outcomes, oldest first.
    pub fn history(&self) -> Vec<SyncOutcome> {
        self.diagnostics().history.entries().cloned().collect()
    }

    fn diagnostics(&self) -> std::sync::MutexGuard<'_, Diagnostics> {
        self.diagnostics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask the running pass to stop before its next phase.
    ///
    /// Calls already in flight are not aborted. Returns false when no pass
    /// is running.
    pub fn cancel(&self) -> bool {
        if !self.is_syncing() {
            return false;
        }
        info!("Cancellation requested");
        self.cancelled.store(true, Ordering::Release);
        true
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Run one reconciliation pass over both collections.
    pub async fn perform_sync(&self) -> SyncResult {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Sync requested while another pass is running");
            return SyncResult::Failure(Error::ConcurrentModification);
        }
        let _guard = InProgressGuard(&self.in_progress);
        self.cancelled.store(false, Ordering::Release);
        self.retry.take_retry_count();

        let started_at = self.clock.now();
        info!(
            "Starting sync pass from device {} ({} <-> {})",
            self.clock.device_id(),
            self.local.name(),
            self.remote.name()
        );

        let mut pass = Pass {
            started_at,
            stats: StatsAccumulator::start(),
            errors: Vec::new(),
            progress: ProgressTracker::new(self.progress.as_ref(), &self.status),
        };

        let result = match self.run_pass(&mut pass).await {
            Ok(()) => {
                pass.stats.add_retries(self.retry.take_retry_count());
                let stats = pass.stats.snapshot();
                info!(
                    "Sync pass finished in {:?}: contacts {:?}, records {:?}, {} conflicts, {} errors",
                    stats.elapsed,
                    stats.contacts,
                    stats.records,
                    stats.conflicts_detected,
                    pass.errors.len()
                );
                if pass.errors.is_empty() {
                    SyncResult::Success(stats)
                } else {
                    SyncResult::PartialSuccess(stats, pass.errors)
                }
            }
            Err(err) => {
                error!(
                    "Sync pass failed at {:.0}%: {}",
                    pass.progress.last() * 100.0,
                    err
                );
                if let Err(rollback) = self.local.rollback().await {
                    warn!("Failed to roll back local changes: {}", rollback);
                }
                SyncResult::Failure(err)
            }
        };

        let outcome = result.outcome(started_at);
        {
            let mut diagnostics = self.diagnostics();
            diagnostics.history.push(outcome.clone());
            diagnostics.last = Some(outcome.clone());
        }
        self.status.send_replace(EngineStatus::Finished(outcome));

        result
    }

    /// Run every phase. `Err` means the pass failed as a whole.
    async fn run_pass(&self, pass: &mut Pass<'_>) -> Result<()> {
        self.checkpoint()?;
        pass.progress.report(0.0, "Checking connectivity");
        pass.stats
            .time(self.retry.execute(|| self.remote.probe()))
            .await?;
        pass.progress.report(0.1, "Connected");

        self.checkpoint()?;
        self.sync_collection::<Contact>(pass, 0.1, 0.45).await?;

        self.checkpoint()?;
        self.sync_collection::<Record>(pass, 0.45, 0.8).await?;

        self.checkpoint()?;
        pass.progress.report(0.8, "Validating relationships");
        self.validate_relationships(pass).await?;

        self.checkpoint()?;
        pass.progress.report(0.9, "Committing");
        self.local.save().await?;
        pass.progress.report(1.0, "Sync complete");
        Ok(())
    }

    /// Upload, download and deletions for one collection, then commit.
    async fn sync_collection<E: SyncEntity>(
        &self,
        pass: &mut Pass<'_>,
        start: f64,
        end: f64,
    ) -> Result<()> {
        let collection = E::COLLECTION;
        let upload_mark = self.watermarks.get(collection, Direction::Upload).await?;
        let download_mark = self.watermarks.get(collection, Direction::Download).await?;
        let first_sync = is_initial(upload_mark) || is_initial(download_mark);
        let errors_before = pass.errors.len();

        let mut failed: HashSet<Uuid> = HashSet::new();
        let mut handled: HashSet<Uuid> = HashSet::new();

        pass.progress
            .report_within(start, end, 0, 3, &format!("Uploading {}", collection));
        let collector = ChangeCollector::new(self.local.as_ref(), self.config.batch_size);
        let mut scan = collector.changes_since::<E>(upload_mark);
        while let Some(batch) = scan.next_batch().await? {
            for record in batch {
                let id = record.id();
                handled.insert(id);
                if let Err(err) = self.upload_one(pass, record).await {
                    warn!("Failed to upload {} {}: {}", collection, id, err);
                    failed.insert(id);
                    pass.errors.push(err);
                }
            }
        }

        self.checkpoint()?;
        pass.progress
            .report_within(start, end, 1, 3, &format!("Downloading {}", collection));
        let fetcher = ChangeFetcher::new(self.remote.as_ref(), &self.retry);
        let downloaded = match pass.stats.time(fetcher.fetch_changes::<E>(download_mark)).await {
            Ok(rows) => {
                for row in rows {
                    let id = row.id();
                    if !handled.insert(id) {
                        continue;
                    }
                    pass.stats.add_bytes(encoded_len(&row));
                    if let Err(err) = self.download_one(pass, row).await {
                        warn!("Failed to download {} {}: {}", collection, id, err);
                        failed.insert(id);
                        pass.errors.push(err);
                    }
                }
                true
            }
            Err(err) => {
                warn!("Failed to fetch remote {}: {}", collection, err);
                pass.errors.push(err);
                false
            }
        };

        self.checkpoint()?;
        pass.progress
            .report_within(start, end, 2, 3, &format!("Reconciling {} deletions", collection));
        if downloaded {
            self.reconcile_deletions::<E>(pass, first_sync, &failed)
                .await?;
        } else {
            debug!("Skipping {} deletions, remote state unknown", collection);
        }

        self.local.save().await?;

        let collection_errors = pass.errors.len() - errors_before;
        if collection_errors == 0 {
            for direction in Direction::ALL {
                if let Err(err) = self
                    .watermarks
                    .set(collection, direction, pass.started_at)
                    .await
                {
                    warn!(
                        "Failed to advance {} {} watermark: {}",
                        collection, direction, err
                    );
                    pass.errors.push(err);
                }
            }
        } else {
            info!(
                "Keeping {} watermarks: {} records failed",
                collection, collection_errors
            );
        }

        let stats = pass.stats.snapshot();
        info!(
            "Synced {}: {:?}",
            collection,
            stats.collection(collection)
        );
        pass.progress
            .report_within(start, end, 3, 3, &format!("Synced {}", collection));
        Ok(())
    }

    /// Push one local change.
    async fn upload_one<E: SyncEntity>(&self, pass: &mut Pass<'_>, record: E) -> Result<()> {
        let id = record.id();
        let existing = pass
            .stats
            .time(self.retry.execute(|| self.remote.select_by_id::<E>(id)))
            .await?;

        match existing {
            None => {
                self.push_insert(&mut pass.stats, &record).await?;
                pass.stats.inserted(E::COLLECTION);
                debug!("Inserted remote {} {}", E::COLLECTION, id);
            }
            Some(row) if row.is_deleted() => {
                debug!(
                    "Not uploading {} {}: tombstoned remotely",
                    E::COLLECTION,
                    id
                );
            }
            Some(row) => {
                pass.stats.add_bytes(encoded_len(&row));
                self.reconcile_pair(pass, record, row.record).await?;
            }
        }
        Ok(())
    }

    /// Apply one remote change locally.
    async fn download_one<E: SyncEntity>(&self, pass: &mut Pass<'_>, row: RemoteRow<E>) -> Result<()> {
        let id = row.id();
        match self.local.fetch::<E>(id).await? {
            None => {
                self.local.upsert(row.record).await?;
                pass.stats.inserted(E::COLLECTION);
                debug!("Inserted local {} {}", E::COLLECTION, id);
            }
            Some(local) => self.reconcile_pair(pass, local, row.record).await?,
        }
        Ok(())
    }

    /// Bring two live versions of one record into agreement.
    async fn reconcile_pair<E: SyncEntity>(
        &self,
        pass: &mut Pass<'_>,
        local: E,
        remote: E,
    ) -> Result<()> {
        let collection = E::COLLECTION;
        let id = local.id();
        if local.same_content(&remote) {
            return Ok(());
        }

        if let Some(conflict) = self.detector.detect(&local, &remote) {
            pass.stats.conflict_detected();
            info!(
                "Conflict on {} {} in fields {:?}",
                collection, id, conflict.fields
            );

            match self.resolver.resolve(&conflict) {
                Resolution::KeptLocal(record) => {
                    self.push_update(&mut pass.stats, &record).await?;
                }
                Resolution::AppliedRemote(record) => {
                    self.local.upsert(record).await?;
                }
                Resolution::Merged {
                    mut record,
                    from_remote,
                } => {
                    debug!("Merged {} {}, remote fields {:?}", collection, id, from_remote);
                    // Strictly after this pass's watermark so the next pass
                    // uploads the merged version.
                    let floor = pass.started_at + chrono::Duration::milliseconds(1);
                    record.set_modified_at(self.clock.now().max(floor));
                    self.local.upsert(record).await?;
                }
            }
            pass.stats.conflict_resolved();
            pass.stats.updated(collection);
            return Ok(());
        }

        if self
            .detector
            .within_window(local.modified_at(), remote.modified_at())
        {
            debug!("Applying remote {} {} inside conflict window", collection, id);
            self.local.upsert(remote).await?;
            pass.stats.updated(collection);
            return Ok(());
        }

        let remote_newer = remote.modified_at() > local.modified_at();
        let (mut merged, older) = if remote_newer {
            (remote.clone(), &local)
        } else {
            (local.clone(), &remote)
        };
        let filled = fill_missing(&mut merged, older);
        debug!("Filled {} {} fields {:?}", collection, id, filled);

        if !merged.same_content(&local) {
            self.local.upsert(merged.clone()).await?;
            pass.stats.updated(collection);
        }
        if !merged.same_content(&remote) {
            self.push_update(&mut pass.stats, &merged).await?;
            pass.stats.updated(collection);
        }
        Ok(())
    }

    async fn push_insert<E: SyncEntity>(&self, stats: &mut StatsAccumulator, record: &E) -> Result<()> {
        let device_id = self.clock.device_id();
        stats
            .time(self.retry.execute(|| self.remote.insert(record, device_id)))
            .await?;
        stats.add_bytes(encoded_len(record));
        Ok(())
    }

    async fn push_update<E: SyncEntity>(&self, stats: &mut StatsAccumulator, record: &E) -> Result<()> {
        let device_id = self.clock.device_id();
        stats
            .time(self.retry.execute(|| self.remote.update(record, device_id)))
            .await?;
        stats.add_bytes(encoded_len(record));
        Ok(())
    }

    /// Plan and apply deletions for one collection.
    async fn reconcile_deletions<E: SyncEntity>(
        &self,
        pass: &mut Pass<'_>,
        first_sync: bool,
        failed: &HashSet<Uuid>,
    ) -> Result<()> {
        let collection = E::COLLECTION;
        let fetcher = ChangeFetcher::new(self.remote.as_ref(), &self.retry);
        let rows = match pass.stats.time(fetcher.fetch_rows::<E>()).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!("Failed to list remote {}: {}", collection, err);
                pass.errors.push(err);
                return Ok(());
            }
        };
        let locals: Vec<E> = self.local.fetch_all().await?;

        let now = self.clock.now();
        let ctx = DeletionContext::new(now, self.config.grace_window)
            .first_sync(first_sync)
            .protect(failed.iter().copied())
            .tombstoned(rows.tombstoned_ids());
        let plan = self.deletions.plan(&locals, &rows.live, &ctx);

        if !plan.deferred.is_empty() {
            debug!(
                "{} {} deletions deferred by grace window",
                plan.deferred.len(),
                collection
            );
        }

        for id in plan.delete_locally {
            match self.local.delete::<E>(id).await {
                Ok(()) => pass.stats.deleted(collection),
                Err(err) => {
                    warn!("Failed to delete local {} {}: {}", collection, id, err);
                    pass.errors.push(err);
                }
            }
        }

        for id in plan.tombstone_remotely {
            let tombstoned = pass
                .stats
                .time(self.retry.execute(|| self.remote.tombstone::<E>(id, now)))
                .await;
            match tombstoned {
                Ok(()) => pass.stats.deleted(collection),
                Err(err) => {
                    warn!("Failed to tombstone remote {} {}: {}", collection, id, err);
                    pass.errors.push(err);
                }
            }
        }
        Ok(())
    }

    /// Report records whose contact exists on neither side.
    async fn validate_relationships(&self, pass: &mut Pass<'_>) -> Result<()> {
        let records: Vec<Record> = self.local.fetch_all().await?;
        let contacts: Vec<Contact> = self.local.fetch_all().await?;

        let fetcher = ChangeFetcher::new(self.remote.as_ref(), &self.retry);
        match pass.stats.time(fetcher.fetch_live::<Contact>()).await {
            Ok(remote_contacts) => {
                let violations = RelationshipValidator::new()
                    .with_contacts(&contacts)
                    .with_contact_ids(remote_contacts.iter().map(RemoteRow::id))
                    .validate(&records);
                if !violations.is_empty() {
                    warn!("{} records fail relationship checks", violations.len());
                }
                pass.errors.extend(violations);
            }
            Err(err) => {
                warn!("Skipping relationship validation: {}", err);
                pass.errors.push(err);
            }
        }
        Ok(())
    }
}
