//! Per-pass statistics and the rolling outcome history.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use twinsync_common::Collection;

use crate::config::duration_ms;

/// Write counts for one collection, across both replicas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl CollectionStats {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// Immutable summary of a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub contacts: CollectionStats,
    pub records: CollectionStats,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// Time spent waiting on the remote store, backoff included.
    #[serde(with = "duration_ms")]
    pub network_latency: Duration,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub bytes_transferred: u64,
    pub retry_attempts: u64,
}

impl SyncStats {
    pub fn collection(&self, collection: Collection) -> &CollectionStats {
        match collection {
            Collection::Contacts => &self.contacts,
            Collection::Records => &self.records,
        }
    }

    /// True when the pass wrote nothing and saw no conflict.
    pub fn is_quiescent(&self) -> bool {
        self.contacts.total() == 0
            && self.records.total() == 0
            && self.conflicts_detected == 0
            && self.conflicts_resolved == 0
    }
}

/// Mutable statistics for the pass in flight.
#[derive(Debug)]
pub struct StatsAccumulator {
    stats: SyncStats,
    started: Instant,
}

impl StatsAccumulator {
    pub fn start() -> Self {
        Self {
            stats: SyncStats::default(),
            started: Instant::now(),
        }
    }

    fn collection_mut(&mut self, collection: Collection) -> &mut CollectionStats {
        match collection {
            Collection::Contacts => &mut self.stats.contacts,
            Collection::Records => &mut self.stats.records,
        }
    }

    pub fn inserted(&mut self, collection: Collection) {
        self.collection_mut(collection).inserted += 1;
    }

    pub fn updated(&mut self, collection: Collection) {
        self.collection_mut(collection).updated += 1;
    }

    pub fn deleted(&mut self, collection: Collection) {
        self.collection_mut(collection).deleted += 1;
    }

    pub fn conflict_detected(&mut self) {
        self.stats.conflicts_detected += 1;
    }

    pub fn conflict_resolved(&mut self) {
        self.stats.conflicts_resolved += 1;
    }

    pub fn add_bytes(&mut self, bytes: u64) {
        self.stats.bytes_transferred += bytes;
    }

    pub fn add_retries(&mut self, retries: u64) {
        self.stats.retry_attempts += retries;
    }

    pub fn add_latency(&mut self, latency: Duration) {
        self.stats.network_latency += latency;
    }

    /// Await a remote call, charging its wall time to network latency.
    pub async fn time<F: Future>(&mut self, call: F) -> F::Output {
        let start = Instant::now();
        let output = call.await;
        self.add_latency(start.elapsed());
        output
    }

    /// Freeze the current counts.
    pub fn snapshot(&self) -> SyncStats {
        SyncStats {
            elapsed: self.started.elapsed(),
            ..self.stats.clone()
        }
    }
}

/// How a finished pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OutcomeKind {
    Success,
    PartialSuccess,
    Failure,
}

/// Diagnostic record of one finished pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub started_at: DateTime<Utc>,
    pub kind: OutcomeKind,
    pub stats: Option<SyncStats>,
    /// Rendered error messages.
    pub errors: Vec<String>,
}

/// Bounded history of recent outcomes, oldest first.
#[derive(Debug, Clone)]
pub struct SyncHistory {
    entries: VecDeque<SyncOutcome>,
    capacity: usize,
}

impl SyncHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, outcome: SyncOutcome) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(outcome);
    }

    pub fn latest(&self) -> Option<&SyncOutcome> {
        self.entries.back()
    }

    pub fn entries(&self) -> impl Iterator<Item = &SyncOutcome> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_counts_per_collection() {
        let mut acc = StatsAccumulator::start();
        acc.inserted(Collection::Contacts);
        acc.inserted(Collection::Contacts);
        acc.deleted(Collection::Records);
        acc.conflict_detected();
        acc.conflict_resolved();
        acc.add_bytes(120);
        acc.add_retries(2);

        let stats = acc.snapshot();
        assert_eq!(stats.contacts.inserted, 2);
        assert_eq!(stats.collection(Collection::Records).deleted, 1);
        assert_eq!(stats.bytes_transferred, 120);
        assert_eq!(stats.retry_attempts, 2);
        assert!(!stats.is_quiescent());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut acc = StatsAccumulator::start();
        let before = acc.snapshot();
        acc.updated(Collection::Contacts);
        assert!(before.is_quiescent());
        assert_eq!(acc.snapshot().contacts.updated, 1);
    }

    #[tokio::test]
    async fn test_time_charges_latency() {
        let mut acc = StatsAccumulator::start();
        let value = acc
            .time(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                7
            })
            .await;
        assert_eq!(value, 7);
        assert!(acc.snapshot().network_latency >= Duration::from_millis(5));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = SyncHistory::new(2);
        for kind in [OutcomeKind::Success, OutcomeKind::Failure, OutcomeKind::PartialSuccess] {
            history.push(SyncOutcome {
                started_at: Utc::now(),
                kind,
                stats: None,
                errors: vec![],
            });
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history.latest().map(|o| o.kind), Some(OutcomeKind::PartialSuccess));
        assert_eq!(history.entries().next().map(|o| o.kind), Some(OutcomeKind::Failure));
    }
}
