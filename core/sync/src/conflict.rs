//! Conflict detection and resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use twinsync_common::{Collection, SyncEntity};

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStrategy {
    /// Keep the local version; the remote one is not applied.
    LocalWins,
    /// Overwrite every local field with the remote version.
    RemoteWins,
    /// The strictly newer side wins the whole record; ties keep local.
    #[default]
    MostRecent,
    /// One-sided fields are united; conflicting fields follow MostRecent.
    Merge,
}

/// A field-level divergence between two versions of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict<E> {
    pub collection: Collection,
    pub entity_id: Uuid,
    pub local: E,
    pub remote: E,
    /// Fields set on both sides to different values.
    pub fields: Vec<&'static str>,
    pub local_modified_at: DateTime<Utc>,
    pub remote_modified_at: DateTime<Utc>,
}

impl<E> Conflict<E> {
    /// Whether the remote version is strictly newer.
    pub fn remote_is_newer(&self) -> bool {
        self.remote_modified_at > self.local_modified_at
    }
}

/// Fields that both versions set, to different values.
pub fn conflicting_fields<E: SyncEntity>(local: &E, remote: &E) -> Vec<&'static str> {
    local
        .fields()
        .into_iter()
        .zip(remote.fields())
        .filter(|((_, l), (_, r))| !l.is_empty() && !r.is_empty() && l != r)
        .map(|((name, _), _)| name)
        .collect()
}

/// Copy into `target` every field it lacks and `source` has.
///
/// Returns the names of the copied fields.
pub fn fill_missing<E: SyncEntity>(target: &mut E, source: &E) -> Vec<&'static str> {
    let missing: Vec<&'static str> = target
        .fields()
        .into_iter()
        .zip(source.fields())
        .filter(|((_, t), (_, s))| t.is_empty() && !s.is_empty())
        .map(|((name, _), _)| name)
        .collect();

    for name in &missing {
        target.copy_field(name, source);
    }
    missing
}

/// Decides whether two versions of a record genuinely diverge.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    window: Duration,
}

impl ConflictDetector {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Whether two modification times are too close to order causally.
    pub fn within_window(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        (a - b).abs().to_std().map_or(false, |gap| gap < self.window)
    }

    /// Detect a conflict between the local and remote version of one record.
    pub fn detect<E: SyncEntity>(&self, local: &E, remote: &E) -> Option<Conflict<E>> {
        if self.within_window(local.modified_at(), remote.modified_at()) {
            return None;
        }

        let fields = conflicting_fields(local, remote);
        if fields.is_empty() {
            return None;
        }

        Some(Conflict {
            collection: E::COLLECTION,
            entity_id: local.id(),
            local: local.clone(),
            remote: remote.clone(),
            fields,
            local_modified_at: local.modified_at(),
            remote_modified_at: remote.modified_at(),
        })
    }
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Result of conflict resolution, carrying the new local version.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<E> {
    /// Local version kept verbatim.
    KeptLocal(E),
    /// Remote version replaced the local one.
    AppliedRemote(E),
    /// Field-level mix of both versions.
    Merged { record: E, from_remote: Vec<&'static str> },
}

impl<E> Resolution<E> {
    pub fn record(&self) -> &E {
        match self {
            Resolution::KeptLocal(r) | Resolution::AppliedRemote(r) => r,
            Resolution::Merged { record, .. } => record,
        }
    }

    pub fn into_record(self) -> E {
        match self {
            Resolution::KeptLocal(r) | Resolution::AppliedRemote(r) => r,
            Resolution::Merged { record, .. } => record,
        }
    }
}

/// Applies a strategy to detected conflicts.
///
/// Resolution only produces the new local version; it never writes to
/// either store.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Resolve with the configured strategy.
    pub fn resolve<E: SyncEntity>(&self, conflict: &Conflict<E>) -> Resolution<E> {
        self.resolve_with(conflict, self.strategy)
    }

    /// Resolve with an explicit strategy.
    pub fn resolve_with<E: SyncEntity>(
        &self,
        conflict: &Conflict<E>,
        strategy: ConflictStrategy,
    ) -> Resolution<E> {
        match strategy {
            ConflictStrategy::LocalWins => Resolution::KeptLocal(conflict.local.clone()),
            ConflictStrategy::RemoteWins => Resolution::AppliedRemote(conflict.remote.clone()),
            ConflictStrategy::MostRecent => {
                if conflict.remote_is_newer() {
                    Resolution::AppliedRemote(conflict.remote.clone())
                } else {
                    Resolution::KeptLocal(conflict.local.clone())
                }
            }
            ConflictStrategy::Merge => Self::merge(conflict),
        }
    }

    // TODO: semantic per-field merge (e.g. appending notes) once the
    // expected behaviour for text fields is settled.
    fn merge<E: SyncEntity>(conflict: &Conflict<E>) -> Resolution<E> {
        let remote_newer = conflict.remote_is_newer();
        let (newer, older) = if remote_newer {
            (&conflict.remote, &conflict.local)
        } else {
            (&conflict.local, &conflict.remote)
        };

        let mut record = newer.clone();
        let filled = fill_missing(&mut record, older);

        match (remote_newer, filled.is_empty()) {
            (false, true) => Resolution::KeptLocal(record),
            (true, true) => Resolution::AppliedRemote(record),
            (false, false) => Resolution::Merged {
                record,
                from_remote: filled,
            },
            (true, false) => {
                // Everything except the local-only fields came from remote.
                let from_remote = record
                    .fields()
                    .into_iter()
                    .map(|(name, _)| name)
                    .filter(|name| !filled.contains(name))
                    .collect();
                Resolution::Merged {
                    record,
                    from_remote,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;
    use twinsync_common::Contact;

    fn pair(gap_secs: i64) -> (Contact, Contact) {
        let base = Utc::now();
        let mut local = Contact::new("Ada").stamped(base, base);
        local.notes = Some("local notes".to_string());
        let mut remote = local.clone();
        remote.notes = Some("remote notes".to_string());
        remote.modified_at = base + ChronoDuration::seconds(gap_secs);
        (local, remote)
    }

    #[test]
    fn test_no_conflict_inside_window() {
        let detector = ConflictDetector::default();
        let (local, remote) = pair(4);
        assert!(detector.detect(&local, &remote).is_none());

        let (local, remote) = pair(-4);
        assert!(detector.detect(&local, &remote).is_none());
    }

    #[test]
    fn test_conflict_outside_window() {
        let detector = ConflictDetector::default();
        let (local, remote) = pair(600);
        let conflict = detector.detect(&local, &remote).unwrap();
        assert_eq!(conflict.fields, vec!["notes"]);
        assert_eq!(conflict.entity_id, local.id);
        assert!(conflict.remote_is_newer());
    }

    #[test]
    fn test_one_sided_fields_do_not_conflict() {
        let detector = ConflictDetector::default();
        let (mut local, mut remote) = pair(600);
        remote.notes = local.notes.clone();
        local.role = Some("Manager".to_string());
        remote.timezone = Some("UTC".to_string());
        assert!(detector.detect(&local, &remote).is_none());
    }

    #[test]
    fn test_booleans_always_compare() {
        let detector = ConflictDetector::default();
        let (local, mut remote) = pair(600);
        remote.notes = local.notes.clone();
        remote.is_direct_report = true;
        let conflict = detector.detect(&local, &remote).unwrap();
        assert_eq!(conflict.fields, vec!["isDirectReport"]);
    }

    #[test]
    fn test_most_recent_picks_newer_side() {
        let detector = ConflictDetector::default();
        let resolver = ConflictResolver::new(ConflictStrategy::MostRecent);

        let (local, remote) = pair(600);
        let resolution = resolver.resolve(&detector.detect(&local, &remote).unwrap());
        assert_eq!(resolution, Resolution::AppliedRemote(remote.clone()));

        let (local, remote) = pair(-600);
        let resolution = resolver.resolve(&detector.detect(&local, &remote).unwrap());
        assert_eq!(resolution, Resolution::KeptLocal(local.clone()));
    }

    #[test]
    fn test_most_recent_tie_keeps_local() {
        let (local, remote) = pair(0);
        let conflict = Conflict {
            collection: Collection::Contacts,
            entity_id: local.id,
            fields: vec!["notes"],
            local_modified_at: local.modified_at,
            remote_modified_at: remote.modified_at,
            local: local.clone(),
            remote,
        };
        let resolution = ConflictResolver::new(ConflictStrategy::MostRecent).resolve(&conflict);
        assert_eq!(resolution, Resolution::KeptLocal(local));
    }

    #[test]
    fn test_fixed_strategies() {
        let (local, remote) = pair(-600);
        let conflict = ConflictDetector::default().detect(&local, &remote).unwrap();
        let resolver = ConflictResolver::default();

        assert_eq!(
            resolver.resolve_with(&conflict, ConflictStrategy::LocalWins),
            Resolution::KeptLocal(local.clone())
        );
        assert_eq!(
            resolver.resolve_with(&conflict, ConflictStrategy::RemoteWins),
            Resolution::AppliedRemote(remote.clone())
        );
    }

    #[test]
    fn test_merge_unites_one_sided_fields() {
        let (mut local, mut remote) = pair(600);
        local.role = Some("Lead".to_string());
        remote.timezone = Some("Asia/Tokyo".to_string());

        let conflict = ConflictDetector::default().detect(&local, &remote).unwrap();
        let resolution = ConflictResolver::new(ConflictStrategy::Merge).resolve(&conflict);

        let Resolution::Merged { record, from_remote } = resolution else {
            panic!("expected merge");
        };
        // Remote is newer: its notes win, local-only role survives.
        assert_eq!(record.notes.as_deref(), Some("remote notes"));
        assert_eq!(record.role.as_deref(), Some("Lead"));
        assert_eq!(record.timezone.as_deref(), Some("Asia/Tokyo"));
        assert!(from_remote.contains(&"notes"));
        assert!(!from_remote.contains(&"role"));
        assert_eq!(record.modified_at, remote.modified_at);
    }

    #[test]
    fn test_merge_without_extras_matches_most_recent() {
        let (local, remote) = pair(-600);
        let conflict = ConflictDetector::default().detect(&local, &remote).unwrap();
        assert_eq!(
            ConflictResolver::new(ConflictStrategy::Merge).resolve(&conflict),
            Resolution::KeptLocal(local)
        );
    }

    #[test]
    fn test_fill_missing() {
        let (mut local, mut remote) = pair(0);
        remote.role = Some("CTO".to_string());
        local.timezone = Some("UTC".to_string());

        let filled = fill_missing(&mut local, &remote);
        assert_eq!(filled, vec!["role"]);
        assert_eq!(local.role.as_deref(), Some("CTO"));
        assert_eq!(local.notes.as_deref(), Some("local notes"));
    }

    proptest! {
        #[test]
        fn prop_window_suppresses_conflicts(
            gap_ms in -4_999i64..5_000,
            local_notes in "[a-z]{1,12}",
            remote_notes in "[a-z]{1,12}",
            remote_report in any::<bool>(),
        ) {
            let base = Utc::now();
            let mut local = Contact::new("x").stamped(base, base);
            local.notes = Some(local_notes);
            let mut remote = local.clone();
            remote.notes = Some(remote_notes);
            remote.is_direct_report = remote_report;
            remote.modified_at = base + ChronoDuration::milliseconds(gap_ms);

            prop_assert!(ConflictDetector::default().detect(&local, &remote).is_none());
        }

        #[test]
        fn prop_most_recent_takes_strictly_newer(gap_s in 6i64..100_000, remote_newer in any::<bool>()) {
            let base = Utc::now();
            let mut local = Contact::new("x").stamped(base, base);
            local.notes = Some("l".to_string());
            let mut remote = local.clone();
            remote.notes = Some("r".to_string());
            let offset = ChronoDuration::seconds(if remote_newer { gap_s } else { -gap_s });
            remote.modified_at = base + offset;

            let conflict = ConflictDetector::default().detect(&local, &remote).unwrap();
            let record = ConflictResolver::default().resolve(&conflict).into_record();
            let expected = if remote_newer { &remote } else { &local };
            prop_assert_eq!(&record, expected);
        }
    }
}
