//! Referential integrity between records and contacts.

use std::collections::HashSet;
use tracing::warn;
use uuid::Uuid;

use twinsync_common::{Contact, Error, Record};

/// Reports records whose contact cannot be resolved.
///
/// Validation never deletes or relinks anything.
#[derive(Debug, Clone, Default)]
pub struct RelationshipValidator {
    known_contacts: HashSet<Uuid>,
}

impl RelationshipValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add contacts that records may refer to.
    pub fn with_contacts<'a>(mut self, contacts: impl IntoIterator<Item = &'a Contact>) -> Self {
        self.known_contacts.extend(contacts.into_iter().map(|c| c.id));
        self
    }

    /// Add contact identifiers that records may refer to.
    pub fn with_contact_ids(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.known_contacts.extend(ids);
        self
    }

    /// Whether a single record resolves to a known contact.
    pub fn is_linked(&self, record: &Record) -> bool {
        record
            .contact_id
            .map_or(false, |id| self.known_contacts.contains(&id))
    }

    /// One `RelationshipIntegrity` error per unresolved record.
    pub fn validate(&self, records: &[Record]) -> Vec<Error> {
        records
            .iter()
            .filter(|record| !self.is_linked(record))
            .map(|record| {
                warn!(
                    "Record {} has no matching contact ({:?})",
                    record.id, record.contact_id
                );
                Error::RelationshipIntegrity {
                    record_id: record.id,
                    contact_id: record.contact_id,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linked_records_pass() {
        let contact = Contact::new("Ada");
        let record = Record::new(contact.id);
        let validator = RelationshipValidator::new().with_contacts([&contact]);
        assert!(validator.validate(&[record]).is_empty());
    }

    #[test]
    fn test_dangling_and_missing_links_are_reported() {
        let contact = Contact::new("Ada");
        let linked = Record::new(contact.id);
        let dangling = Record::new(Uuid::new_v4());
        let mut unlinked = Record::new(contact.id);
        unlinked.contact_id = None;

        let validator = RelationshipValidator::new().with_contacts([&contact]);
        let errors = validator.validate(&[linked, dangling.clone(), unlinked.clone()]);

        assert_eq!(errors.len(), 2);
        assert!(matches!(
            errors[0],
            Error::RelationshipIntegrity { record_id, contact_id }
                if record_id == dangling.id && contact_id == dangling.contact_id
        ));
        assert!(matches!(
            errors[1],
            Error::RelationshipIntegrity { record_id, contact_id: None } if record_id == unlinked.id
        ));
    }

    #[test]
    fn test_remote_contacts_count() {
        let remote_only = Uuid::new_v4();
        let record = Record::new(remote_only);
        let validator = RelationshipValidator::new().with_contact_ids([remote_only]);
        assert!(validator.is_linked(&record));
    }
}
