//! Common utilities and types shared across TwinSync modules.
//!
//! This module provides the error taxonomy, the replicated data model and
//! the field-level comparison contract used by the reconciliation engine.

pub mod entity;
pub mod error;
pub mod types;
pub mod wire;

pub use entity::{AnyEntity, Collection, FieldValue, SyncEntity};
pub use error::{Error, Result};
pub use types::{Contact, Record, RemoteRow, Tombstone};
