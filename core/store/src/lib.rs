//! Store collaborators for TwinSync.
//!
//! This module defines the contracts the reconciliation engine expects from
//! the local embedded store and the remote networked store, plus in-memory
//! implementations of both.
//!
//! # Design Principles
//! - Store isolation: no store-specific logic in the engine
//! - Async operations: all store calls are async
//! - Soft deletes: the remote side never physically removes rows
//! - Transactional local writes: pending changes become visible to other
//!   readers only after `save`

pub mod memory;
pub mod provider;

pub use memory::{LocalSnapshot, MemoryLocalStore, MemoryRemoteStore, RemoteSnapshot};
pub use provider::{Cursor, LocalStore, RemoteStore};
