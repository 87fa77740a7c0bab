//! In-memory collaborators and fixtures for testing archivist.
//!
//! Every fake records what it was asked to do so tests can assert on the
//! calls, and can be told to fail in the ways the real services fail.

mod fixtures;
mod gateway;
mod notify;
mod store;

pub use fixtures::*;
pub use gateway::{MockStorageGateway, StoreCall, DeletionCall};
pub use notify::{InMemoryJobRegistry, RecordingNotifier};
pub use store::InMemoryEntityStore;
