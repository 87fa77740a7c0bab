/// PostgreSQL persistence implementation of the entity store.
///
/// This module provides `PostgresEntityStore`, a PostgreSQL-backed
/// implementation of the [`crate::store::EntityStore`] trait.
pub mod postgres;

pub use postgres::PostgresEntityStore;
