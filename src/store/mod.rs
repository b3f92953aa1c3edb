// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable store: the system of record.
//!
//! [`DurableStore`] is the record-level interface the
//! [`StoreGateway`](crate::gateway::StoreGateway) talks to. Each entity type
//! gets its own table, described by a [`StoreTable`]. Every call is one
//! transactional unit of work: either all of it is applied or none of it is.
//!
//! Backends:
//!
//! - [`SqliteStore`]: sqlx + SQLite, one `(id, record, updated_at)` table per type
//! - [`MemoryStore`]: in-process maps with access counters and failure injection

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::codec::CacheRecord;
use crate::entity::{Entity, EntityId, IdStrategy};
use crate::error::BoxFuture;
use serde_json::Value;

/// Table description for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTable {
    /// Table name (the repository name, e.g. `users`).
    pub name: String,
    /// Identifier key inside the record.
    pub id_field: &'static str,
    /// How ids are allocated for records saved without one.
    pub id_strategy: IdStrategy,
}

impl StoreTable {
    /// Table for entity type `T`.
    pub fn for_entity<T: Entity>() -> Self {
        let schema = T::schema();
        Self {
            name: schema.repository_name(),
            id_field: schema.id_field,
            id_strategy: <T::Id as EntityId>::STRATEGY,
        }
    }
}

/// Record-level durable store.
///
/// Records are flat cache records. The identifier lives at
/// `record[table.id_field]` and is stored as its key form (`codec::id_key`).
pub trait DurableStore: Send + Sync + 'static {
    /// Create the table if it does not exist.
    fn ensure_table<'a>(&'a self, table: &'a StoreTable) -> BoxFuture<'a, ()>;

    /// Insert or replace a record keyed by its id.
    ///
    /// A record without an id gets one allocated per `table.id_strategy`.
    /// Returns the record as stored (with the id set).
    fn upsert<'a>(&'a self, table: &'a StoreTable, record: CacheRecord) -> BoxFuture<'a, CacheRecord>;

    fn get<'a>(&'a self, table: &'a StoreTable, id: &'a str) -> BoxFuture<'a, Option<CacheRecord>>;

    /// Delete by id. Returns whether a row was removed.
    fn delete<'a>(&'a self, table: &'a StoreTable, id: &'a str) -> BoxFuture<'a, bool>;

    /// Every record in the table, in insertion order.
    fn list<'a>(&'a self, table: &'a StoreTable) -> BoxFuture<'a, Vec<CacheRecord>>;

    /// Records whose `field` equals `value`, at most `limit` of them.
    fn find_by_field<'a>(
        &'a self,
        table: &'a StoreTable,
        field: &'a str,
        value: &'a Value,
        limit: Option<usize>,
    ) -> BoxFuture<'a, Vec<CacheRecord>>;

    /// Delete records whose `field` equals `value`. Returns the row count.
    fn delete_by_field<'a>(
        &'a self,
        table: &'a StoreTable,
        field: &'a str,
        value: &'a Value,
    ) -> BoxFuture<'a, u64>;

    /// Liveness check.
    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Whether `name` is safe to splice into SQL or a JSON path.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("rank_id"));
        assert!(is_valid_identifier("_x1"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1abc"));
        assert!(!is_valid_identifier("users; DROP TABLE x"));
        assert!(!is_valid_identifier("a.b"));
        assert!(!is_valid_identifier("a\"b"));
        assert!(!is_valid_identifier(&"x".repeat(65)));
    }
}
