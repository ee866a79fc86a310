//! In-memory storage engine for testing.

use crate::data::DatabaseData;
use crate::engine::{validate_database_name, DatabaseImage, StorageEngine};
use crate::error::StorageResult;
use parking_lot::RwLock;
use replica_protocol::{Document, DocumentId, OpPayload, OperationEntry};
use serde_json::Value;
use std::collections::BTreeMap;

/// An in-memory storage engine.
///
/// This engine keeps all databases in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral nodes that don't need persistence
///
/// A "restart" of a node in tests reuses the same `MemoryStorage`
/// instance, so data and persisted replication state survive it.
///
/// # Thread Safety
///
/// This engine is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use replica_protocol::Document;
/// use replica_storage::{MemoryStorage, StorageEngine};
///
/// let storage = MemoryStorage::new();
/// storage.insert_many("app", "users", vec![Document::with_id("u1")]).unwrap();
/// assert_eq!(storage.database_names().unwrap(), vec!["app".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct MemoryStorage {
    databases: RwLock<BTreeMap<String, DatabaseData>>,
}

impl MemoryStorage {
    /// Creates a new empty in-memory engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine pre-populated with databases.
    #[must_use]
    pub fn with_databases(databases: BTreeMap<String, DatabaseData>) -> Self {
        Self {
            databases: RwLock::new(databases),
        }
    }

    /// Returns a copy of one database, if it exists.
    #[must_use]
    pub fn database(&self, name: &str) -> Option<DatabaseData> {
        self.databases.read().get(name).cloned()
    }

    /// Removes every database.
    pub fn clear(&self) {
        self.databases.write().clear();
    }
}

/// Applies an entry to a database map.
///
/// Shared by the in-memory and file engines so both have the same
/// idempotent semantics.
pub(crate) fn apply_to(databases: &mut BTreeMap<String, DatabaseData>, entry: &OperationEntry) {
    if matches!(entry.payload, OpPayload::DropDatabase) {
        databases.remove(&entry.database);
        return;
    }
    databases
        .entry(entry.database.clone())
        .or_default()
        .apply(&entry.payload);
}

impl StorageEngine for MemoryStorage {
    fn apply(&self, entry: &OperationEntry) -> StorageResult<()> {
        validate_database_name(&entry.database)?;
        apply_to(&mut self.databases.write(), entry);
        Ok(())
    }

    fn insert_many(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> StorageResult<()> {
        validate_database_name(database)?;
        let mut databases = self.databases.write();
        let coll = databases
            .entry(database.to_string())
            .or_default()
            .collection_mut(collection);
        for doc in documents {
            coll.upsert(doc);
        }
        Ok(())
    }

    fn drop_database(&self, database: &str) -> StorageResult<()> {
        self.databases.write().remove(database);
        Ok(())
    }

    fn snapshot(&self, database: &str) -> StorageResult<DatabaseImage> {
        let data = self.databases.read().get(database).cloned().unwrap_or_default();
        Ok(DatabaseImage {
            database: database.to_string(),
            data,
        })
    }

    fn database_names(&self) -> StorageResult<Vec<String>> {
        Ok(self.databases.read().keys().cloned().collect())
    }

    fn count(&self, database: &str, collection: &str) -> StorageResult<u64> {
        Ok(self
            .databases
            .read()
            .get(database)
            .and_then(|db| db.collection(collection))
            .map(|c| c.len() as u64)
            .unwrap_or(0))
    }

    fn get(
        &self,
        database: &str,
        collection: &str,
        id: &DocumentId,
    ) -> StorageResult<Option<Document>> {
        Ok(self
            .databases
            .read()
            .get(database)
            .and_then(|db| db.collection(collection))
            .and_then(|c| c.get(id).cloned()))
    }

    fn find_eq(
        &self,
        database: &str,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> StorageResult<Vec<Document>> {
        Ok(self
            .databases
            .read()
            .get(database)
            .and_then(|db| db.collection(collection))
            .map(|c| c.find_eq(field, value))
            .unwrap_or_default())
    }

    fn database_size(&self, database: &str) -> StorageResult<u64> {
        Ok(self
            .databases
            .read()
            .get(database)
            .map(|db| db.approximate_size())
            .unwrap_or(0))
    }

    fn flush(&self) -> StorageResult<()> {
        // Nothing is buffered
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_protocol::{NewOperation, OpTime, LOCAL_DATABASE};
    use serde_json::json;

    fn insert(db: &str, id: &str, i: i64, t: u32) -> OperationEntry {
        NewOperation::insert(db, "a", Document::with_id(id).set("i", i)).at(OpTime::new(t, 1))
    }

    #[test]
    fn memory_new_is_empty() {
        let storage = MemoryStorage::new();
        assert!(storage.database_names().unwrap().is_empty());
        assert_eq!(storage.total_size().unwrap(), 0);
    }

    #[test]
    fn apply_and_query() {
        let storage = MemoryStorage::new();
        storage.apply(&insert("db", "1", 0, 1)).unwrap();
        storage.apply(&insert("db", "2", 999, 2)).unwrap();

        assert_eq!(storage.count("db", "a").unwrap(), 2);
        assert_eq!(storage.find_eq("db", "a", "i", &json!(999)).unwrap().len(), 1);
        assert!(storage.get("db", "a", &"1".into()).unwrap().is_some());
        assert_eq!(storage.count("db", "missing").unwrap(), 0);
    }

    #[test]
    fn replay_does_not_duplicate() {
        let storage = MemoryStorage::new();
        let entry = insert("db", "1", 0, 1);
        storage.apply(&entry).unwrap();
        storage.apply(&entry).unwrap();
        assert_eq!(storage.count("db", "a").unwrap(), 1);
    }

    #[test]
    fn drop_database_op_removes_database() {
        let storage = MemoryStorage::new();
        storage.apply(&insert("db", "1", 0, 1)).unwrap();
        storage
            .apply(&NewOperation::new("db", OpPayload::DropDatabase).at(OpTime::new(2, 1)))
            .unwrap();
        assert!(storage.database_names().unwrap().is_empty());
    }

    #[test]
    fn snapshot_is_a_copy() {
        let storage = MemoryStorage::new();
        storage.apply(&insert("db", "1", 0, 1)).unwrap();
        let image = storage.snapshot("db").unwrap();
        storage.apply(&insert("db", "2", 1, 2)).unwrap();
        assert_eq!(image.data.document_count(), 1);
        assert_eq!(storage.snapshot("db").unwrap().data.document_count(), 2);
    }

    #[test]
    fn local_documents() {
        let storage = MemoryStorage::new();
        storage
            .write_local("sources", Document::with_id("main").set("host", "m"))
            .unwrap();
        let doc = storage.read_local("sources", &"main".into()).unwrap().unwrap();
        assert_eq!(doc.get("host"), Some(&json!("m")));
        assert!(storage
            .database_names()
            .unwrap()
            .contains(&LOCAL_DATABASE.to_string()));
    }

    #[test]
    fn invalid_name_rejected() {
        let storage = MemoryStorage::new();
        assert!(storage.apply(&insert("bad.name", "1", 0, 1)).is_err());
    }
}
