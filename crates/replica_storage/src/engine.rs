//! Storage engine trait definition.

use crate::data::DatabaseData;
use crate::error::{StorageError, StorageResult};
use replica_protocol::{Document, DocumentId, OperationEntry, LOCAL_DATABASE};
use serde_json::Value;

/// A point-in-time copy of one database.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseImage {
    /// Database name.
    pub database: String,
    /// Documents at the time of the copy.
    pub data: DatabaseData,
}

impl DatabaseImage {
    /// Flattens the image into `(collection, document)` rows in
    /// collection then id order.
    pub fn into_rows(self) -> Vec<(String, Document)> {
        self.data
            .collections()
            .flat_map(|(name, coll)| coll.documents().map(move |doc| (name.clone(), doc.clone())))
            .collect()
    }
}

/// The storage engine consumed by replication.
///
/// Engines are **opaque** to the replication core: it never sees files,
/// indexes, or layouts, only the operations below.
///
/// # Invariants
///
/// - `apply` is idempotent: re-applying an already-applied entry leaves the
///   final state unchanged (last writer wins per document id)
/// - `snapshot` returns a self-consistent point-in-time copy
/// - `drop_database` removes every document of the database
/// - after `flush` returns, all prior writes survive a restart (for
///   persistent engines)
/// - Engines must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::MemoryStorage`] - For testing
/// - [`super::FileStorage`] - For persistent storage
pub trait StorageEngine: Send + Sync {
    /// Applies a replicated operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot durably record the write or
    /// the database name is invalid.
    fn apply(&self, entry: &OperationEntry) -> StorageResult<()>;

    /// Loads documents into a collection, replacing same-id documents.
    ///
    /// Used to copy snapshot contents during a resync.
    fn insert_many(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> StorageResult<()>;

    /// Drops a database and all of its contents. Missing databases are a no-op.
    fn drop_database(&self, database: &str) -> StorageResult<()>;

    /// Takes a point-in-time copy of a database.
    ///
    /// A missing database yields an empty image.
    fn snapshot(&self, database: &str) -> StorageResult<DatabaseImage>;

    /// Returns the names of all databases, in name order.
    fn database_names(&self) -> StorageResult<Vec<String>>;

    /// Returns the number of documents in a collection.
    fn count(&self, database: &str, collection: &str) -> StorageResult<u64>;

    /// Returns a document by id.
    fn get(&self, database: &str, collection: &str, id: &DocumentId)
        -> StorageResult<Option<Document>>;

    /// Returns the documents of a collection whose `field` equals `value`.
    fn find_eq(
        &self,
        database: &str,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> StorageResult<Vec<Document>>;

    /// Returns the approximate size of a database in bytes.
    fn database_size(&self, database: &str) -> StorageResult<u64>;

    /// Returns the approximate size of all databases in bytes.
    fn total_size(&self) -> StorageResult<u64> {
        let mut total = 0;
        for name in self.database_names()? {
            total += self.database_size(&name)?;
        }
        Ok(total)
    }

    /// Makes all prior writes durable.
    fn flush(&self) -> StorageResult<()>;

    /// Writes a document into the node-local, never-replicated database.
    fn write_local(&self, collection: &str, document: Document) -> StorageResult<()> {
        self.insert_many(LOCAL_DATABASE, collection, vec![document])
    }

    /// Reads a document from the node-local database.
    fn read_local(&self, collection: &str, id: &DocumentId) -> StorageResult<Option<Document>> {
        self.get(LOCAL_DATABASE, collection, id)
    }
}

/// Checks that a database name can be used as a storage unit.
///
/// Names are non-empty, at most 64 bytes, and use only ASCII letters,
/// digits, `_` and `-`.
pub(crate) fn validate_database_name(name: &str) -> StorageResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_names() {
        assert!(validate_database_name("jstests_repl2test").is_ok());
        assert!(validate_database_name("a-b").is_ok());
        assert!(validate_database_name("").is_err());
        assert!(validate_database_name("a.b").is_err());
        assert!(validate_database_name("../etc").is_err());
        assert!(validate_database_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn image_rows_are_flattened() {
        let mut data = DatabaseData::new();
        data.collection_mut("b").upsert(Document::with_id("2"));
        data.collection_mut("a").upsert(Document::with_id("1"));
        let rows = DatabaseImage {
            database: "db".into(),
            data,
        }
        .into_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "a");
        assert_eq!(rows[1].0, "b");
    }
}
