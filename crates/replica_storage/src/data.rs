//! In-memory representation of a database's documents.

use replica_protocol::{to_cbor, Document, DocumentId, OpPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Documents of one collection, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionData {
    documents: BTreeMap<DocumentId, Document>,
}

impl CollectionData {
    /// Inserts or replaces a document.
    pub fn upsert(&mut self, document: Document) {
        self.documents.insert(document.id.clone(), document);
    }

    /// Removes a document, returning it if present.
    pub fn remove(&mut self, id: &DocumentId) -> Option<Document> {
        self.documents.remove(id)
    }

    /// Returns a document by id.
    pub fn get(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.get(id)
    }

    /// Returns the number of documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if the collection holds no documents.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Iterates documents in id order.
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    /// Returns documents whose `field` equals `value`.
    pub fn find_eq(&self, field: &str, value: &Value) -> Vec<Document> {
        self.documents
            .values()
            .filter(|doc| doc.get(field) == Some(value))
            .cloned()
            .collect()
    }
}

/// All collections of one database.
///
/// Applying a payload is idempotent: inserts and updates are upserts keyed
/// by document id (last writer wins), and deletes or drops of missing
/// targets are no-ops. Re-applying an entry therefore never changes the
/// final state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseData {
    collections: BTreeMap<String, CollectionData>,
}

impl DatabaseData {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a replicated write.
    ///
    /// `DropDatabase` clears every collection; the caller decides whether
    /// the emptied database itself should disappear.
    pub fn apply(&mut self, payload: &OpPayload) {
        match payload {
            OpPayload::Insert {
                collection,
                document,
            }
            | OpPayload::Update {
                collection,
                document,
            } => {
                self.collection_mut(collection).upsert(document.clone());
            }
            OpPayload::Delete { collection, id } => {
                if let Some(coll) = self.collections.get_mut(collection) {
                    coll.remove(id);
                }
            }
            OpPayload::DropCollection { collection } => {
                self.collections.remove(collection);
            }
            OpPayload::DropDatabase => {
                self.collections.clear();
            }
        }
    }

    /// Returns a collection, creating it if missing.
    pub fn collection_mut(&mut self, name: &str) -> &mut CollectionData {
        self.collections.entry(name.to_string()).or_default()
    }

    /// Returns a collection.
    pub fn collection(&self, name: &str) -> Option<&CollectionData> {
        self.collections.get(name)
    }

    /// Iterates `(name, collection)` pairs in name order.
    pub fn collections(&self) -> impl Iterator<Item = (&String, &CollectionData)> {
        self.collections.iter()
    }

    /// Returns the total number of documents.
    pub fn document_count(&self) -> u64 {
        self.collections.values().map(|c| c.len() as u64).sum()
    }

    /// Returns true if no collection exists.
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Returns the approximate encoded size in bytes.
    pub fn approximate_size(&self) -> u64 {
        self.collections
            .values()
            .flat_map(|c| c.documents())
            .map(|doc| to_cbor(doc).map(|b| b.len() as u64).unwrap_or(0))
            .sum()
    }
}
