//! Replicated documents.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Identifier of a document within a collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A document: an identifier plus a JSON object of fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document identifier (unique within its collection).
    pub id: DocumentId,
    /// Field values.
    pub fields: Map<String, Value>,
}

impl Document {
    /// Creates an empty document with a generated identifier.
    pub fn new() -> Self {
        Self::with_id(DocumentId::generate())
    }

    /// Creates an empty document with the given identifier.
    pub fn with_id(id: impl Into<DocumentId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Creates a document from a JSON object body.
    pub fn from_json(id: impl Into<DocumentId>, body: Value) -> ProtocolResult<Self> {
        match body {
            Value::Object(fields) => Ok(Self {
                id: id.into(),
                fields,
            }),
            other => Err(ProtocolError::InvalidDocument(format!(
                "expected object body, got {other}"
            ))),
        }
    }

    /// Sets a field, returning the document.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns a field value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns the document as a JSON object, `_id` included.
    pub fn to_json(&self) -> Value {
        let mut fields = self.fields.clone();
        fields.insert("_id".into(), Value::String(self.id.to_string()));
        Value::Object(fields)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}
