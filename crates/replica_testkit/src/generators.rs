//! Property-based test generators using proptest.
//!
//! Operations draw document ids from a small pool so that updates and
//! deletes hit existing documents often.

use proptest::prelude::*;
use replica_protocol::{Document, DocumentId, NewOperation, OpPayload};

/// Databases used by generated operations.
pub const DATABASES: &[&str] = &["app", "audit"];

/// Collections used by generated operations.
pub const COLLECTIONS: &[&str] = &["users", "orders"];

/// Strategy for database names from [`DATABASES`].
pub fn database_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(DATABASES).prop_map(str::to_string)
}

/// Strategy for collection names from [`COLLECTIONS`].
pub fn collection_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(COLLECTIONS).prop_map(str::to_string)
}

/// Strategy for document ids from a pool of eight.
pub fn document_id_strategy() -> impl Strategy<Value = DocumentId> {
    (0u8..8).prop_map(|n| DocumentId::from(format!("doc-{n}")))
}

/// Strategy for documents with a few scalar fields.
pub fn document_strategy() -> impl Strategy<Value = Document> {
    (
        document_id_strategy(),
        any::<i32>(),
        prop::string::string_regex("[a-z]{0,16}").expect("Invalid regex"),
    )
        .prop_map(|(id, n, s)| Document::with_id(id).set("n", n).set("s", s))
}

/// Strategy for a single write operation.
pub fn operation_strategy() -> impl Strategy<Value = NewOperation> {
    (database_strategy(), collection_strategy()).prop_flat_map(|(db, coll)| {
        prop_oneof![
            4 => document_strategy().prop_map({
                let (db, coll) = (db.clone(), coll.clone());
                move |doc| NewOperation::insert(db.clone(), coll.clone(), doc)
            }),
            3 => document_strategy().prop_map({
                let (db, coll) = (db.clone(), coll.clone());
                move |doc| NewOperation::update(db.clone(), coll.clone(), doc)
            }),
            2 => document_id_strategy().prop_map({
                let (db, coll) = (db.clone(), coll.clone());
                move |id| NewOperation::delete(db.clone(), coll.clone(), id)
            }),
            1 => Just(NewOperation::new(
                db.clone(),
                OpPayload::DropCollection { collection: coll.clone() },
            )),
        ]
    })
}

/// Strategy for a sequence of up to `max_len` write operations.
pub fn operation_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<NewOperation>> {
    prop::collection::vec(operation_strategy(), 0..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn operations_target_known_namespaces(op in operation_strategy()) {
            prop_assert!(DATABASES.contains(&op.database.as_str()));
            let collection = op.payload.collection().unwrap_or_default();
            prop_assert!(COLLECTIONS.contains(&collection));
        }

        #[test]
        fn sequences_respect_max_len(ops in operation_sequence_strategy(10)) {
            prop_assert!(ops.len() <= 10);
        }
    }
}
