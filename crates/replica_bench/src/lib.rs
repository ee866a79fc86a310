//! Benchmark utilities.

use replica_protocol::{Document, NewOperation};

/// Creates a document with an `i` field and `payload_size` bytes of filler.
pub fn payload_document(i: u64, payload_size: usize) -> Document {
    Document::new()
        .set("i", i)
        .set("b", "x".repeat(payload_size))
}

/// Generates `count` inserts into `bench.docs`.
pub fn generate_inserts(count: usize, payload_size: usize) -> Vec<NewOperation> {
    (0..count as u64)
        .map(|i| NewOperation::insert("bench", "docs", payload_document(i, payload_size)))
        .collect()
}
