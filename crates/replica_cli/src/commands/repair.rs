//! Repair command implementation.

use super::{format_size, require_data_dir};
use replica_storage::FileStorage;
use std::path::Path;

/// Runs the repair command.
pub fn run(path: &Path, database: &str, backup: bool) -> Result<(), Box<dyn std::error::Error>> {
    require_data_dir(path)?;
    let storage = FileStorage::open(path)?;

    println!("Repairing database '{}' at {:?}", database, path);
    if backup {
        println!("(original files will be kept)");
    }
    println!();

    let report = storage.repair_database(database, backup)?;
    tracing::info!(
        database,
        documents = report.documents,
        size_before = report.size_before,
        size_after = report.size_after,
        "repaired database"
    );

    println!("Repair Summary:");
    println!("  Documents:   {}", report.documents);
    println!("  Size before: {}", format_size(report.size_before));
    println!("  Size after:  {}", format_size(report.size_after));
    if let Some(dir) = &report.backup {
        println!("  Backup:      {}", dir.display());
    }
    println!();
    println!("✓ Repair complete");

    Ok(())
}
