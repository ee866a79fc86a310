//! List-databases command implementation.

use super::{format_size, require_data_dir};
use replica_slave::AdminCommands;
use replica_storage::{FileStorage, StorageEngine};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// One listed database.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseEntry {
    /// Database name.
    pub name: String,
    /// Approximate size in bytes.
    pub size_on_disk: u64,
    /// True if the database holds no documents.
    pub empty: bool,
}

/// List-databases result.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult {
    /// Databases in name order.
    pub databases: Vec<DatabaseEntry>,
    /// Sum of all database sizes.
    pub total_size: u64,
}

/// Runs the list-databases command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    require_data_dir(path)?;
    let storage: Arc<dyn StorageEngine> = Arc::new(FileStorage::open(path)?);
    let reply = AdminCommands::standalone(storage).list_databases()?;
    if !reply.ok {
        return Err(reply
            .errmsg
            .unwrap_or_else(|| "listDatabases failed".to_string())
            .into());
    }
    let result: ListResult = serde_json::from_value(serde_json::Value::Object(reply.body))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            println!("Databases at {:?}", path);
            println!();
            for db in &result.databases {
                println!(
                    "  {:<24} {:>12}{}",
                    db.name,
                    format_size(db.size_on_disk),
                    if db.empty { "  (empty)" } else { "" }
                );
            }
            println!();
            println!("Total size: {}", format_size(result.total_size));
        }
    }

    Ok(())
}
