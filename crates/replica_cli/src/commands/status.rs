//! Status command implementation.

use super::require_data_dir;
use replica_slave::{load_persisted_states, ReplicationState};
use replica_storage::FileStorage;
use std::path::Path;

/// Runs the status command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    require_data_dir(path)?;
    let storage = FileStorage::open(path)?;
    let states = load_persisted_states(&storage)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&states)?);
        }
        _ => print_text_output(path, &states),
    }

    Ok(())
}

fn print_text_output(path: &Path, states: &[ReplicationState]) {
    println!("Replication Status");
    println!("==================");
    println!();
    println!("Path: {}", path.display());

    if states.is_empty() {
        println!();
        println!("No sync sources recorded (not a slave)");
        return;
    }

    for state in states {
        println!();
        println!("Source: {}", state.sync_source);
        println!("  Mode:         {}", state.mode);
        println!("  Initialized:  {}", state.initialized);
        println!("  Last applied: {}", state.last_applied);
        println!("  Databases:    {}", join(state.syncing_databases.iter()));
        if !state.invalid_databases.is_empty() {
            println!("  Invalid:      {}", join(state.invalid_databases.iter()));
        }
        if let Some(gap) = &state.gap {
            println!(
                "  Gap:          requested {} but oldest retained is {}",
                gap.requested, gap.oldest_retained
            );
        }
        if let Some(fault) = &state.fault {
            println!("  Fault:        {}", fault);
        }
    }
}

fn join<'a>(names: impl Iterator<Item = &'a String>) -> String {
    let names: Vec<&str> = names.map(String::as_str).collect();
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}
