//! Simulate command implementation.
//!
//! Replays the classic stale-slave scenario in-process: a slave syncs,
//! goes offline while the master writes past its log capacity, comes back
//! to find a gap, and recovers through a manual `resync`.

use replica_master::{MasterConfig, MasterServer, OplogStats};
use replica_protocol::Document;
use replica_slave::{
    CommandReply, ReplResult, RpcTransport, SlaveConfig, SlaveNode, StepOutcome, SyncSource,
};
use replica_storage::{FileStorage, MemoryStorage, StorageEngine};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const DATABASE: &str = "foo";
const COLLECTION: &str = "a";

type Slave = SlaveNode<RpcTransport<Arc<MasterServer>>>;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Master log capacity in kilobytes.
    pub oplog_size_kb: usize,
    /// Writes made while the slave is offline.
    pub writes: u64,
    /// Payload bytes per written document.
    pub doc_bytes: usize,
}

/// One step of the simulation.
#[derive(Debug, Serialize)]
pub struct SimulationStep {
    /// What was done.
    pub action: String,
    /// What came of it.
    pub outcome: String,
}

/// Master log figures after the offline writes.
#[derive(Debug, Serialize)]
pub struct OplogSummary {
    /// Configured capacity in bytes.
    pub capacity_bytes: usize,
    /// Retained entries.
    pub entries: usize,
    /// Entries evicted.
    pub evicted: u64,
    /// Oldest retained op time.
    pub oldest_retained: String,
    /// Newest op time.
    pub latest: String,
}

impl From<OplogStats> for OplogSummary {
    fn from(stats: OplogStats) -> Self {
        Self {
            capacity_bytes: stats.capacity_bytes,
            entries: stats.entries,
            evicted: stats.evicted,
            oldest_retained: stats.tail.oldest_retained.to_string(),
            latest: stats.tail.latest.to_string(),
        }
    }
}

/// Simulation result.
#[derive(Debug, Serialize)]
pub struct SimulationResult {
    /// Slave data directory.
    pub data_dir: String,
    /// Master log after the offline writes.
    pub oplog: OplogSummary,
    /// Steps in order.
    pub steps: Vec<SimulationStep>,
    /// Documents on the master.
    pub master_documents: u64,
    /// Documents on the slave.
    pub slave_documents: u64,
    /// True if both sides hold the same documents.
    pub consistent: bool,
}

/// Runs the simulate command.
pub fn run(
    path: Option<&Path>,
    options: &SimulateOptions,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut temp = None;
    let dir = match path {
        Some(path) => {
            std::fs::create_dir_all(path)?;
            if std::fs::read_dir(path)?.next().is_some() {
                return Err(format!("Simulation directory {:?} must be empty", path).into());
            }
            path.to_path_buf()
        }
        None => temp.insert(TempDir::new()?).path().to_path_buf(),
    };

    tracing::info!(
        dir = %dir.display(),
        oplog_size_kb = options.oplog_size_kb,
        writes = options.writes,
        "starting stale slave simulation"
    );
    let result = simulate(&dir, options)?;
    if !result.consistent {
        tracing::warn!(
            master_documents = result.master_documents,
            slave_documents = result.slave_documents,
            "slave differs from master after simulation"
        );
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => print_text_output(&result),
    }

    Ok(())
}

fn simulate(
    dir: &Path,
    options: &SimulateOptions,
) -> Result<SimulationResult, Box<dyn std::error::Error>> {
    let master = Arc::new(MasterServer::new(
        Arc::new(MemoryStorage::new()),
        MasterConfig::new(options.oplog_size_kb.saturating_mul(1024)),
    ));
    let config =
        SlaveConfig::new(SyncSource::new("localhost", 27017)).with_slave_name("simulated-slave");
    let mut steps = Vec::new();

    master.node().insert(DATABASE, COLLECTION, Document::new().set("x", 1))?;
    let slave = open_slave(dir, &config, &master)?;
    let outcome = slave.sync_until_idle()?;
    steps.push(step("initial sync", describe(&outcome)));
    drop(slave);

    for i in 0..options.writes {
        let doc = Document::new()
            .set("i", i)
            .set("b", "x".repeat(options.doc_bytes));
        master.node().insert(DATABASE, COLLECTION, doc)?;
    }
    let oplog = OplogSummary::from(master.node().oplog_stats());
    steps.push(step(
        format!("{} writes while the slave is offline", options.writes),
        format!("{} log entries evicted", oplog.evicted),
    ));

    let slave = open_slave(dir, &config, &master)?;
    let outcome = slave.poll_once()?;
    steps.push(step("slave restarted", describe(&outcome)));

    let reply = slave.run_command("resync");
    steps.push(step("resync", describe_reply(&reply)));

    let outcome = slave.sync_until_idle()?;
    steps.push(step("sync", describe(&outcome)));

    let reply = slave.run_command("resync");
    steps.push(step("resync again", describe_reply(&reply)));

    let master_documents = master.node().storage().count(DATABASE, COLLECTION)?;
    let slave_documents = slave.storage().count(DATABASE, COLLECTION)?;
    let consistent = master.node().storage().snapshot(DATABASE)?.into_rows()
        == slave.storage().snapshot(DATABASE)?.into_rows();
    slave.shutdown()?;

    Ok(SimulationResult {
        data_dir: dir.display().to_string(),
        oplog,
        steps,
        master_documents,
        slave_documents,
        consistent,
    })
}

fn open_slave(dir: &Path, config: &SlaveConfig, master: &Arc<MasterServer>) -> ReplResult<Slave> {
    let storage: Arc<dyn StorageEngine> = Arc::new(FileStorage::open(dir)?);
    let transport = RpcTransport::new(config.source.clone(), Arc::clone(master));
    SlaveNode::open(config.clone(), transport, storage)
}

fn step(action: impl Into<String>, outcome: impl Into<String>) -> SimulationStep {
    SimulationStep {
        action: action.into(),
        outcome: outcome.into(),
    }
}

fn describe(outcome: &StepOutcome) -> String {
    match outcome {
        StepOutcome::Applied { count, has_more } => {
            format!("applied {} entries (more: {})", count, has_more)
        }
        StepOutcome::CaughtUp => "caught up".to_string(),
        StepOutcome::Gap(gap) => format!(
            "gap: needed {} but the oldest retained entry is {}",
            gap.requested, gap.oldest_retained
        ),
        StepOutcome::Paused => "paused".to_string(),
    }
}

fn describe_reply(reply: &CommandReply) -> String {
    if reply.ok {
        "{ ok: 1 }".to_string()
    } else {
        format!(
            "{{ ok: 0, errmsg: {:?} }}",
            reply.errmsg.as_deref().unwrap_or_default()
        )
    }
}

fn print_text_output(result: &SimulationResult) {
    println!("Stale Slave Simulation");
    println!("======================");
    println!();
    println!("Slave data: {}", result.data_dir);
    println!();
    println!("Master log:");
    println!("  Capacity:        {} bytes", result.oplog.capacity_bytes);
    println!("  Retained:        {} entries", result.oplog.entries);
    println!("  Evicted:         {} entries", result.oplog.evicted);
    println!("  Oldest retained: {}", result.oplog.oldest_retained);
    println!("  Latest:          {}", result.oplog.latest);
    println!();
    println!("Steps:");
    for (n, step) in result.steps.iter().enumerate() {
        println!("  {}. {:<40} {}", n + 1, step.action, step.outcome);
    }
    println!();
    println!("Documents: master {}, slave {}", result.master_documents, result.slave_documents);
    if result.consistent {
        println!("✓ Slave matches master");
    } else {
        println!("✗ Slave differs from master");
    }
}
