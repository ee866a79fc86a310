//! Replication state of a slave and its single mutation path.
//!
//! [`ReplicationState`] is a plain value. The live copy is owned by a
//! [`ReplStateHandle`]: readers take snapshots, and only the applier and
//! the resync controller call its mutators. Every transition and every
//! applied batch is persisted into the `local.sources` collection so a
//! restarted slave resumes tailing instead of resyncing again.

use crate::config::SyncSource;
use crate::error::ReplResult;
use parking_lot::RwLock;
use replica_protocol::{Document, DocumentId, OpTime};
use replica_storage::{StorageEngine, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Collection of the `local` database holding persisted replication state.
pub const SOURCES_COLLECTION: &str = "sources";

/// Replication mode of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplMode {
    /// Steady state: tailing the master's log.
    Tailing,
    /// A full resync is pending or running.
    Resyncing,
    /// Replication halted until an operator intervenes.
    Fault,
}

impl ReplMode {
    /// Returns the mode name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplMode::Tailing => "TAILING",
            ReplMode::Resyncing => "RESYNCING",
            ReplMode::Fault => "FAULT",
        }
    }
}

impl fmt::Display for ReplMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected gap between the slave's position and the master's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapInfo {
    /// Position the slave tried to resume from.
    pub requested: OpTime,
    /// Oldest position the master still retains.
    pub oldest_retained: OpTime,
}

/// Replication state of one slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationState {
    /// Current mode.
    pub mode: ReplMode,
    /// Master being replicated from.
    pub sync_source: SyncSource,
    /// Op time of the last applied entry.
    pub last_applied: OpTime,
    /// Databases replicated from the source.
    pub syncing_databases: BTreeSet<String>,
    /// Databases whose local copy is being rebuilt and must not be trusted.
    pub invalid_databases: BTreeSet<String>,
    /// Per-database snapshot times above `last_applied`. Log entries at or
    /// below a database's watermark are already contained in its copy.
    pub db_watermarks: BTreeMap<String, OpTime>,
    /// Gap that halted tailing, if any.
    pub gap: Option<GapInfo>,
    /// Reason for FAULT, if any.
    pub fault: Option<String>,
    /// Whether an initial copy has completed.
    pub initialized: bool,
}

impl ReplicationState {
    /// Creates the state of a slave that has never synced.
    pub fn new(sync_source: SyncSource) -> Self {
        Self {
            mode: ReplMode::Tailing,
            sync_source,
            last_applied: OpTime::ZERO,
            syncing_databases: BTreeSet::new(),
            invalid_databases: BTreeSet::new(),
            db_watermarks: BTreeMap::new(),
            gap: None,
            fault: None,
            initialized: false,
        }
    }

    /// Returns true if the slave is tailing without a recorded gap.
    pub fn is_tailing(&self) -> bool {
        self.mode == ReplMode::Tailing && self.gap.is_none() && self.initialized
    }
}

/// On-disk form of the state, stored as one document per source.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    source: String,
    synced_to: OpTime,
    mode: ReplMode,
    databases: Vec<String>,
    #[serde(default)]
    invalid: Vec<String>,
    #[serde(default)]
    watermarks: BTreeMap<String, OpTime>,
    #[serde(default)]
    gap: Option<GapInfo>,
    #[serde(default)]
    fault: Option<String>,
    initialized: bool,
}

impl PersistedState {
    fn from_state(state: &ReplicationState) -> Self {
        Self {
            source: state.sync_source.to_string(),
            synced_to: state.last_applied,
            mode: state.mode,
            databases: state.syncing_databases.iter().cloned().collect(),
            invalid: state.invalid_databases.iter().cloned().collect(),
            watermarks: state.db_watermarks.clone(),
            gap: state.gap,
            fault: state.fault.clone(),
            initialized: state.initialized,
        }
    }

    fn into_state(self, sync_source: SyncSource) -> ReplicationState {
        ReplicationState {
            mode: self.mode,
            sync_source,
            last_applied: self.synced_to,
            syncing_databases: self.databases.into_iter().collect(),
            invalid_databases: self.invalid.into_iter().collect(),
            db_watermarks: self.watermarks,
            gap: self.gap,
            fault: self.fault,
            initialized: self.initialized,
        }
    }
}

/// Reads every persisted source document from `storage`.
///
/// Used by tooling that inspects a stopped slave.
pub fn load_persisted_states(storage: &dyn StorageEngine) -> ReplResult<Vec<ReplicationState>> {
    let image = storage.snapshot(replica_protocol::LOCAL_DATABASE)?;
    let mut states = Vec::new();
    if let Some(sources) = image.data.collection(SOURCES_COLLECTION) {
        for doc in sources.documents() {
            let persisted: PersistedState = serde_json::from_value(serde_json::Value::Object(
                doc.fields.clone(),
            ))
            .map_err(|e| StorageError::Corrupted(format!("local.sources/{}: {e}", doc.id)))?;
            let source = persisted
                .source
                .parse::<SyncSource>()
                .map_err(StorageError::Corrupted)?;
            states.push(persisted.into_state(source));
        }
    }
    Ok(states)
}

/// Shared handle to the live replication state.
pub struct ReplStateHandle {
    state: RwLock<ReplicationState>,
    storage: Arc<dyn StorageEngine>,
}

impl ReplStateHandle {
    /// Loads the persisted state for `source`, or starts fresh.
    pub fn open(storage: Arc<dyn StorageEngine>, source: SyncSource) -> ReplResult<Self> {
        let id = DocumentId::from(source.to_string());
        let state = match storage.read_local(SOURCES_COLLECTION, &id)? {
            Some(doc) => {
                let persisted: PersistedState =
                    serde_json::from_value(serde_json::Value::Object(doc.fields)).map_err(
                        |e| StorageError::Corrupted(format!("local.sources/{id}: {e}")),
                    )?;
                let state = persisted.into_state(source);
                tracing::info!(
                    source = %state.sync_source,
                    mode = %state.mode,
                    synced_to = %state.last_applied,
                    "loaded replication state"
                );
                state
            }
            None => ReplicationState::new(source),
        };

        Ok(Self {
            state: RwLock::new(state),
            storage,
        })
    }

    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> ReplicationState {
        self.state.read().clone()
    }

    /// Returns the current mode.
    pub fn mode(&self) -> ReplMode {
        self.state.read().mode
    }

    /// Returns the op time of the last applied entry.
    pub fn last_applied(&self) -> OpTime {
        self.state.read().last_applied
    }

    /// Returns the recorded gap, if any.
    pub fn gap(&self) -> Option<GapInfo> {
        self.state.read().gap
    }

    /// Returns true if an initial copy has completed.
    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    /// Returns the watermark of a database, if one is set.
    pub fn watermark(&self, database: &str) -> Option<OpTime> {
        self.state.read().db_watermarks.get(database).copied()
    }

    /// Returns true if `database` is being rebuilt.
    pub fn is_invalid(&self, database: &str) -> bool {
        self.state.read().invalid_databases.contains(database)
    }

    fn persist(&self, state: &ReplicationState) -> ReplResult<()> {
        let persisted = PersistedState::from_state(state);
        let body = serde_json::to_value(&persisted)
            .map_err(|e| StorageError::Corrupted(format!("cannot encode state: {e}")))?;
        let doc = Document::from_json(state.sync_source.to_string(), body)?;
        self.storage.write_local(SOURCES_COLLECTION, doc)?;
        self.storage.flush()?;
        Ok(())
    }

    fn mutate<F>(&self, f: F) -> ReplResult<()>
    where
        F: FnOnce(&mut ReplicationState),
    {
        let mut state = self.state.write();
        f(&mut state);
        self.persist(&state)
    }

    // Mutators below are the single mutation path used by the applier and
    // the resync controller.

    /// Advances `last_applied` in memory. Persisted by [`Self::checkpoint`].
    pub(crate) fn advance_to(&self, op_time: OpTime) {
        let mut state = self.state.write();
        if op_time > state.last_applied {
            state.last_applied = op_time;
        }
    }

    /// Persists the applied position after a batch, dropping watermarks
    /// the cursor has passed.
    pub(crate) fn checkpoint(&self) -> ReplResult<()> {
        // Data first so the persisted position never leads the data.
        self.storage.flush()?;
        self.mutate(|state| {
            let last = state.last_applied;
            state.db_watermarks.retain(|_, t| *t > last);
        })
    }

    /// Records a gap reported by the log.
    pub(crate) fn record_gap(&self, gap: GapInfo) -> ReplResult<()> {
        self.mutate(|state| state.gap = Some(gap))
    }

    /// Enters RESYNCING.
    pub(crate) fn begin_resync(&self) -> ReplResult<()> {
        self.mutate(|state| {
            state.mode = ReplMode::Resyncing;
            state.fault = None;
        })
    }

    /// Marks a database as being rebuilt.
    pub(crate) fn mark_invalid(&self, database: &str) -> ReplResult<()> {
        self.mutate(|state| {
            state.invalid_databases.insert(database.to_string());
            state.syncing_databases.insert(database.to_string());
        })
    }

    /// Forgets a database the source no longer has.
    pub(crate) fn forget_database(&self, database: &str) -> ReplResult<()> {
        self.mutate(|state| {
            state.invalid_databases.remove(database);
            state.syncing_databases.remove(database);
            state.db_watermarks.remove(database);
        })
    }

    /// Completes a resync: resumes tailing from `resume_from`, with
    /// per-database watermarks for databases copied at later times.
    pub(crate) fn complete_resync(
        &self,
        resume_from: OpTime,
        copied: &BTreeMap<String, OpTime>,
    ) -> ReplResult<()> {
        self.mutate(|state| {
            state.mode = ReplMode::Tailing;
            state.last_applied = resume_from;
            state.syncing_databases = copied.keys().cloned().collect();
            state.invalid_databases.clear();
            state.db_watermarks = copied
                .iter()
                .filter(|(_, t)| **t > resume_from)
                .map(|(db, t)| (db.clone(), *t))
                .collect();
            state.gap = None;
            state.fault = None;
            state.initialized = true;
        })
    }

    /// Enters FAULT.
    pub(crate) fn fail(&self, reason: impl Into<String>) -> ReplResult<()> {
        let reason = reason.into();
        tracing::error!(reason = %reason, "replication fault");
        self.mutate(|state| {
            state.mode = ReplMode::Fault;
            state.fault = Some(reason);
        })
    }
}

impl fmt::Debug for ReplStateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplStateHandle")
            .field("state", &*self.state.read())
            .finish()
    }
}
