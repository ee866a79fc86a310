//! The master node write path.

use crate::config::MasterConfig;
use crate::error::{MasterError, MasterResult};
use crate::oplog::OperationLog;
use crate::snapshot::{SnapshotHandle, SnapshotProvider, SnapshotSessions};
use parking_lot::Mutex;
use replica_protocol::{
    Document, DocumentId, LogCursor, LogRead, NewOperation, OpPayload, OpTime, OperationEntry,
    SnapshotBatch, TailInfo, LOCAL_DATABASE,
};
use replica_storage::StorageEngine;
use std::sync::Arc;

/// Log statistics of a master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OplogStats {
    /// Retained entries.
    pub entries: usize,
    /// Encoded bytes of retained entries.
    pub used_bytes: usize,
    /// Configured capacity in bytes.
    pub capacity_bytes: usize,
    /// Entries evicted since startup.
    pub evicted: u64,
    /// Current retention window.
    pub tail: TailInfo,
}

/// A master: local storage plus the operation log that describes it.
///
/// Every replicated write is applied to storage and appended to the log
/// under one lock, and snapshots are captured under the same lock, so a
/// snapshot's `as_of` time is exactly the newest operation it contains.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use replica_master::{MasterConfig, MasterNode};
/// use replica_protocol::{Document, LogCursor};
/// use replica_storage::MemoryStorage;
///
/// let master = MasterNode::new(Arc::new(MemoryStorage::new()), MasterConfig::default());
/// master.insert("app", "users", Document::with_id("u1")).unwrap();
/// assert!(!master.read_from(LogCursor::start(), 10).is_gap());
/// ```
pub struct MasterNode {
    config: MasterConfig,
    storage: Arc<dyn StorageEngine>,
    log: Mutex<OperationLog>,
    sessions: Mutex<SnapshotSessions>,
}

impl MasterNode {
    /// Creates a master over `storage`.
    pub fn new(storage: Arc<dyn StorageEngine>, config: MasterConfig) -> Self {
        let log = OperationLog::new(config.oplog_capacity_bytes);
        let sessions = SnapshotSessions::new(config.max_open_snapshots);
        Self {
            config,
            storage,
            log: Mutex::new(log),
            sessions: Mutex::new(sessions),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Returns the storage engine.
    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    /// Applies a write and logs it.
    ///
    /// Writes to the `local` database are applied but never logged; they
    /// return the current latest op time.
    pub fn write(&self, op: NewOperation) -> MasterResult<OpTime> {
        let mut log = self.log.lock();

        if op.database == LOCAL_DATABASE {
            let entry = op.at(log.latest());
            self.storage.apply(&entry)?;
            return Ok(entry.op_time);
        }

        let storage = &self.storage;
        let op_time = log.append_with(op, |entry: &OperationEntry| {
            storage.apply(entry).map_err(MasterError::from)
        })?;
        tracing::trace!(op_time = %op_time, "logged write");
        Ok(op_time)
    }

    /// Inserts a document.
    pub fn insert(&self, database: &str, collection: &str, document: Document) -> MasterResult<OpTime> {
        self.write(NewOperation::insert(database, collection, document))
    }

    /// Replaces a document, inserting it if missing.
    pub fn update(&self, database: &str, collection: &str, document: Document) -> MasterResult<OpTime> {
        self.write(NewOperation::update(database, collection, document))
    }

    /// Removes a document.
    pub fn remove(&self, database: &str, collection: &str, id: DocumentId) -> MasterResult<OpTime> {
        self.write(NewOperation::delete(database, collection, id))
    }

    /// Drops a collection.
    pub fn drop_collection(&self, database: &str, collection: &str) -> MasterResult<OpTime> {
        self.write(NewOperation::new(
            database,
            OpPayload::DropCollection {
                collection: collection.to_string(),
            },
        ))
    }

    /// Drops a database.
    pub fn drop_database(&self, database: &str) -> MasterResult<OpTime> {
        self.write(NewOperation::new(database, OpPayload::DropDatabase))
    }

    /// Reads at most `limit` entries after `cursor`, or reports a gap.
    pub fn read_from(&self, cursor: LogCursor, limit: usize) -> LogRead {
        self.log.lock().read_from_limited(cursor, limit)
    }

    /// Returns the log retention window.
    pub fn tail_info(&self) -> TailInfo {
        self.log.lock().tail_info()
    }

    /// Returns log statistics.
    pub fn oplog_stats(&self) -> OplogStats {
        let log = self.log.lock();
        OplogStats {
            entries: log.len(),
            used_bytes: log.used_bytes(),
            capacity_bytes: log.capacity(),
            evicted: log.evicted_count(),
            tail: log.tail_info(),
        }
    }

    /// Returns the replicated databases, excluding `local`.
    pub fn database_names(&self) -> MasterResult<Vec<String>> {
        Ok(self
            .storage
            .database_names()?
            .into_iter()
            .filter(|name| name != LOCAL_DATABASE)
            .collect())
    }

    /// Returns the number of snapshots currently open.
    pub fn open_snapshots(&self) -> usize {
        self.sessions.lock().open_count()
    }
}

impl SnapshotProvider for MasterNode {
    fn open_snapshot(&self, database: &str) -> MasterResult<SnapshotHandle> {
        if database == LOCAL_DATABASE {
            return Err(MasterError::InvalidRequest(
                "the local database is not replicated".into(),
            ));
        }

        let (image, as_of) = {
            let log = self.log.lock();
            (self.storage.snapshot(database)?, log.latest())
        };

        let handle = self.sessions.lock().open(image, as_of)?;
        tracing::debug!(
            database,
            snapshot_id = handle.id,
            as_of = %handle.as_of,
            documents = handle.document_count,
            "opened snapshot"
        );
        Ok(handle)
    }

    fn next_batch(&self, snapshot_id: u64, max: usize) -> MasterResult<SnapshotBatch> {
        self.sessions.lock().next_batch(snapshot_id, max)
    }
}
