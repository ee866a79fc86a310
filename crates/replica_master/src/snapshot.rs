//! Point-in-time database snapshots served to resyncing slaves.

use crate::error::{MasterError, MasterResult};
use replica_protocol::{Document, OpTime, SnapshotBatch, SnapshotEnd, SnapshotRow};
use replica_storage::DatabaseImage;
use std::collections::{HashMap, VecDeque};

/// An open snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    /// Session id used to fetch batches.
    pub id: u64,
    /// Snapshotted database.
    pub database: String,
    /// Op time as of which the snapshot is consistent.
    pub as_of: OpTime,
    /// Number of documents in the snapshot.
    pub document_count: u64,
}

/// Source of consistent database snapshots.
///
/// Used only during a full resync: the slave opens a snapshot, drains it
/// batch by batch, and resumes tailing from the reported `as_of` time.
pub trait SnapshotProvider: Send + Sync {
    /// Opens a point-in-time snapshot of `database`.
    ///
    /// The snapshot contains exactly the effects of every logged operation
    /// with op time `<= as_of`.
    fn open_snapshot(&self, database: &str) -> MasterResult<SnapshotHandle>;

    /// Returns up to `max` further documents of an open snapshot.
    ///
    /// The last batch carries the terminal [`SnapshotEnd`] and closes the
    /// snapshot.
    fn next_batch(&self, snapshot_id: u64, max: usize) -> MasterResult<SnapshotBatch>;
}

#[derive(Debug)]
struct Session {
    as_of: OpTime,
    rows: VecDeque<(String, Document)>,
    total: u64,
    last_access: u64,
}

/// Registry of open snapshot sessions.
///
/// A slave that gives up on a snapshot never closes it, so when the
/// registry is full the least recently used session is evicted to make
/// room. A slave still draining an evicted session gets `UnknownSnapshot`
/// and reopens.
#[derive(Debug)]
pub(crate) struct SnapshotSessions {
    next_id: u64,
    clock: u64,
    open: HashMap<u64, Session>,
    limit: usize,
}

impl SnapshotSessions {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            next_id: 1,
            clock: 0,
            open: HashMap::new(),
            limit,
        }
    }

    /// Registers a new session over a captured image.
    pub(crate) fn open(
        &mut self,
        image: DatabaseImage,
        as_of: OpTime,
    ) -> MasterResult<SnapshotHandle> {
        if self.limit == 0 {
            return Err(MasterError::TooManySnapshots(self.limit));
        }
        while self.open.len() >= self.limit {
            self.evict_least_recent();
        }
        let id = self.next_id;
        self.next_id += 1;

        let database = image.database.clone();
        let rows: VecDeque<(String, Document)> = image.into_rows().into();
        let total = rows.len() as u64;
        let last_access = self.tick();
        self.open.insert(
            id,
            Session {
                as_of,
                rows,
                total,
                last_access,
            },
        );

        Ok(SnapshotHandle {
            id,
            database,
            as_of,
            document_count: total,
        })
    }

    /// Drains the next batch; the final batch removes the session.
    pub(crate) fn next_batch(&mut self, id: u64, max: usize) -> MasterResult<SnapshotBatch> {
        let now = self.tick();
        let session = self
            .open
            .get_mut(&id)
            .ok_or(MasterError::UnknownSnapshot(id))?;
        session.last_access = now;

        let take = max.max(1).min(session.rows.len());
        let documents: Vec<SnapshotRow> = session
            .rows
            .drain(..take)
            .map(|(collection, document)| SnapshotRow {
                collection,
                document,
            })
            .collect();

        let end = if session.rows.is_empty() {
            let end = SnapshotEnd {
                as_of: session.as_of,
                document_count: session.total,
            };
            self.open.remove(&id);
            Some(end)
        } else {
            None
        };

        Ok(SnapshotBatch {
            snapshot_id: id,
            documents,
            end,
        })
    }

    pub(crate) fn open_count(&self) -> usize {
        self.open.len()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .open
            .iter()
            .min_by_key(|(_, session)| session.last_access)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            if let Some(session) = self.open.remove(&id) {
                tracing::warn!(
                    snapshot_id = id,
                    as_of = %session.as_of,
                    remaining = session.rows.len(),
                    "evicted idle snapshot session"
                );
            }
        }
    }
}
