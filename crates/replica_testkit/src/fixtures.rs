//! Master/slave fixtures.
//!
//! [`ReplicaPair`] wires a [`MasterServer`] and a [`SlaveNode`] together
//! through an in-process [`LoopbackClient`], so whole replication
//! scenarios run deterministically inside one test.

use crate::clients::LoopbackClient;
use replica_master::{MasterConfig, MasterNode, MasterServer};
use replica_protocol::{Document, OpTime};
use replica_slave::{
    ReplResult, RetryConfig, RpcTransport, SlaveConfig, SlaveNode, StepOutcome, SyncSource,
};
use replica_storage::{FileStorage, MemoryStorage, StorageEngine};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Transport used by fixture slaves.
pub type LoopbackTransport = RpcTransport<Arc<LoopbackClient>>;

/// A slave configuration suited to tests: fast retries, short polls.
pub fn test_slave_config() -> SlaveConfig {
    SlaveConfig::new(SyncSource::new("127.0.0.1", 27018))
        .with_slave_name("testkit-slave")
        .with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5))
                .with_jitter(false),
        )
        .with_idle_poll_interval(Duration::from_millis(5))
}

/// A document of roughly `payload_bytes` bytes with an `i` field.
pub fn numbered_document(i: u64, payload_bytes: usize) -> Document {
    Document::new()
        .set("i", i)
        .set("b", "x".repeat(payload_bytes))
}

/// An in-process master and slave.
pub struct ReplicaPair {
    /// The master's server.
    pub master: Arc<MasterServer>,
    /// The client the slave talks through.
    pub client: Arc<LoopbackClient>,
    slave: Option<SlaveNode<LoopbackTransport>>,
    slave_config: SlaveConfig,
    slave_storage: Arc<dyn StorageEngine>,
    dir: Option<TempDir>,
}

impl ReplicaPair {
    /// Creates a pair with in-memory storage on both sides.
    pub fn new(master_config: MasterConfig, slave_config: SlaveConfig) -> Self {
        let storage: Arc<dyn StorageEngine> = Arc::new(MemoryStorage::new());
        Self::build(master_config, slave_config, storage, None)
    }

    /// Creates a pair whose slave stores its data in a temporary directory.
    pub fn file(master_config: MasterConfig, slave_config: SlaveConfig) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let storage: Arc<dyn StorageEngine> =
            Arc::new(FileStorage::open(dir.path()).expect("Failed to open slave storage"));
        Self::build(master_config, slave_config, storage, Some(dir))
    }

    fn build(
        master_config: MasterConfig,
        slave_config: SlaveConfig,
        slave_storage: Arc<dyn StorageEngine>,
        dir: Option<TempDir>,
    ) -> Self {
        let master = Arc::new(MasterServer::new(
            Arc::new(MemoryStorage::new()),
            master_config,
        ));
        let client = Arc::new(LoopbackClient::new(Arc::clone(&master)));
        let mut pair = Self {
            master,
            client,
            slave: None,
            slave_config,
            slave_storage,
            dir,
        };
        pair.slave = Some(pair.open_slave().expect("Failed to open slave"));
        pair
    }

    fn open_slave(&self) -> ReplResult<SlaveNode<LoopbackTransport>> {
        let transport = RpcTransport::new(
            self.slave_config.source.clone(),
            Arc::clone(&self.client),
        );
        SlaveNode::open(
            self.slave_config.clone(),
            transport,
            Arc::clone(&self.slave_storage),
        )
    }

    /// Returns the master node.
    pub fn master_node(&self) -> &Arc<MasterNode> {
        self.master.node()
    }

    /// Returns the slave.
    pub fn slave(&self) -> &SlaveNode<LoopbackTransport> {
        self.slave.as_ref().expect("slave is stopped")
    }

    /// Returns the slave's storage.
    pub fn slave_storage(&self) -> &Arc<dyn StorageEngine> {
        &self.slave_storage
    }

    /// Stops the slave, releasing its storage.
    pub fn stop_slave(&mut self) {
        if let Some(slave) = self.slave.take() {
            slave.shutdown().expect("Failed to stop slave");
        }
    }

    /// Stops and reopens the slave from its persisted state. File-backed
    /// storage is reopened from disk.
    pub fn restart_slave(&mut self) -> ReplResult<()> {
        self.stop_slave();
        if let Some(dir) = &self.dir {
            // The directory lock must be released before it can be taken again.
            self.slave_storage = Arc::new(MemoryStorage::new());
            self.slave_storage = Arc::new(FileStorage::open(dir.path())?);
        }
        self.slave = Some(self.open_slave()?);
        Ok(())
    }

    /// Inserts `count` numbered documents into `db.collection` on the
    /// master, starting at `start`. Returns the last op time.
    pub fn write_numbered(
        &self,
        db: &str,
        collection: &str,
        start: u64,
        count: u64,
        payload_bytes: usize,
    ) -> OpTime {
        let mut last = OpTime::ZERO;
        for i in start..start + count {
            last = self
                .master_node()
                .insert(db, collection, numbered_document(i, payload_bytes))
                .expect("Failed to write to master");
        }
        last
    }

    /// Drives the slave until it is idle.
    pub fn sync(&self) -> ReplResult<StepOutcome> {
        self.slave().sync_until_idle()
    }

    /// Returns the `repl` section of the slave's `serverStatus` reply.
    pub fn repl_status(&self) -> serde_json::Value {
        let mut status = self.slave().run_command("serverStatus").to_json();
        status["repl"].take()
    }

    /// Returns true if the slave's copy of `db` holds the same documents
    /// as the master's. Empty collections are not compared.
    pub fn databases_match(&self, db: &str) -> bool {
        let master = self
            .master_node()
            .storage()
            .snapshot(db)
            .expect("Failed to snapshot master");
        let slave = self
            .slave_storage
            .snapshot(db)
            .expect("Failed to snapshot slave");
        master.into_rows() == slave.into_rows()
    }
}
