//! Master configuration.

/// Default operation log capacity (64 MiB).
pub const DEFAULT_OPLOG_CAPACITY: usize = 64 * 1024 * 1024;

/// Configuration for a master node.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Maximum encoded size of the operation log in bytes.
    pub oplog_capacity_bytes: usize,
    /// Maximum number of entries returned by one log read.
    pub max_read_batch: u32,
    /// Maximum number of documents per snapshot batch.
    pub snapshot_batch_size: u32,
    /// Maximum number of snapshots open at once. Opening one more evicts
    /// the least recently used session; zero disables snapshots.
    pub max_open_snapshots: usize,
}

impl MasterConfig {
    /// Creates a configuration with the given log capacity.
    pub fn new(oplog_capacity_bytes: usize) -> Self {
        Self {
            oplog_capacity_bytes,
            max_read_batch: 1000,
            snapshot_batch_size: 500,
            max_open_snapshots: 16,
        }
    }

    /// Sets the log capacity in megabytes, like `--oplogSize`.
    pub fn with_oplog_size_mb(mut self, megabytes: usize) -> Self {
        self.oplog_capacity_bytes = megabytes * 1024 * 1024;
        self
    }

    /// Sets the log capacity in bytes.
    pub fn with_oplog_capacity(mut self, bytes: usize) -> Self {
        self.oplog_capacity_bytes = bytes;
        self
    }

    /// Sets the maximum log read batch.
    pub fn with_max_read_batch(mut self, size: u32) -> Self {
        self.max_read_batch = size;
        self
    }

    /// Sets the maximum snapshot batch size.
    pub fn with_snapshot_batch_size(mut self, size: u32) -> Self {
        self.snapshot_batch_size = size;
        self
    }

    /// Sets the maximum number of open snapshots.
    pub fn with_max_open_snapshots(mut self, max: usize) -> Self {
        self.max_open_snapshots = max;
        self
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self::new(DEFAULT_OPLOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = MasterConfig::default();
        assert_eq!(config.oplog_capacity_bytes, DEFAULT_OPLOG_CAPACITY);
        assert_eq!(config.max_open_snapshots, 16);
    }

    #[test]
    fn config_builder() {
        let config = MasterConfig::default()
            .with_oplog_size_mb(1)
            .with_max_read_batch(50)
            .with_snapshot_batch_size(10);

        assert_eq!(config.oplog_capacity_bytes, 1024 * 1024);
        assert_eq!(config.max_read_batch, 50);
        assert_eq!(config.snapshot_batch_size, 10);
    }
}
