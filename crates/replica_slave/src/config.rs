//! Configuration for the slave.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Address of the master a slave replicates from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncSource {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl SyncSource {
    /// Creates a sync source.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for SyncSource {
    fn default() -> Self {
        Self::new("127.0.0.1", 27017)
    }
}

impl fmt::Display for SyncSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for SyncSource {
    type Err = String;

    /// Parses `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {s:?}"))?;
        if host.is_empty() {
            return Err(format!("missing host in {s:?}"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in {s:?}: {e}"))?;
        Ok(Self::new(host, port))
    }
}

/// Configuration for a slave.
#[derive(Debug, Clone)]
pub struct SlaveConfig {
    /// Master to replicate from.
    pub source: SyncSource,
    /// Name sent in handshakes, for master-side logs.
    pub slave_name: String,
    /// Replicate only this database, if set.
    pub only: Option<String>,
    /// Maximum entries requested per log read.
    pub pull_batch_size: u32,
    /// Maximum documents requested per snapshot batch.
    pub snapshot_batch_size: u32,
    /// Retry policy for each RPC round-trip.
    pub retry: RetryConfig,
    /// Stale-snapshot retries before a resync gives up with FAULT.
    pub max_resync_attempts: u32,
    /// Wait between polls when the slave is caught up.
    pub idle_poll_interval: Duration,
    /// Start a resync automatically when a gap is detected.
    pub auto_resync: bool,
    /// Interval between usage snapshots.
    pub usage_snapshot_interval: Duration,
    /// Number of usage snapshots kept.
    pub usage_history: usize,
}

impl SlaveConfig {
    /// Creates a new slave configuration.
    pub fn new(source: SyncSource) -> Self {
        Self {
            source,
            slave_name: "replica-slave".into(),
            only: None,
            pull_batch_size: 500,
            snapshot_batch_size: 500,
            retry: RetryConfig::default(),
            max_resync_attempts: 3,
            idle_poll_interval: Duration::from_millis(500),
            auto_resync: false,
            usage_snapshot_interval: Duration::from_secs(4),
            usage_history: 100,
        }
    }

    /// Sets the slave name.
    pub fn with_slave_name(mut self, name: impl Into<String>) -> Self {
        self.slave_name = name.into();
        self
    }

    /// Restricts replication to one database.
    pub fn with_only(mut self, database: impl Into<String>) -> Self {
        self.only = Some(database.into());
        self
    }

    /// Sets the pull batch size.
    pub fn with_pull_batch_size(mut self, size: u32) -> Self {
        self.pull_batch_size = size;
        self
    }

    /// Sets the snapshot batch size.
    pub fn with_snapshot_batch_size(mut self, size: u32) -> Self {
        self.snapshot_batch_size = size;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the number of resync attempts.
    pub fn with_max_resync_attempts(mut self, attempts: u32) -> Self {
        self.max_resync_attempts = attempts;
        self
    }

    /// Sets the idle poll interval.
    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    /// Enables or disables automatic resync on gap.
    pub fn with_auto_resync(mut self, enabled: bool) -> Self {
        self.auto_resync = enabled;
        self
    }

    /// Sets the usage snapshot interval.
    pub fn with_usage_snapshot_interval(mut self, interval: Duration) -> Self {
        self.usage_snapshot_interval = interval;
        self
    }

    /// Returns true if `database` is replicated under this configuration.
    pub fn replicates(&self, database: &str) -> bool {
        database != replica_protocol::LOCAL_DATABASE
            && self.only.as_deref().map_or(true, |only| only == database)
    }
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self::new(SyncSource::default())
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first included.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% extra
            let jitter = delay_secs * 0.25 * jitter_fraction();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Pseudo-random fraction in `[0, 1)` taken from the clock's nanoseconds.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
