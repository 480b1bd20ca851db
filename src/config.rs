use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the freezer tier
#[derive(Debug, Clone)]
pub struct FreezerConfig {
    /// Directory holding the freezer environment
    pub dir: PathBuf,

    /// Advisory address-space reservation for the environment (default: 1 TiB)
    pub map_size: u64,

    /// Number of logical databases, one named sub-database each (default: 16)
    pub db_count: u32,

    /// Maximum operations buffered by one write transaction before it is
    /// considered full (default: 4096)
    pub txn_capacity: usize,

    /// Directory the snapshot copy is written to (default: ./snapshot)
    pub snapshot_dir: PathBuf,

    /// How many keys a preload cursor walk visits between yields to the
    /// caller's service callback (default: 1000)
    pub preload_interrupt_every: usize,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to reap a finished background child (default: 100ms)
    pub reap_interval: Duration,

    /// How often the autonomous flush policy checks the dirty counter
    /// (default: 1s)
    pub flush_policy_interval: Duration,

    /// Dirty-key count at which the autonomous policy starts a flush
    /// (default: 10000)
    pub dirty_flush_threshold: u64,

    /// How often to log metrics (default: 5s)
    pub metrics_interval: Duration,
}

impl Default for FreezerConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./icebox"),
            map_size: 1 << 40, // 1 TiB
            db_count: 16,
            txn_capacity: 4096,
            snapshot_dir: PathBuf::from("./snapshot"),
            preload_interrupt_every: 1000,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_millis(100),
            flush_policy_interval: Duration::from_secs(1),
            dirty_flush_threshold: 10_000,
            metrics_interval: Duration::from_secs(5),
        }
    }
}

impl FreezerConfig {
    /// Create a new config with the given environment directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the advisory map reservation
    pub fn map_size(mut self, size: u64) -> Self {
        self.map_size = size;
        self
    }

    /// Set the number of logical databases
    pub fn db_count(mut self, count: u32) -> Self {
        self.db_count = count;
        self
    }

    /// Set the write-transaction capacity
    pub fn txn_capacity(mut self, capacity: usize) -> Self {
        self.txn_capacity = capacity;
        self
    }

    /// Set the snapshot destination directory
    pub fn snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = dir.into();
        self
    }

    /// Set the preload interrupt rate
    pub fn preload_interrupt_every(mut self, every: usize) -> Self {
        self.preload_interrupt_every = every;
        self
    }

    /// Configure scheduler settings
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

impl SchedulerConfig {
    /// Set the child reap interval
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Set the autonomous flush policy interval
    pub fn flush_policy_interval(mut self, interval: Duration) -> Self {
        self.flush_policy_interval = interval;
        self
    }

    /// Set the dirty-key threshold for the autonomous flush policy
    pub fn dirty_flush_threshold(mut self, threshold: u64) -> Self {
        self.dirty_flush_threshold = threshold;
        self
    }

    /// Set the metrics logging interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }
}
