use std::path::PathBuf;

/// Snapshot persistence strategy selected at configuration time (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// LSM checkpoint (hard-linked SST files); no metadata blob.
    Fast,
    /// Full backup engine producing an incrementable backup set, zipped for transfer.
    Backup,
}

/// Default chunk size for write-batch splitting (§4.3 "Batch sizing").
pub const DEFAULT_MAX_BATCH_WRITE_SIZE: usize = 512;
/// Default capacity of the FSM driver's single-consumer ring buffer (§4.1).
pub const DEFAULT_RING_BUFFER_CAPACITY: usize = 4096;
/// Default stride used by approximate-count "jumpOver" iteration (§4.3).
pub const DEFAULT_APPROXIMATE_COUNT_STRIDE: u64 = 100;
/// Default worker count for the leader-state listener fanout executor (§4.4).
pub const DEFAULT_LEADER_FANOUT_WORKERS: usize = 2;

/// Configuration accepted by this crate's engine and driver. Parsing this out of argv
/// or a config file is the embedding application's job (out of scope here) — this is
/// just the plain struct that results from that parsing, in the builder style used
/// throughout the teacher codebase's `ServerConfig`.
#[derive(Debug, Clone)]
pub struct RheaConfig {
    pub data_dir: PathBuf,
    pub snapshot_mode: SnapshotMode,
    pub max_batch_write_size: usize,
    pub ring_buffer_capacity: usize,
    pub approximate_count_stride: u64,
    pub leader_fanout_workers: usize,
}

impl RheaConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            snapshot_mode: SnapshotMode::Fast,
            max_batch_write_size: DEFAULT_MAX_BATCH_WRITE_SIZE,
            ring_buffer_capacity: DEFAULT_RING_BUFFER_CAPACITY,
            approximate_count_stride: DEFAULT_APPROXIMATE_COUNT_STRIDE,
            leader_fanout_workers: DEFAULT_LEADER_FANOUT_WORKERS,
        }
    }

    pub fn snapshot_mode(mut self, mode: SnapshotMode) -> Self {
        self.snapshot_mode = mode;
        self
    }

    pub fn max_batch_write_size(mut self, size: usize) -> Self {
        self.max_batch_write_size = size;
        self
    }

    pub fn ring_buffer_capacity(mut self, capacity: usize) -> Self {
        self.ring_buffer_capacity = capacity;
        self
    }

    pub fn approximate_count_stride(mut self, stride: u64) -> Self {
        self.approximate_count_stride = stride;
        self
    }

    pub fn leader_fanout_workers(mut self, workers: usize) -> Self {
        self.leader_fanout_workers = workers;
        self
    }
}
