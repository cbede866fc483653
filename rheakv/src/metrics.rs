use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::OperationKind;

/// In-process counters updated as an observable side effect of `onApply` (§4.2 point 4).
/// Wiring these into an external sink (Prometheus, an OTel collector, ...) is left to the
/// embedding application — this struct only holds the numbers.
#[derive(Debug, Default)]
pub struct ApplyMetrics {
    applied_entries: AtomicU64,
    applied_batches: AtomicU64,
    failed_batches: AtomicU64,
    per_kind: [AtomicU64; OperationKind::COUNT],
}

impl ApplyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, kind: OperationKind, entry_count: u64) {
        self.applied_entries.fetch_add(entry_count, Ordering::Relaxed);
        self.applied_batches.fetch_add(1, Ordering::Relaxed);
        self.per_kind[kind as usize].fetch_add(entry_count, Ordering::Relaxed);
    }

    pub fn record_batch_failure(&self) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn applied_entries(&self) -> u64 {
        self.applied_entries.load(Ordering::Relaxed)
    }

    pub fn applied_batches(&self) -> u64 {
        self.applied_batches.load(Ordering::Relaxed)
    }

    pub fn failed_batches(&self) -> u64 {
        self.failed_batches.load(Ordering::Relaxed)
    }

    pub fn count_for(&self, kind: OperationKind) -> u64 {
        self.per_kind[kind as usize].load(Ordering::Relaxed)
    }
}
