//! Replicated state-machine apply pipeline sitting between a Raft-style consensus
//! log and a column-family KV storage engine: a single-consumer driver applies
//! committed log entries to a pluggable state machine, completing the closures
//! the entries were originally submitted with.

pub mod config;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod leader;
pub mod metrics;
pub mod snapshot;
pub mod state_machine;
pub mod types;

pub use config::{RheaConfig, SnapshotMode};
pub use driver::{ErrorListener, FsmDriver, IndexListener, LogSource};
pub use engine::KvEngine;
pub use errors::{EngineError, FsmError, Status};
pub use leader::{LeaderNotifier, Listener};
pub use metrics::ApplyMetrics;
pub use state_machine::{KvStateMachine, NodeExecutor, RegionOwner, StateMachine};
pub use types::{
    ClosureOutcome, Configuration, DecodedDataEntry, EntryCursor, EntryPreview, EntryType,
    KvClosure, LockAcquireOutcome, LockOwner, LockReleaseOutcome, LockRequest, LockResponse,
    LogEntry, Operation, OperationKind, OperationPayload, ResponsePayload, SequenceRange,
};
