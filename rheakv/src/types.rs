use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, FsmError, Status};

/// Discriminator used for batch-grouping consecutive same-kind operations (§3, §4.2).
/// `repr(u8)` mirrors the spec's "single-byte discriminator".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationKind {
    Put = 0,
    PutIfAbsent = 1,
    PutList = 2,
    Delete = 3,
    DeleteRange = 4,
    Get = 5,
    MultiGet = 6,
    Scan = 7,
    GetAndPut = 8,
    Merge = 9,
    GetSequence = 10,
    ResetSequence = 11,
    KeyLock = 12,
    KeyLockRelease = 13,
    NodeExecute = 14,
    RangeSplit = 15,
}

impl OperationKind {
    pub const COUNT: usize = 16;
}

/// Tagged union of KV operations (§3). Each variant carries the fields that kind requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    Put { key: Vec<u8>, value: Vec<u8> },
    PutIfAbsent { key: Vec<u8>, value: Vec<u8> },
    PutList { entries: Vec<(Vec<u8>, Vec<u8>)> },
    Delete { key: Vec<u8> },
    DeleteRange { start: Vec<u8>, end: Vec<u8> },
    Get { key: Vec<u8> },
    MultiGet { keys: Vec<Vec<u8>> },
    Scan { start: Vec<u8>, end: Vec<u8>, limit: Option<u32> },
    GetAndPut { key: Vec<u8>, value: Vec<u8> },
    Merge { key: Vec<u8>, value: Vec<u8> },
    GetSequence { key: Vec<u8>, step: u64 },
    ResetSequence { key: Vec<u8> },
    KeyLock { key: Vec<u8>, request: LockRequest },
    KeyLockRelease { key: Vec<u8>, acquirer_id: String, now_ms: i64 },
    NodeExecute { payload: Vec<u8> },
    RangeSplit { from_region: u64, to_region: u64, split_key: Vec<u8> },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Put { .. } => OperationKind::Put,
            Operation::PutIfAbsent { .. } => OperationKind::PutIfAbsent,
            Operation::PutList { .. } => OperationKind::PutList,
            Operation::Delete { .. } => OperationKind::Delete,
            Operation::DeleteRange { .. } => OperationKind::DeleteRange,
            Operation::Get { .. } => OperationKind::Get,
            Operation::MultiGet { .. } => OperationKind::MultiGet,
            Operation::Scan { .. } => OperationKind::Scan,
            Operation::GetAndPut { .. } => OperationKind::GetAndPut,
            Operation::Merge { .. } => OperationKind::Merge,
            Operation::GetSequence { .. } => OperationKind::GetSequence,
            Operation::ResetSequence { .. } => OperationKind::ResetSequence,
            Operation::KeyLock { .. } => OperationKind::KeyLock,
            Operation::KeyLockRelease { .. } => OperationKind::KeyLockRelease,
            Operation::NodeExecute { .. } => OperationKind::NodeExecute,
            Operation::RangeSplit { .. } => OperationKind::RangeSplit,
        }
    }

    /// Decode bytes into an `Operation`. The wire framing is opaque to this subsystem
    /// (§6); `bincode` is the default pluggable codec, matching the teacher's own
    /// serialization choice throughout `replication` and `db`.
    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        bincode::deserialize(bytes).map_err(|e| EngineError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        bincode::serialize(self).map_err(|e| EngineError::Decode(e.to_string()))
    }
}

/// Per-key distributed lock request fields (§3 "Lock Owner", §4.3 "Distributed lock protocol").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub acquirer_id: String,
    pub lease_ms: i64,
    pub now_ms: i64,
    pub keep_lease: bool,
    pub context: Vec<u8>,
}

/// One-shot completion handle (§3 "Closure"). Invoked exactly once with either a
/// success payload or a failure status.
pub trait KvClosure: Send {
    fn complete(self: Box<Self>, outcome: ClosureOutcome);

    /// Pre-apply observer hook, invoked once `doCommitted` has decided this closure's
    /// index falls within `(lastApplied, N]`, before the corresponding entry is applied.
    fn on_committed(&self) {}
}

#[derive(Debug, Clone)]
pub enum ClosureOutcome {
    Success(ResponsePayload),
    Failure(Status),
}

impl ClosureOutcome {
    pub fn failure(status: Status) -> Self {
        ClosureOutcome::Failure(status)
    }
}

/// Response payloads returned through a closure. Covers every dispatch-table outcome
/// in §4.2 with one variant per shape rather than a single opaque byte string, so
/// callers don't have to re-decode their own request type to read the result.
#[derive(Debug, Clone)]
pub enum ResponsePayload {
    Unit,
    Value(Option<Vec<u8>>),
    Values(Vec<Option<Vec<u8>>>),
    KvPairs(Vec<(Vec<u8>, Vec<u8>)>),
    Sequence { start: u64, end: u64 },
    Lock(LockResponse),
    LockRelease(LockReleaseOutcome),
    Count(u64),
    Bytes(Vec<u8>),
    Inserted(bool),
}

/// Outcome tag for a lock acquisition attempt (§4.3 "Distributed lock protocol").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquireOutcome {
    FirstTimeSuccess,
    NewAcquireSuccess,
    KeepLeaseSuccess,
    ReentrantSuccess,
    KeepLeaseFail,
    OwnedByOther,
}

#[derive(Debug, Clone)]
pub struct LockResponse {
    pub success: bool,
    pub outcome: LockAcquireOutcome,
    pub fencing_token: u64,
    pub acquires: u32,
    /// Populated on `OwnedByOther`: the current owner's id and remaining lease, so the
    /// caller can back off (§4.3).
    pub current_owner: Option<String>,
    pub remaining_ms: Option<i64>,
}

/// Outcome of a release attempt (§4.3 "Release protocol"). The wrong-acquirer case
/// echoes back the current owner and its remaining lease, same as `OwnedByOther` does
/// for acquisition, rather than surfacing as a bare error string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockReleaseOutcome {
    Released,
    NotFound,
    OwnedByOther { current_owner: String, remaining_ms: i64 },
}

/// Persisted lock ownership record (§3 "Lock Owner"). `success` is never part of the
/// stored record; only the returned `LockResponse` carries it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockOwner {
    pub acquirer_id: String,
    pub deadline_ms: i64,
    pub fencing_token: u64,
    pub acquires: u32,
    pub context: Vec<u8>,
}

/// Kept behind a trait (per §9 design notes) so the persisted lock-record format can
/// evolve without touching the protocol logic.
pub trait OwnerCodec: Send + Sync {
    fn encode(&self, owner: &LockOwner) -> Result<Vec<u8>, EngineError>;
    fn decode(&self, bytes: &[u8]) -> Result<LockOwner, EngineError>;
}

#[derive(Debug, Default)]
pub struct BincodeOwnerCodec;

impl OwnerCodec for BincodeOwnerCodec {
    fn encode(&self, owner: &LockOwner) -> Result<Vec<u8>, EngineError> {
        bincode::serialize(owner).map_err(|e| EngineError::Storage(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<LockOwner, EngineError> {
        bincode::deserialize(bytes).map_err(|e| EngineError::Storage(e.to_string()))
    }
}

/// Log entry type (§3 "Log Entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Data,
    Configuration,
    NoOp,
}

/// Committed cluster membership, attached to CONFIGURATION entries (§4.1).
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub peers: Vec<u64>,
    pub old_peers: Vec<u64>,
}

impl Configuration {
    /// True while a joint-consensus transition is still in flight (old peers present).
    pub fn is_joint(&self) -> bool {
        !self.old_peers.is_empty()
    }
}

/// Re-architected per §9 design notes: when the operation has already been
/// constructed on the local leader, it's attached directly to skip deserialization.
pub enum OperationPayload {
    Raw(Vec<u8>),
    Decoded(Box<Operation>),
}

impl OperationPayload {
    pub fn decode(self) -> Result<Operation, EngineError> {
        match self {
            OperationPayload::Raw(bytes) => Operation::decode(&bytes),
            OperationPayload::Decoded(op) => Ok(*op),
        }
    }

    pub fn peek_kind(&self) -> Option<OperationKind> {
        match self {
            OperationPayload::Raw(_) => None,
            OperationPayload::Decoded(op) => Some(op.kind()),
        }
    }
}

/// A committed log entry as consumed by the FSM driver (§3).
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub entry_type: EntryType,
    pub payload: Option<OperationPayload>,
    pub closure: Option<Box<dyn KvClosure>>,
    pub configuration: Option<Configuration>,
}

/// A decoded DATA entry handed to the state machine's dispatch table, after the
/// cursor has resolved `OperationPayload` into a concrete `Operation`.
pub struct DecodedDataEntry {
    pub index: u64,
    pub operation: Operation,
    pub closure: Option<Box<dyn KvClosure>>,
}

/// Cheap preview of the next entry without consuming it, so the driver can decide
/// whether to handle it directly (NO-OP/CONFIGURATION) or hand it to the state
/// machine (DATA), and so the state machine can decide whether the next entry
/// continues the current batch.
#[derive(Debug, Clone, Copy)]
pub struct EntryPreview {
    pub entry_type: EntryType,
    pub op_kind: Option<OperationKind>,
}

/// Lazy iterator over committed log entries in `(lastApplied, N]`, handed to the
/// state machine's `onApply` (§4.2). `peek` decodes DATA entries far enough to learn
/// their `OperationKind` (caching the result so `pop` never decodes twice) without
/// otherwise consuming them, which is what lets the state machine group a run of
/// same-kind entries into one batch before popping any of them.
pub trait EntryCursor {
    fn peek(&mut self) -> Result<Option<EntryPreview>, FsmError>;
    fn pop(&mut self) -> Result<LogEntry, FsmError>;
    fn has_error(&self) -> bool;

    /// Index of the last entry actually popped, so the driver can learn how far a
    /// state machine's `onApply` call advanced without it reporting the index back.
    fn last_popped_index(&self) -> Option<u64>;
}

/// Context accompanying `onStartFollowing`/`onStopFollowing` (§4, §6).
#[derive(Debug, Clone, Default)]
pub struct FollowingContext {
    pub leader_id: Option<u64>,
    pub term: u64,
}

/// Range returned by a successful `GET_SEQUENCE` (§3 "Sequence Counter").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceRange {
    pub start: u64,
    pub end: u64,
}
