use thiserror::Error;

/// Errors surfaced by the KV engine adapter (§4.3, §7).
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("payload could not be decoded into an operation: {0}")]
    Decode(String),
    #[error("snapshot io error: {0}")]
    SnapshotIo(String),
    #[error("snapshot is stale: current ({current_index}, {current_term}) > snapshot ({snapshot_index}, {snapshot_term})")]
    StaleSnapshot {
        current_index: u64,
        current_term: u64,
        snapshot_index: u64,
        snapshot_term: u64,
    },
}

impl From<rocksdb::Error> for EngineError {
    fn from(value: rocksdb::Error) -> Self {
        EngineError::Storage(value.to_string())
    }
}

/// Errors surfaced by the FSM driver (§7). Wraps `EngineError` plus driver-only kinds.
#[derive(Error, Debug, Clone)]
pub enum FsmError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("illegal operation: discriminator {0:?} is not dispatchable")]
    IllegalOperation(crate::types::OperationKind),
    #[error("state machine is latched in an error state and is no longer accepting applies")]
    LatchedStateMachineError,
}

/// A `(code, message)` pair surfaced to closures, matching the RPC-visible status
/// contract in §7 ("closures expose a `(code, message)` status; success is code 0").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: i32,
    pub message: String,
}

impl Status {
    pub const OK_CODE: i32 = 0;

    pub fn ok() -> Self {
        Status {
            code: Self::OK_CODE,
            message: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Self::OK_CODE
    }

    pub fn from_error<E: std::fmt::Display>(code: i32, err: E) -> Self {
        Status {
            code,
            message: err.to_string(),
        }
    }
}

impl From<&FsmError> for Status {
    fn from(value: &FsmError) -> Self {
        Status::from_error(1, value)
    }
}

impl From<&EngineError> for Status {
    fn from(value: &EngineError) -> Self {
        Status::from_error(1, value)
    }
}
