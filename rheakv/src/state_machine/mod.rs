use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::KvEngine;
use crate::errors::{EngineError, FsmError, Status};
use crate::metrics::ApplyMetrics;
use crate::snapshot::{LocalFileMeta, SnapshotMetadata, SnapshotReader, SnapshotWriter};
use crate::types::{
    ClosureOutcome, Configuration, DecodedDataEntry, EntryCursor, EntryType, KvClosure,
    OperationKind, ResponsePayload,
};

/// Routes `NODE_EXECUTE` to the embedding application's administrative node logic
/// (§4.2 "batchNodeExecute(isLeader)"). Split out as a trait since what a node-execute
/// payload actually does is outside this subsystem's concern.
pub trait NodeExecutor: Send + Sync {
    fn execute(&self, payload: &[u8], is_leader: bool) -> Result<Vec<u8>, EngineError>;
}

/// Routes `RANGE_SPLIT` to whichever region owns the split (§4.2 "delegate to the
/// region owner with (fromRegion, toRegion, splitKey)"). Split policy itself lives
/// above this subsystem; this is only the delegation seam.
pub trait RegionOwner: Send + Sync {
    fn split(&self, from_region: u64, to_region: u64, split_key: &[u8]) -> Result<(), EngineError>;
}

/// The seam between the FSM driver and a concrete engine (§4, §4.2). The driver only
/// ever calls through this trait; it never touches `KvEngine` directly.
pub trait StateMachine: Send + Sync {
    fn on_apply(&self, cursor: &mut dyn EntryCursor, metrics: &ApplyMetrics) -> Result<(), FsmError>;
    fn on_configuration_committed(&self, config: &Configuration);
    fn on_snapshot_save(&self, writer: &dyn SnapshotWriter) -> Result<LocalFileMeta, FsmError>;
    fn on_snapshot_load(
        &self,
        reader: &dyn SnapshotReader,
        meta: &LocalFileMeta,
        snapshot_meta: &SnapshotMetadata,
    ) -> Result<bool, FsmError>;
}

/// Default facade wrapping the RocksDB-backed engine, grounded on the teacher's
/// `DbStateMachineHandler` (`db/src/replication/mod.rs`): a thin dispatch table that
/// decodes a command, calls into the storage layer, and completes the closure.
pub struct KvStateMachine {
    engine: Arc<KvEngine>,
    node_executor: Option<Arc<dyn NodeExecutor>>,
    region_owner: Option<Arc<dyn RegionOwner>>,
    is_leader: AtomicBool,
}

impl KvStateMachine {
    pub fn new(engine: Arc<KvEngine>) -> Self {
        KvStateMachine {
            engine,
            node_executor: None,
            region_owner: None,
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn with_node_executor(mut self, executor: Arc<dyn NodeExecutor>) -> Self {
        self.node_executor = Some(executor);
        self
    }

    pub fn with_region_owner(mut self, owner: Arc<dyn RegionOwner>) -> Self {
        self.region_owner = Some(owner);
        self
    }

    /// Updated by the embedding application as leadership changes, e.g. from a
    /// `leader::Listener` impl that forwards into this (§4.2 "batchNodeExecute(isLeader)").
    pub fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::Release);
    }

    pub fn engine(&self) -> &Arc<KvEngine> {
        &self.engine
    }

    fn dispatch_batch(
        &self,
        kind: OperationKind,
        batch: Vec<DecodedDataEntry>,
        metrics: &ApplyMetrics,
    ) -> Result<(), FsmError> {
        let entry_count = batch.len() as u64;

        match kind {
            OperationKind::Put => {
                let items: Vec<(Vec<u8>, Vec<u8>)> = batch
                    .iter()
                    .map(|e| match &e.operation {
                        crate::types::Operation::Put { key, value } => (key.clone(), value.clone()),
                        _ => unreachable!("batch grouped by kind"),
                    })
                    .collect();
                let results = self.engine.batch_put(&items);
                for (entry, result) in batch.into_iter().zip(results) {
                    complete(entry.closure, result.map(|_| ResponsePayload::Unit));
                }
            }
            OperationKind::PutIfAbsent => {
                let items: Vec<(Vec<u8>, Vec<u8>)> = batch
                    .iter()
                    .map(|e| match &e.operation {
                        crate::types::Operation::PutIfAbsent { key, value } => {
                            (key.clone(), value.clone())
                        }
                        _ => unreachable!("batch grouped by kind"),
                    })
                    .collect();
                let results = self.engine.batch_put_if_absent(&items);
                for (entry, result) in batch.into_iter().zip(results) {
                    complete(entry.closure, result.map(ResponsePayload::Inserted));
                }
            }
            OperationKind::PutList => {
                for entry in batch {
                    let items = match entry.operation {
                        crate::types::Operation::PutList { entries } => entries,
                        _ => unreachable!("batch grouped by kind"),
                    };
                    let results = self.engine.batch_put(&items);
                    let failed = results.iter().find_map(|r| r.as_ref().err().cloned());
                    match failed {
                        Some(err) => complete(entry.closure, Err(err)),
                        None => complete(entry.closure, Ok(ResponsePayload::Unit)),
                    }
                }
            }
            OperationKind::Delete => {
                let keys: Vec<Vec<u8>> = batch
                    .iter()
                    .map(|e| match &e.operation {
                        crate::types::Operation::Delete { key } => key.clone(),
                        _ => unreachable!("batch grouped by kind"),
                    })
                    .collect();
                let results = self.engine.batch_delete(&keys);
                for (entry, result) in batch.into_iter().zip(results) {
                    complete(entry.closure, result.map(|_| ResponsePayload::Unit));
                }
            }
            OperationKind::DeleteRange => {
                let ranges: Vec<(Vec<u8>, Vec<u8>)> = batch
                    .iter()
                    .map(|e| match &e.operation {
                        crate::types::Operation::DeleteRange { start, end } => {
                            (start.clone(), end.clone())
                        }
                        _ => unreachable!("batch grouped by kind"),
                    })
                    .collect();
                let results = self.engine.batch_delete_range(&ranges);
                for (entry, result) in batch.into_iter().zip(results) {
                    complete(entry.closure, result.map(|_| ResponsePayload::Unit));
                }
            }
            OperationKind::Get => {
                for entry in batch {
                    let key = match &entry.operation {
                        crate::types::Operation::Get { key } => key.clone(),
                        _ => unreachable!("batch grouped by kind"),
                    };
                    let result = self.engine.get(&key).map(ResponsePayload::Value);
                    complete(entry.closure, result);
                }
            }
            OperationKind::MultiGet => {
                for entry in batch {
                    let keys = match &entry.operation {
                        crate::types::Operation::MultiGet { keys } => keys.clone(),
                        _ => unreachable!("batch grouped by kind"),
                    };
                    let result = self.engine.multi_get(&keys).map(ResponsePayload::Values);
                    complete(entry.closure, result);
                }
            }
            OperationKind::Scan => {
                for entry in batch {
                    let (start, end, limit) = match &entry.operation {
                        crate::types::Operation::Scan { start, end, limit } => {
                            (start.clone(), end.clone(), *limit)
                        }
                        _ => unreachable!("batch grouped by kind"),
                    };
                    let result = self.engine.scan(&start, &end, limit).map(ResponsePayload::KvPairs);
                    complete(entry.closure, result);
                }
            }
            OperationKind::GetAndPut => {
                let items: Vec<(Vec<u8>, Vec<u8>)> = batch
                    .iter()
                    .map(|e| match &e.operation {
                        crate::types::Operation::GetAndPut { key, value } => {
                            (key.clone(), value.clone())
                        }
                        _ => unreachable!("batch grouped by kind"),
                    })
                    .collect();
                let results = self.engine.batch_get_and_put(&items);
                for (entry, result) in batch.into_iter().zip(results) {
                    complete(entry.closure, result.map(ResponsePayload::Value));
                }
            }
            OperationKind::Merge => {
                let items: Vec<(Vec<u8>, Vec<u8>)> = batch
                    .iter()
                    .map(|e| match &e.operation {
                        crate::types::Operation::Merge { key, value } => {
                            (key.clone(), value.clone())
                        }
                        _ => unreachable!("batch grouped by kind"),
                    })
                    .collect();
                let results = self.engine.batch_merge(&items);
                for (entry, result) in batch.into_iter().zip(results) {
                    complete(entry.closure, result.map(|_| ResponsePayload::Unit));
                }
            }
            OperationKind::GetSequence => {
                let requests: Vec<(Vec<u8>, u64)> = batch
                    .iter()
                    .map(|e| match &e.operation {
                        crate::types::Operation::GetSequence { key, step } => (key.clone(), *step),
                        _ => unreachable!("batch grouped by kind"),
                    })
                    .collect();
                let results = self.engine.batch_get_sequence(&requests);
                for (entry, result) in batch.into_iter().zip(results) {
                    complete(
                        entry.closure,
                        result.map(|range| {
                            ResponsePayload::Sequence {
                                start: range.start,
                                end: range.end,
                            }
                        }),
                    );
                }
            }
            OperationKind::ResetSequence => {
                for entry in batch {
                    let key = match &entry.operation {
                        crate::types::Operation::ResetSequence { key } => key.clone(),
                        _ => unreachable!("batch grouped by kind"),
                    };
                    let result = self.engine.reset_sequence(&key).map(|_| ResponsePayload::Unit);
                    complete(entry.closure, result);
                }
            }
            OperationKind::KeyLock => {
                for entry in batch {
                    let (key, request) = match entry.operation {
                        crate::types::Operation::KeyLock { key, request } => (key, request),
                        _ => unreachable!("batch grouped by kind"),
                    };
                    let result = self.engine.key_lock(&key, &request).map(ResponsePayload::Lock);
                    complete(entry.closure, result);
                }
            }
            OperationKind::KeyLockRelease => {
                for entry in batch {
                    let (key, acquirer_id, now_ms) = match &entry.operation {
                        crate::types::Operation::KeyLockRelease { key, acquirer_id, now_ms } => {
                            (key.clone(), acquirer_id.clone(), *now_ms)
                        }
                        _ => unreachable!("batch grouped by kind"),
                    };
                    let result = self
                        .engine
                        .key_lock_release(&key, &acquirer_id, now_ms)
                        .map(ResponsePayload::LockRelease);
                    complete(entry.closure, result);
                }
            }
            OperationKind::NodeExecute => {
                for entry in batch {
                    let payload = match &entry.operation {
                        crate::types::Operation::NodeExecute { payload } => payload.clone(),
                        _ => unreachable!("batch grouped by kind"),
                    };
                    let is_leader = self.is_leader.load(Ordering::Acquire);
                    let result = match &self.node_executor {
                        Some(executor) => executor.execute(&payload, is_leader).map(ResponsePayload::Bytes),
                        None => Ok(ResponsePayload::Bytes(Vec::new())),
                    };
                    complete(entry.closure, result);
                }
            }
            OperationKind::RangeSplit => {
                for entry in batch {
                    let (from_region, to_region, split_key) = match &entry.operation {
                        crate::types::Operation::RangeSplit { from_region, to_region, split_key } => {
                            (*from_region, *to_region, split_key.clone())
                        }
                        _ => unreachable!("batch grouped by kind"),
                    };
                    let result = match &self.region_owner {
                        Some(owner) => owner.split(from_region, to_region, &split_key),
                        None => Ok(()),
                    }
                    .map(|_| ResponsePayload::Unit);
                    complete(entry.closure, result);
                }
            }
        }

        metrics.record_batch(kind, entry_count);
        Ok(())
    }
}

impl StateMachine for KvStateMachine {
    fn on_apply(&self, cursor: &mut dyn EntryCursor, metrics: &ApplyMetrics) -> Result<(), FsmError> {
        let mut batch: Vec<DecodedDataEntry> = Vec::new();
        let mut kind: Option<OperationKind> = None;

        loop {
            let entry = cursor.pop()?;
            let payload = entry
                .payload
                .expect("driver only invokes onApply for DATA entries, which always carry a payload");

            match payload.decode() {
                Ok(operation) => {
                    kind.get_or_insert(operation.kind());
                    batch.push(DecodedDataEntry {
                        index: entry.index,
                        operation,
                        closure: entry.closure,
                    });
                }
                Err(decode_err) => {
                    complete(entry.closure, Err(decode_err));
                    metrics.record_batch_failure();
                }
            }

            match cursor.peek()? {
                Some(preview)
                    if preview.entry_type == EntryType::Data
                        && (kind.is_none() || preview.op_kind == kind) =>
                {
                    continue;
                }
                _ => break,
            }
        }

        if batch.is_empty() {
            return Ok(());
        }

        let kind = kind.expect("a non-empty batch always resolved a kind");
        self.dispatch_batch(kind, batch, metrics)
    }

    fn on_configuration_committed(&self, config: &Configuration) {
        tracing::info!(
            peers = ?config.peers,
            old_peers = ?config.old_peers,
            joint = config.is_joint(),
            "configuration committed"
        );
    }

    fn on_snapshot_save(&self, writer: &dyn SnapshotWriter) -> Result<LocalFileMeta, FsmError> {
        self.engine
            .snapshot_save(writer.path())
            .map_err(FsmError::from)
    }

    fn on_snapshot_load(
        &self,
        reader: &dyn SnapshotReader,
        _meta: &LocalFileMeta,
        _snapshot_meta: &SnapshotMetadata,
    ) -> Result<bool, FsmError> {
        self.engine.snapshot_load(reader.path())?;
        Ok(true)
    }
}

fn complete(closure: Option<Box<dyn KvClosure>>, result: Result<ResponsePayload, crate::errors::EngineError>) {
    if let Some(closure) = closure {
        match result {
            Ok(payload) => closure.complete(ClosureOutcome::Success(payload)),
            Err(err) => closure.complete(ClosureOutcome::failure(Status::from(&err))),
        }
    }
}
