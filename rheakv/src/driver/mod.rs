mod closure_queue;

pub use closure_queue::ClosureQueue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};

use crate::config::RheaConfig;
use crate::errors::{FsmError, Status};
use crate::metrics::ApplyMetrics;
use crate::snapshot::{LocalFileMeta, SnapshotMetadata, SnapshotReader, SnapshotWriter};
use crate::state_machine::StateMachine;
use crate::types::{ClosureOutcome, EntryCursor, EntryPreview, EntryType, KvClosure, LogEntry, ResponsePayload};

/// Durable source of committed log entries (§3, §4.1). Raft log storage itself is out
/// of scope here; this is the seam the embedding application's log plugs into.
pub trait LogSource: Send + Sync {
    /// Cursor over entries with index in `(after_exclusive, upto_inclusive]`.
    fn cursor(&self, after_exclusive: u64, upto_inclusive: u64) -> Box<dyn EntryCursor + '_>;
}

/// Notified as `lastApplied` advances, e.g. for read-index bookkeeping (§4.1, §4.4).
pub trait IndexListener: Send + Sync {
    fn on_index_advanced(&self, index: u64);
}

/// Notified once the state machine latches due to an apply failure, so the external
/// Raft node can stop accepting writes (§4.1 "Failure model", §7).
pub trait ErrorListener: Send + Sync {
    fn on_latched(&self, status: Status);
}

enum DriverEvent {
    Committed(u64),
    SnapshotSave {
        writer: Box<dyn SnapshotWriter>,
        respond: mpsc::Sender<Result<LocalFileMeta, FsmError>>,
    },
    SnapshotLoad {
        reader: Box<dyn SnapshotReader>,
        meta: LocalFileMeta,
        snapshot_meta: SnapshotMetadata,
        respond: mpsc::Sender<Result<bool, FsmError>>,
    },
    Shutdown,
}

/// Wraps a raw `LogSource`-provided cursor, attaching any locally-registered closure
/// to each popped entry by index (§4.1 step 3 design note: the log itself doesn't know
/// about closures, only the driver's `ClosureQueue` does).
struct ClosureAttachingCursor<'a> {
    inner: Box<dyn EntryCursor + 'a>,
    closures: &'a mut HashMap<u64, Box<dyn KvClosure>>,
}

impl<'a> EntryCursor for ClosureAttachingCursor<'a> {
    fn peek(&mut self) -> Result<Option<EntryPreview>, FsmError> {
        self.inner.peek()
    }

    fn pop(&mut self) -> Result<LogEntry, FsmError> {
        let mut entry = self.inner.pop()?;
        entry.closure = self.closures.remove(&entry.index);
        Ok(entry)
    }

    fn has_error(&self) -> bool {
        self.inner.has_error()
    }

    fn last_popped_index(&self) -> Option<u64> {
        self.inner.last_popped_index()
    }
}

/// Drives the state machine from committed log entries on a single dedicated thread
/// (§4.1). Producers (the Raft layer, snapshot callers) only ever push events onto the
/// bounded channel; none of them block on RocksDB I/O themselves.
pub struct FsmDriver {
    sender: Sender<DriverEvent>,
    handle: Mutex<Option<JoinHandle<()>>>,
    last_applied_index: Arc<AtomicU64>,
    last_applied_term: Arc<AtomicU64>,
    error_latch: Arc<AtomicBool>,
    closure_queue: Arc<ClosureQueue>,
    listeners: Arc<RwLock<Vec<Arc<dyn IndexListener>>>>,
    error_listeners: Arc<RwLock<Vec<Arc<dyn ErrorListener>>>>,
}

struct Consumer {
    log_source: Arc<dyn LogSource>,
    state_machine: Arc<dyn StateMachine>,
    closure_queue: Arc<ClosureQueue>,
    metrics: Arc<ApplyMetrics>,
    listeners: Arc<RwLock<Vec<Arc<dyn IndexListener>>>>,
    error_listeners: Arc<RwLock<Vec<Arc<dyn ErrorListener>>>>,
    last_applied_index: Arc<AtomicU64>,
    last_applied_term: Arc<AtomicU64>,
    error_latch: Arc<AtomicBool>,
    receiver: crossbeam_channel::Receiver<DriverEvent>,
}

impl FsmDriver {
    pub fn new(
        log_source: Arc<dyn LogSource>,
        state_machine: Arc<dyn StateMachine>,
        metrics: Arc<ApplyMetrics>,
        config: &RheaConfig,
    ) -> Self {
        let (sender, receiver) = bounded(config.ring_buffer_capacity);
        let closure_queue = Arc::new(ClosureQueue::new());
        let listeners = Arc::new(RwLock::new(Vec::new()));
        let error_listeners = Arc::new(RwLock::new(Vec::new()));
        let last_applied_index = Arc::new(AtomicU64::new(0));
        let last_applied_term = Arc::new(AtomicU64::new(0));
        let error_latch = Arc::new(AtomicBool::new(false));

        let consumer = Consumer {
            log_source,
            state_machine,
            closure_queue: closure_queue.clone(),
            metrics,
            listeners: listeners.clone(),
            error_listeners: error_listeners.clone(),
            last_applied_index: last_applied_index.clone(),
            last_applied_term: last_applied_term.clone(),
            error_latch: error_latch.clone(),
            receiver,
        };

        let handle = std::thread::Builder::new()
            .name("rheakv-fsm-apply".to_string())
            .spawn(move || consumer.run())
            .expect("failed to spawn fsm apply thread");

        FsmDriver {
            sender,
            handle: Mutex::new(Some(handle)),
            last_applied_index,
            last_applied_term,
            error_latch,
            closure_queue,
            listeners,
            error_listeners,
        }
    }

    /// Registers a closure to be completed once the entry at `index` is applied
    /// (§3 "Closure"). No-op if this node never sees the entry committed, in which
    /// case the closure is silently dropped when the queue itself is dropped.
    pub fn register_closure(&self, index: u64, closure: Box<dyn KvClosure>) {
        self.closure_queue.push(index, closure);
    }

    pub fn add_index_listener(&self, listener: Arc<dyn IndexListener>) {
        self.listeners
            .write()
            .expect("index listener list poisoned")
            .push(listener);
    }

    /// Registers a listener notified once when the state machine latches, so the
    /// external Raft node can stop accepting writes (§4.1 "Failure model").
    pub fn add_error_listener(&self, listener: Arc<dyn ErrorListener>) {
        self.error_listeners
            .write()
            .expect("error listener list poisoned")
            .push(listener);
    }

    /// Enqueues a new committed index (§4.1). Consecutive `Committed` events sitting in
    /// the channel are collapsed into one `doCommitted(max)` call by the consumer loop.
    pub fn notify_committed(&self, index: u64) {
        let _ = self.sender.send(DriverEvent::Committed(index));
    }

    pub fn last_applied_index(&self) -> u64 {
        self.last_applied_index.load(Ordering::Acquire)
    }

    pub fn last_applied_term(&self) -> u64 {
        self.last_applied_term.load(Ordering::Acquire)
    }

    pub fn is_latched(&self) -> bool {
        self.error_latch.load(Ordering::Acquire)
    }

    pub fn snapshot_save(
        &self,
        writer: Box<dyn SnapshotWriter>,
    ) -> Result<LocalFileMeta, FsmError> {
        let (respond, rx) = mpsc::channel();
        self.sender
            .send(DriverEvent::SnapshotSave { writer, respond })
            .map_err(|_| FsmError::LatchedStateMachineError)?;
        rx.recv().map_err(|_| FsmError::LatchedStateMachineError)?
    }

    pub fn snapshot_load(
        &self,
        reader: Box<dyn SnapshotReader>,
        meta: LocalFileMeta,
        snapshot_meta: SnapshotMetadata,
    ) -> Result<bool, FsmError> {
        let (respond, rx) = mpsc::channel();
        self.sender
            .send(DriverEvent::SnapshotLoad {
                reader,
                meta,
                snapshot_meta,
                respond,
            })
            .map_err(|_| FsmError::LatchedStateMachineError)?;
        rx.recv().map_err(|_| FsmError::LatchedStateMachineError)?
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(DriverEvent::Shutdown);
        if let Some(handle) = self.handle.lock().expect("driver handle poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FsmDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Consumer {
    fn run(self) {
        let mut pending: Option<DriverEvent> = None;
        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => match self.receiver.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };

            match event {
                DriverEvent::Shutdown => break,
                DriverEvent::Committed(first) => {
                    let mut highest = first;
                    loop {
                        match self.receiver.try_recv() {
                            Ok(DriverEvent::Committed(n)) => {
                                if n > highest {
                                    highest = n;
                                }
                            }
                            Ok(other) => {
                                pending = Some(other);
                                break;
                            }
                            Err(_) => break,
                        }
                    }
                    if let Err(err) = self.do_committed(highest) {
                        tracing::error!(error = %err, "fsm apply failed, latching state machine");
                        self.error_latch.store(true, Ordering::Release);
                        let status = Status::from(&err);
                        self.closure_queue.fail_all(status.clone());
                        for listener in self
                            .error_listeners
                            .read()
                            .expect("error listener list poisoned")
                            .iter()
                        {
                            listener.on_latched(status.clone());
                        }
                    }
                }
                DriverEvent::SnapshotSave { writer, respond } => {
                    let result = self.do_snapshot_save(writer.as_ref());
                    let _ = respond.send(result);
                }
                DriverEvent::SnapshotLoad {
                    reader,
                    meta,
                    snapshot_meta,
                    respond,
                } => {
                    let result = self.do_snapshot_load(reader.as_ref(), &meta, &snapshot_meta);
                    let _ = respond.send(result);
                }
            }
        }
    }

    /// Implements §4.1's seven-step `doCommitted(N)`.
    fn do_committed(&self, n: u64) -> Result<(), FsmError> {
        if self.error_latch.load(Ordering::Acquire) {
            return Err(FsmError::LatchedStateMachineError);
        }

        let last_applied = self.last_applied_index.load(Ordering::Acquire);
        if n <= last_applied {
            return Ok(());
        }

        let drained = self.closure_queue.drain_through(last_applied, n);
        for (_, closure) in &drained {
            closure.on_committed();
        }
        let mut closures_by_index: HashMap<u64, Box<dyn KvClosure>> = drained.into_iter().collect();

        let mut highest_applied = last_applied;
        let mut highest_term = self.last_applied_term.load(Ordering::Acquire);

        let loop_result = self.run_committed_loop(
            last_applied,
            n,
            &mut closures_by_index,
            &mut highest_applied,
            &mut highest_term,
        );

        if let Err(err) = loop_result {
            // Anything still sitting in `closures_by_index` belongs to an entry that was
            // never reached, or reached but not completed, before the error — each must
            // still be completed exactly once (§3), with a failure status, not dropped.
            let status = Status::from(&err);
            for (_, closure) in closures_by_index.drain() {
                closure.complete(ClosureOutcome::Failure(status.clone()));
            }
            return Err(err);
        }

        self.last_applied_index.store(highest_applied, Ordering::Release);
        self.last_applied_term.store(highest_term, Ordering::Release);

        for listener in self.listeners.read().expect("index listener list poisoned").iter() {
            listener.on_index_advanced(highest_applied);
        }

        Ok(())
    }

    fn run_committed_loop(
        &self,
        after_exclusive: u64,
        upto_inclusive: u64,
        closures_by_index: &mut HashMap<u64, Box<dyn KvClosure>>,
        highest_applied: &mut u64,
        highest_term: &mut u64,
    ) -> Result<(), FsmError> {
        let inner = self.log_source.cursor(after_exclusive, upto_inclusive);
        let mut cursor = ClosureAttachingCursor {
            inner,
            closures: closures_by_index,
        };

        loop {
            let preview = match cursor.peek()? {
                Some(preview) => preview,
                None => break,
            };

            match preview.entry_type {
                EntryType::NoOp => {
                    let entry = cursor.pop()?;
                    *highest_applied = entry.index;
                    *highest_term = entry.term;
                    if let Some(closure) = entry.closure {
                        closure.complete(ClosureOutcome::Success(ResponsePayload::Unit));
                    }
                }
                EntryType::Configuration => {
                    let entry = cursor.pop()?;
                    *highest_applied = entry.index;
                    *highest_term = entry.term;
                    if let Some(config) = &entry.configuration {
                        self.state_machine.on_configuration_committed(config);
                    }
                    if let Some(closure) = entry.closure {
                        closure.complete(ClosureOutcome::Success(ResponsePayload::Unit));
                    }
                }
                EntryType::Data => {
                    self.state_machine.on_apply(&mut cursor, &self.metrics)?;
                    if let Some(applied) = cursor.last_popped_index() {
                        *highest_applied = applied;
                    }
                    if cursor.has_error() {
                        return Err(FsmError::LatchedStateMachineError);
                    }
                }
            }
        }

        Ok(())
    }

    fn do_snapshot_save(&self, writer: &dyn SnapshotWriter) -> Result<LocalFileMeta, FsmError> {
        self.state_machine.on_snapshot_save(writer)
    }

    fn do_snapshot_load(
        &self,
        reader: &dyn SnapshotReader,
        meta: &LocalFileMeta,
        snapshot_meta: &SnapshotMetadata,
    ) -> Result<bool, FsmError> {
        let current_index = self.last_applied_index.load(Ordering::Acquire);
        let current_term = self.last_applied_term.load(Ordering::Acquire);
        if !snapshot_meta.is_newer_than(current_index, current_term) {
            return Err(FsmError::Engine(crate::errors::EngineError::StaleSnapshot {
                current_index,
                current_term,
                snapshot_index: snapshot_meta.last_included_index,
                snapshot_term: snapshot_meta.last_included_term,
            }));
        }

        let loaded = self.state_machine.on_snapshot_load(reader, meta, snapshot_meta)?;
        if loaded {
            self.last_applied_index
                .store(snapshot_meta.last_included_index, Ordering::Release);
            self.last_applied_term
                .store(snapshot_meta.last_included_term, Ordering::Release);
        }
        Ok(loaded)
    }
}
