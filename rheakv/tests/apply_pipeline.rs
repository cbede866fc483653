mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use common::MemoryLogSource;
use rheakv::snapshot::{FsSnapshotReader, FsSnapshotWriter, SnapshotMetadata};
use rheakv::{
    ApplyMetrics, ClosureOutcome, ErrorListener, FsmDriver, KvClosure, KvEngine, KvStateMachine,
    LockAcquireOutcome, LockRequest, Operation, RheaConfig, ResponsePayload, SnapshotMode, Status,
};

struct RecordingClosure {
    tx: mpsc::Sender<ClosureOutcome>,
}

impl KvClosure for RecordingClosure {
    fn complete(self: Box<Self>, outcome: ClosureOutcome) {
        let _ = self.tx.send(outcome);
    }
}

fn recv_outcome(rx: &mpsc::Receiver<ClosureOutcome>) -> ClosureOutcome {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("closure did not complete within timeout")
}

fn new_driver(data_dir: &std::path::Path) -> (Arc<FsmDriver>, Arc<MemoryLogSource>, Arc<KvEngine>) {
    let config = RheaConfig::new(data_dir);
    let engine = Arc::new(KvEngine::open(&config).unwrap());
    let state_machine = Arc::new(KvStateMachine::new(engine.clone()));
    let log_source = Arc::new(MemoryLogSource::new());
    let driver = Arc::new(FsmDriver::new(
        log_source.clone(),
        state_machine,
        Arc::new(ApplyMetrics::new()),
        &config,
    ));
    (driver, log_source, engine)
}

fn submit(
    driver: &FsmDriver,
    log_source: &MemoryLogSource,
    index: u64,
    term: u64,
    operation: Operation,
) -> mpsc::Receiver<ClosureOutcome> {
    let (tx, rx) = mpsc::channel();
    log_source.append_data(index, term, &operation);
    driver.register_closure(index, Box::new(RecordingClosure { tx }));
    driver.notify_committed(index);
    rx
}

#[test]
fn put_then_delete_sequence_applies_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, log_source, engine) = new_driver(dir.path());

    let put_rx = submit(
        &driver,
        &log_source,
        1,
        1,
        Operation::Put {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        },
    );
    assert!(matches!(
        recv_outcome(&put_rx),
        ClosureOutcome::Success(ResponsePayload::Unit)
    ));
    assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));

    let delete_rx = submit(&driver, &log_source, 2, 1, Operation::Delete { key: b"k".to_vec() });
    assert!(matches!(
        recv_outcome(&delete_rx),
        ClosureOutcome::Success(ResponsePayload::Unit)
    ));
    assert_eq!(engine.get(b"k").unwrap(), None);
    assert_eq!(driver.last_applied_index(), 2);
}

#[test]
fn reentrant_lock_acquire_keeps_fencing_token() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, log_source, _engine) = new_driver(dir.path());

    let request = LockRequest {
        acquirer_id: "node-a".to_string(),
        lease_ms: 10_000,
        now_ms: 0,
        keep_lease: false,
        context: Vec::new(),
    };
    let first_rx = submit(
        &driver,
        &log_source,
        1,
        1,
        Operation::KeyLock {
            key: b"lock".to_vec(),
            request: request.clone(),
        },
    );
    let first = match recv_outcome(&first_rx) {
        ClosureOutcome::Success(ResponsePayload::Lock(resp)) => resp,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(first.outcome, LockAcquireOutcome::FirstTimeSuccess);

    let mut second_request = request;
    second_request.now_ms = 100;
    let second_rx = submit(
        &driver,
        &log_source,
        2,
        1,
        Operation::KeyLock {
            key: b"lock".to_vec(),
            request: second_request,
        },
    );
    let second = match recv_outcome(&second_rx) {
        ClosureOutcome::Success(ResponsePayload::Lock(resp)) => resp,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(second.outcome, LockAcquireOutcome::ReentrantSuccess);
    assert_eq!(second.fencing_token, first.fencing_token);
    assert_eq!(second.acquires, 2);
}

#[test]
fn preemption_after_lease_expiry_mints_new_fencing_token() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, log_source, _engine) = new_driver(dir.path());

    let holder_rx = submit(
        &driver,
        &log_source,
        1,
        1,
        Operation::KeyLock {
            key: b"lock".to_vec(),
            request: LockRequest {
                acquirer_id: "node-a".to_string(),
                lease_ms: 1_000,
                now_ms: 0,
                keep_lease: false,
                context: Vec::new(),
            },
        },
    );
    let holder = match recv_outcome(&holder_rx) {
        ClosureOutcome::Success(ResponsePayload::Lock(resp)) => resp,
        other => panic!("unexpected outcome: {other:?}"),
    };

    let preempt_rx = submit(
        &driver,
        &log_source,
        2,
        1,
        Operation::KeyLock {
            key: b"lock".to_vec(),
            request: LockRequest {
                acquirer_id: "node-b".to_string(),
                lease_ms: 1_000,
                now_ms: 5_000,
                keep_lease: false,
                context: Vec::new(),
            },
        },
    );
    let preempt = match recv_outcome(&preempt_rx) {
        ClosureOutcome::Success(ResponsePayload::Lock(resp)) => resp,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(preempt.outcome, LockAcquireOutcome::NewAcquireSuccess);
    assert_ne!(preempt.fencing_token, holder.fencing_token);
}

#[test]
fn sequence_reset_restarts_allocation_from_zero() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, log_source, _engine) = new_driver(dir.path());

    let first_rx = submit(
        &driver,
        &log_source,
        1,
        1,
        Operation::GetSequence {
            key: b"seq".to_vec(),
            step: 5,
        },
    );
    match recv_outcome(&first_rx) {
        ClosureOutcome::Success(ResponsePayload::Sequence { start, end }) => {
            assert_eq!((start, end), (0, 5));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let reset_rx = submit(&driver, &log_source, 2, 1, Operation::ResetSequence { key: b"seq".to_vec() });
    assert!(matches!(
        recv_outcome(&reset_rx),
        ClosureOutcome::Success(ResponsePayload::Unit)
    ));

    let after_reset_rx = submit(
        &driver,
        &log_source,
        3,
        1,
        Operation::GetSequence {
            key: b"seq".to_vec(),
            step: 1,
        },
    );
    match recv_outcome(&after_reset_rx) {
        ClosureOutcome::Success(ResponsePayload::Sequence { start, end }) => {
            assert_eq!((start, end), (0, 1));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn snapshot_round_trips_into_a_fresh_driver_and_rejects_stale_loads() {
    let source_dir = tempfile::tempdir().unwrap();
    let (source_driver, source_log, source_engine) = new_driver(source_dir.path());

    let put_rx = submit(
        &source_driver,
        &source_log,
        1,
        1,
        Operation::Put {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        },
    );
    recv_outcome(&put_rx);
    assert_eq!(source_engine.get(b"k").unwrap(), Some(b"v".to_vec()));

    let snapshot_dir = tempfile::tempdir().unwrap();
    let writer = Box::new(FsSnapshotWriter::new(snapshot_dir.path()));
    source_driver.snapshot_save(writer).unwrap();
    let snapshot_meta = SnapshotMetadata {
        last_included_index: source_driver.last_applied_index(),
        last_included_term: source_driver.last_applied_term(),
        peers: Vec::new(),
        old_peers: Vec::new(),
    };

    let target_dir = tempfile::tempdir().unwrap();
    let (target_driver, _target_log, target_engine) = new_driver(target_dir.path());
    let reader = Box::new(FsSnapshotReader::new(snapshot_dir.path()));
    let loaded = target_driver
        .snapshot_load(
            reader,
            rheakv::snapshot::LocalFileMeta::default(),
            snapshot_meta.clone(),
        )
        .unwrap();
    assert!(loaded);
    assert_eq!(target_engine.get(b"k").unwrap(), Some(b"v".to_vec()));
    assert_eq!(target_driver.last_applied_index(), 1);

    // A snapshot no newer than what's already applied must be rejected.
    let stale_reader = Box::new(FsSnapshotReader::new(snapshot_dir.path()));
    let stale_meta = SnapshotMetadata {
        last_included_index: 1,
        last_included_term: 1,
        peers: Vec::new(),
        old_peers: Vec::new(),
    };
    let result = target_driver.snapshot_load(stale_reader, rheakv::snapshot::LocalFileMeta::default(), stale_meta);
    assert!(result.is_err());
}

#[test]
fn concurrent_producers_preserve_total_ordering_of_applied_entries() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, log_source, engine) = new_driver(dir.path());

    const TOTAL: u64 = 1_000;
    let next_index = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();

    for _ in 0..8 {
        let driver = driver.clone();
        let log_source = log_source.clone();
        let next_index = next_index.clone();
        handles.push(std::thread::spawn(move || {
            loop {
                let index = next_index.fetch_add(1, Ordering::SeqCst) + 1;
                if index > TOTAL {
                    break;
                }
                let (tx, rx) = mpsc::channel();
                log_source.append_data(
                    index,
                    1,
                    &Operation::Put {
                        key: index.to_be_bytes().to_vec(),
                        value: index.to_be_bytes().to_vec(),
                    },
                );
                driver.register_closure(index, Box::new(RecordingClosure { tx }));
                driver.notify_committed(index);
                recv_outcome(&rx);
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(driver.last_applied_index(), TOTAL);
    for index in 1..=TOTAL {
        assert_eq!(
            engine.get(&index.to_be_bytes()).unwrap(),
            Some(index.to_be_bytes().to_vec())
        );
    }
}

struct RecordingErrorListener {
    tx: mpsc::Sender<Status>,
}

impl ErrorListener for RecordingErrorListener {
    fn on_latched(&self, status: Status) {
        let _ = self.tx.send(status);
    }
}

#[test]
fn undecodable_entry_fails_its_own_closure_and_notifies_error_listener() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, log_source, _engine) = new_driver(dir.path());

    let (error_tx, error_rx) = mpsc::channel();
    driver.add_error_listener(Arc::new(RecordingErrorListener { tx: error_tx }));

    let first_rx = submit(
        &driver,
        &log_source,
        1,
        1,
        Operation::Put {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        },
    );
    assert!(matches!(
        recv_outcome(&first_rx),
        ClosureOutcome::Success(ResponsePayload::Unit)
    ));

    log_source.append_corrupt(2, 1);
    let (tx, corrupt_rx) = mpsc::channel();
    driver.register_closure(2, Box::new(RecordingClosure { tx }));
    driver.notify_committed(2);

    // The closure attached to the never-applied corrupt entry must still complete,
    // with a failure status, rather than hang forever.
    assert!(matches!(
        recv_outcome(&corrupt_rx),
        ClosureOutcome::Failure(_)
    ));
    assert!(!recv_outcome_status(&error_rx).message.is_empty());
    assert!(driver.is_latched());
}

fn recv_outcome_status(rx: &mpsc::Receiver<Status>) -> Status {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("error listener was not notified within timeout")
}
