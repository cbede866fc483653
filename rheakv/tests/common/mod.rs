use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::Mutex;

use rheakv::{Configuration, EntryCursor, EntryPreview, EntryType, FsmError, LogEntry, LogSource, Operation, OperationPayload};

struct StoredEntry {
    term: u64,
    entry_type: EntryType,
    payload: Option<Vec<u8>>,
    configuration: Option<Configuration>,
}

/// In-memory `LogSource`, grounded on the teacher's `MemLogStore`
/// (`replication/src/storage/mod.rs`): a `BTreeMap<u64, _>` standing in for a real
/// durable Raft log, enough to drive the apply pipeline end to end in tests.
#[derive(Default)]
pub struct MemoryLogSource {
    entries: Mutex<BTreeMap<u64, StoredEntry>>,
}

impl MemoryLogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_data(&self, index: u64, term: u64, operation: &Operation) {
        let bytes = operation.encode().expect("test operation always encodes");
        self.entries.lock().unwrap().insert(
            index,
            StoredEntry {
                term,
                entry_type: EntryType::Data,
                payload: Some(bytes),
                configuration: None,
            },
        );
    }

    /// Stores an undecodable payload at `index`, to exercise the apply-failure path.
    pub fn append_corrupt(&self, index: u64, term: u64) {
        self.entries.lock().unwrap().insert(
            index,
            StoredEntry {
                term,
                entry_type: EntryType::Data,
                payload: Some(vec![0xff, 0xff, 0xff]),
                configuration: None,
            },
        );
    }

    pub fn append_no_op(&self, index: u64, term: u64) {
        self.entries.lock().unwrap().insert(
            index,
            StoredEntry {
                term,
                entry_type: EntryType::NoOp,
                payload: None,
                configuration: None,
            },
        );
    }

    pub fn append_configuration(&self, index: u64, term: u64, configuration: Configuration) {
        self.entries.lock().unwrap().insert(
            index,
            StoredEntry {
                term,
                entry_type: EntryType::Configuration,
                payload: None,
                configuration: Some(configuration),
            },
        );
    }
}

impl LogSource for MemoryLogSource {
    fn cursor(&self, after_exclusive: u64, upto_inclusive: u64) -> Box<dyn EntryCursor + '_> {
        let entries = self.entries.lock().unwrap();
        let remaining: VecDeque<(u64, u64, EntryType, Option<Vec<u8>>, Option<Configuration>)> = entries
            .range((Bound::Excluded(after_exclusive), Bound::Included(upto_inclusive)))
            .map(|(index, e)| (*index, e.term, e.entry_type, e.payload.clone(), e.configuration.clone()))
            .collect();
        Box::new(MemoryCursor {
            remaining,
            cached_next: None,
            last_popped: None,
        })
    }
}

struct MemoryCursor {
    remaining: VecDeque<(u64, u64, EntryType, Option<Vec<u8>>, Option<Configuration>)>,
    cached_next: Option<Operation>,
    last_popped: Option<u64>,
}

impl EntryCursor for MemoryCursor {
    fn peek(&mut self) -> Result<Option<EntryPreview>, FsmError> {
        let Some((_, _, entry_type, payload, _)) = self.remaining.front() else {
            return Ok(None);
        };
        if *entry_type != EntryType::Data {
            return Ok(Some(EntryPreview {
                entry_type: *entry_type,
                op_kind: None,
            }));
        }
        if self.cached_next.is_none() {
            let bytes = payload.as_ref().expect("data entry always carries a payload");
            let operation = Operation::decode(bytes)?;
            self.cached_next = Some(operation);
        }
        let op_kind = self.cached_next.as_ref().map(|op| op.kind());
        Ok(Some(EntryPreview {
            entry_type: EntryType::Data,
            op_kind,
        }))
    }

    fn pop(&mut self) -> Result<LogEntry, FsmError> {
        let (index, term, entry_type, payload, configuration) =
            self.remaining.pop_front().expect("pop called without a preceding peek");
        let payload = if entry_type == EntryType::Data {
            match self.cached_next.take() {
                Some(operation) => Some(OperationPayload::Decoded(Box::new(operation))),
                None => Some(OperationPayload::Raw(
                    payload.expect("data entry always carries a payload"),
                )),
            }
        } else {
            None
        };
        self.last_popped = Some(index);
        Ok(LogEntry {
            index,
            term,
            entry_type,
            payload,
            closure: None,
            configuration,
        })
    }

    fn has_error(&self) -> bool {
        false
    }

    fn last_popped_index(&self) -> Option<u64> {
        self.last_popped
    }
}
