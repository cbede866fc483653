mod lock;
mod sequence;
mod snapshot;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};

use crate::config::RheaConfig;
use crate::errors::EngineError;
use crate::types::{LockRequest, LockResponse, SequenceRange};

pub(crate) const CF_DEFAULT: &str = "default";
pub(crate) const CF_SEQUENCE: &str = "RHEA_SEQUENCE";
pub(crate) const CF_LOCKING: &str = "RHEA_LOCKING";
pub(crate) const CF_FENCING: &str = "RHEA_FENCING";

/// Column-family-backed KV engine adapter (§4.3), grounded on the teacher's
/// `RocksLogStore`/`StateMachineStore` (`replication/src/storage/mod.rs`): a thin
/// wrapper around `rocksdb::DB` opened with a fixed set of column families, each
/// scoped to one concern (plain KV, sequence counters, lock ownership, fencing).
pub struct KvEngine {
    inner: RwLock<EngineInner>,
    pub(crate) config: RheaConfig,
    version: AtomicU64,
}

struct EngineInner {
    db: DB,
}

/// Options applied to every merge-operator column family (`RHEA_SEQUENCE` excluded,
/// since sequence allocation is implemented as read-modify-write, not a merge op).
fn default_cf_options() -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts
}

impl KvEngine {
    pub fn open(config: &RheaConfig) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let mut default_opts = default_cf_options();
        default_opts.set_merge_operator_associative(
            "rhea_string_append",
            merge_string_append,
        );

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_DEFAULT, default_opts),
            ColumnFamilyDescriptor::new(CF_SEQUENCE, default_cf_options()),
            ColumnFamilyDescriptor::new(CF_LOCKING, default_cf_options()),
            ColumnFamilyDescriptor::new(CF_FENCING, default_cf_options()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, &config.data_dir, cfs)?;

        Ok(KvEngine {
            inner: RwLock::new(EngineInner { db }),
            config: config.clone(),
            version: AtomicU64::new(0),
        })
    }

    /// Bumped on every snapshot save/load so callers can detect the underlying
    /// RocksDB handle was swapped out from under them (§4.3 "Snapshot").
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    fn cf_default<'a>(&self, db: &'a DB) -> &'a rocksdb::ColumnFamily {
        db.cf_handle(CF_DEFAULT).expect("default column family always exists")
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let inner = self.inner.read().expect("engine lock poisoned");
        let cf = self.cf_default(&inner.db);
        Ok(inner.db.get_cf(cf, key)?)
    }

    pub fn multi_get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, EngineError> {
        let inner = self.inner.read().expect("engine lock poisoned");
        let cf = self.cf_default(&inner.db);
        let cf_keys: Vec<(&rocksdb::ColumnFamily, &[u8])> =
            keys.iter().map(|k| (cf, k.as_slice())).collect();
        inner
            .db
            .multi_get_cf(cf_keys)
            .into_iter()
            .map(|r| r.map_err(EngineError::from))
            .collect()
    }

    pub fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: Option<u32>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        let inner = self.inner.read().expect("engine lock poisoned");
        let cf = self.cf_default(&inner.db);
        let mode = rocksdb::IteratorMode::From(start, rocksdb::Direction::Forward);
        let mut out = Vec::new();
        for item in inner.db.iterator_cf(cf, mode) {
            let (key, value) = item?;
            if key.as_ref() >= end {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
            if let Some(limit) = limit {
                if out.len() as u32 >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Jumps the iterator forward by `stride` keys at a time instead of stepping one
    /// at a time, so large ranges cost `range_size / stride` seeks (§4.3 "approximate
    /// count / jumpOver"). The count is exact per sampled key but the last partial
    /// stride is extrapolated, so the result is approximate at the tail.
    pub fn approximate_count(&self, start: &[u8], end: &[u8]) -> Result<u64, EngineError> {
        let inner = self.inner.read().expect("engine lock poisoned");
        let cf = self.cf_default(&inner.db);
        let stride = self.config.approximate_count_stride.max(1);
        let mut cursor = start.to_vec();
        let mut strides_completed = 0u64;
        loop {
            let mode = rocksdb::IteratorMode::From(&cursor, rocksdb::Direction::Forward);
            let mut iter = inner.db.iterator_cf(cf, mode).peekable();
            let mut advanced = 0u64;
            let mut last_key: Option<Vec<u8>> = None;
            while advanced < stride {
                match iter.next() {
                    Some(Ok((key, _))) => {
                        if key.as_ref() >= end {
                            let remainder = strides_completed * stride + advanced;
                            return Ok(remainder);
                        }
                        last_key = Some(key.to_vec());
                        advanced += 1;
                    }
                    Some(Err(err)) => return Err(EngineError::from(err)),
                    None => {
                        let remainder = strides_completed * stride + advanced;
                        return Ok(remainder);
                    }
                }
            }
            strides_completed += 1;
            // advance just past the last key seen this stride
            let mut next_cursor = last_key.expect("stride always observes at least one key");
            next_cursor.push(0);
            cursor = next_cursor;
        }
    }

    /// Writes `entries` in chunks of `max_batch_write_size`. A chunk write failure
    /// fails every item in that chunk and every item in chunks after it, without
    /// attempting them (§4.3 "Batch sizing" partial-failure semantics).
    pub fn batch_put(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<Result<(), EngineError>> {
        self.chunked_write(entries, |batch, cf, key, value| {
            batch.put_cf(cf, key, value);
        })
    }

    pub fn batch_delete(&self, keys: &[Vec<u8>]) -> Vec<Result<(), EngineError>> {
        let inner = self.inner.read().expect("engine lock poisoned");
        let cf = self.cf_default(&inner.db);
        let mut results = Vec::with_capacity(keys.len());
        let mut aborted = false;
        for chunk in keys.chunks(self.config.max_batch_write_size.max(1)) {
            if aborted {
                results.extend(chunk.iter().map(|_| {
                    Err(EngineError::Storage("not attempted: prior chunk failed".into()))
                }));
                continue;
            }
            let mut batch = rocksdb::WriteBatch::default();
            for key in chunk {
                batch.delete_cf(cf, key);
            }
            match inner.db.write(batch) {
                Ok(()) => results.extend(chunk.iter().map(|_| Ok(()))),
                Err(err) => {
                    let msg = err.to_string();
                    results.extend(chunk.iter().map(|_| Err(EngineError::Storage(msg.clone()))));
                    aborted = true;
                }
            }
        }
        results
    }

    pub fn batch_delete_range(
        &self,
        ranges: &[(Vec<u8>, Vec<u8>)],
    ) -> Vec<Result<(), EngineError>> {
        let inner = self.inner.read().expect("engine lock poisoned");
        let cf = self.cf_default(&inner.db);
        let mut results = Vec::with_capacity(ranges.len());
        let mut aborted = false;
        for chunk in ranges.chunks(self.config.max_batch_write_size.max(1)) {
            if aborted {
                results.extend(chunk.iter().map(|_| {
                    Err(EngineError::Storage("not attempted: prior chunk failed".into()))
                }));
                continue;
            }
            let mut batch = rocksdb::WriteBatch::default();
            for (start, end) in chunk {
                batch.delete_range_cf(cf, start, end);
            }
            match inner.db.write(batch) {
                Ok(()) => results.extend(chunk.iter().map(|_| Ok(()))),
                Err(err) => {
                    let msg = err.to_string();
                    results.extend(chunk.iter().map(|_| Err(EngineError::Storage(msg.clone()))));
                    aborted = true;
                }
            }
        }
        results
    }

    pub fn batch_merge(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<Result<(), EngineError>> {
        self.chunked_write(entries, |batch, cf, key, value| {
            batch.merge_cf(cf, key, value);
        })
    }

    /// Each item both reads the previous value and writes the new one, but within the
    /// same chunked write batch as `batch_put` so chunk-level partial failure still
    /// applies; the old-value read happens before the batch commits.
    pub fn batch_get_and_put(
        &self,
        entries: &[(Vec<u8>, Vec<u8>)],
    ) -> Vec<Result<Option<Vec<u8>>, EngineError>> {
        let inner = self.inner.read().expect("engine lock poisoned");
        let cf = self.cf_default(&inner.db);
        let mut results = Vec::with_capacity(entries.len());
        let mut aborted = false;
        for chunk in entries.chunks(self.config.max_batch_write_size.max(1)) {
            if aborted {
                results.extend(chunk.iter().map(|_| {
                    Err(EngineError::Storage("not attempted: prior chunk failed".into()))
                }));
                continue;
            }
            let old_values: Result<Vec<Option<Vec<u8>>>, EngineError> = chunk
                .iter()
                .map(|(key, _)| Ok(inner.db.get_cf(cf, key)?))
                .collect();
            let old_values = match old_values {
                Ok(v) => v,
                Err(err) => {
                    results.extend(chunk.iter().map(|_| Err(err.clone())));
                    aborted = true;
                    continue;
                }
            };
            let mut batch = rocksdb::WriteBatch::default();
            for (key, value) in chunk {
                batch.put_cf(cf, key, value);
            }
            match inner.db.write(batch) {
                Ok(()) => results.extend(old_values.into_iter().map(Ok)),
                Err(err) => {
                    let msg = err.to_string();
                    results.extend(chunk.iter().map(|_| Err(EngineError::Storage(msg.clone()))));
                    aborted = true;
                }
            }
        }
        results
    }

    pub fn batch_put_if_absent(
        &self,
        entries: &[(Vec<u8>, Vec<u8>)],
    ) -> Vec<Result<bool, EngineError>> {
        let inner = self.inner.read().expect("engine lock poisoned");
        let cf = self.cf_default(&inner.db);
        let mut results = Vec::with_capacity(entries.len());
        let mut aborted = false;
        for chunk in entries.chunks(self.config.max_batch_write_size.max(1)) {
            if aborted {
                results.extend(chunk.iter().map(|_| {
                    Err(EngineError::Storage("not attempted: prior chunk failed".into()))
                }));
                continue;
            }
            let mut batch = rocksdb::WriteBatch::default();
            let mut inserted_flags = Vec::with_capacity(chunk.len());
            for (key, value) in chunk {
                match inner.db.get_cf(cf, key) {
                    Ok(Some(_)) => inserted_flags.push(false),
                    Ok(None) => {
                        batch.put_cf(cf, key, value);
                        inserted_flags.push(true);
                    }
                    Err(err) => {
                        results.extend(chunk.iter().map(|_| Err(EngineError::from(err.clone()))));
                        aborted = true;
                        break;
                    }
                }
            }
            if aborted {
                continue;
            }
            match inner.db.write(batch) {
                Ok(()) => results.extend(inserted_flags.into_iter().map(Ok)),
                Err(err) => {
                    let msg = err.to_string();
                    results.extend(chunk.iter().map(|_| Err(EngineError::Storage(msg.clone()))));
                    aborted = true;
                }
            }
        }
        results
    }

    fn chunked_write<F>(&self, entries: &[(Vec<u8>, Vec<u8>)], write_one: F) -> Vec<Result<(), EngineError>>
    where
        F: Fn(&mut rocksdb::WriteBatch, &rocksdb::ColumnFamily, &[u8], &[u8]),
    {
        let inner = self.inner.read().expect("engine lock poisoned");
        let cf = self.cf_default(&inner.db);
        let mut results = Vec::with_capacity(entries.len());
        let mut aborted = false;
        for chunk in entries.chunks(self.config.max_batch_write_size.max(1)) {
            if aborted {
                results.extend(chunk.iter().map(|_| {
                    Err(EngineError::Storage("not attempted: prior chunk failed".into()))
                }));
                continue;
            }
            let mut batch = rocksdb::WriteBatch::default();
            for (key, value) in chunk {
                write_one(&mut batch, cf, key, value);
            }
            match inner.db.write(batch) {
                Ok(()) => results.extend(chunk.iter().map(|_| Ok(()))),
                Err(err) => {
                    let msg = err.to_string();
                    results.extend(chunk.iter().map(|_| Err(EngineError::Storage(msg.clone()))));
                    aborted = true;
                }
            }
        }
        results
    }

    pub fn batch_get_sequence(
        &self,
        requests: &[(Vec<u8>, u64)],
    ) -> Vec<Result<SequenceRange, EngineError>> {
        let inner = self.inner.read().expect("engine lock poisoned");
        sequence::batch_get_sequence(&inner.db, &self.config, requests)
    }

    pub fn reset_sequence(&self, key: &[u8]) -> Result<(), EngineError> {
        let inner = self.inner.read().expect("engine lock poisoned");
        sequence::reset_sequence(&inner.db, key)
    }

    pub fn key_lock(&self, key: &[u8], request: &LockRequest) -> Result<LockResponse, EngineError> {
        let inner = self.inner.read().expect("engine lock poisoned");
        lock::key_lock(&inner.db, key, request)
    }

    pub fn key_lock_release(
        &self,
        key: &[u8],
        acquirer_id: &str,
        now_ms: i64,
    ) -> Result<crate::types::LockReleaseOutcome, EngineError> {
        let inner = self.inner.read().expect("engine lock poisoned");
        lock::key_lock_release(&inner.db, key, acquirer_id, now_ms)
    }

    pub fn snapshot_save(&self, dir: &Path) -> Result<crate::snapshot::LocalFileMeta, EngineError> {
        let inner = self.inner.read().expect("engine lock poisoned");
        let meta = snapshot::save(&inner.db, dir, self.config.snapshot_mode)?;
        self.bump_version();
        Ok(meta)
    }

    pub fn snapshot_load(&self, dir: &Path) -> Result<(), EngineError> {
        let mut inner = self.inner.write().expect("engine lock poisoned");
        let new_db = snapshot::load(dir, &self.config)?;
        inner.db = new_db;
        drop(inner);
        self.bump_version();
        Ok(())
    }
}

fn merge_string_append(
    _key: &[u8],
    existing: Option<&[u8]>,
    operands: &rocksdb::MergeOperands,
) -> Option<Vec<u8>> {
    let mut result = existing.map(|v| v.to_vec()).unwrap_or_default();
    for op in operands {
        result.extend_from_slice(op);
    }
    Some(result)
}
