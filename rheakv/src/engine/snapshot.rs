use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use rocksdb::backup::{BackupEngine, BackupEngineOptions, RestoreOptions};
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{Deserialize, Serialize};
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use super::{CF_DEFAULT, CF_FENCING, CF_LOCKING, CF_SEQUENCE};
use crate::config::{RheaConfig, SnapshotMode};
use crate::errors::EngineError;
use crate::snapshot::LocalFileMeta;

/// Carried as `LocalFileMeta::user_meta` in backup mode only; fast-mode snapshots have
/// no metadata blob (§6, §9 design note).
#[derive(Serialize, Deserialize)]
struct BackupDescriptor {
    backup_id: u32,
}

fn io_err(e: std::io::Error) -> EngineError {
    EngineError::SnapshotIo(e.to_string())
}

fn cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_DEFAULT, Options::default()),
        ColumnFamilyDescriptor::new(CF_SEQUENCE, Options::default()),
        ColumnFamilyDescriptor::new(CF_LOCKING, Options::default()),
        ColumnFamilyDescriptor::new(CF_FENCING, Options::default()),
    ]
}

/// Persists the engine's current state under `dir` (§4.3 "Snapshot"). Fast mode
/// writes an LSM checkpoint (hard-linked SSTs, no archive); backup mode goes through
/// RocksDB's backup engine and zips the result for transfer to another node.
pub(super) fn save(db: &DB, dir: &Path, mode: SnapshotMode) -> Result<LocalFileMeta, EngineError> {
    std::fs::create_dir_all(dir).map_err(io_err)?;
    match mode {
        SnapshotMode::Fast => {
            let kv_dir = dir.join("kv");
            if kv_dir.exists() {
                std::fs::remove_dir_all(&kv_dir).map_err(io_err)?;
            }
            let checkpoint = Checkpoint::new(db)?;
            checkpoint.create_checkpoint(&kv_dir)?;
            Ok(LocalFileMeta { user_meta: None })
        }
        SnapshotMode::Backup => {
            let backup_dir = dir.join("backup_engine");
            std::fs::create_dir_all(&backup_dir).map_err(io_err)?;
            let opts = BackupEngineOptions::new(&backup_dir)?;
            let env = rocksdb::Env::new()?;
            let mut backup_engine = BackupEngine::open(&opts, &env)?;
            backup_engine.create_new_backup(db)?;

            let backup_id = backup_engine
                .get_backup_info()
                .into_iter()
                .map(|info| info.backup_id)
                .max()
                .ok_or_else(|| EngineError::SnapshotIo("backup engine produced no backup".into()))?;

            let zip_path = dir.join("kv.zip");
            zip_directory(&backup_dir, &zip_path)?;
            std::fs::remove_dir_all(&backup_dir).map_err(io_err)?;

            let user_meta = bincode::serialize(&BackupDescriptor { backup_id })
                .map_err(|e| EngineError::SnapshotIo(e.to_string()))?;
            Ok(LocalFileMeta { user_meta: Some(user_meta) })
        }
    }
}

/// Restores `dir` into `config.data_dir` and opens it as a fresh `DB`, replacing the
/// caller's current handle (§4.3). The presence of `kv.zip` vs. a bare `kv/` directory
/// disambiguates which mode produced the snapshot (§9): the two are not interchangeable.
pub(super) fn load(dir: &Path, config: &RheaConfig) -> Result<DB, EngineError> {
    if dir.join("kv.zip").exists() {
        load_backup(dir, config)
    } else if dir.join("kv").exists() {
        load_fast(dir, config)
    } else {
        Err(EngineError::SnapshotIo(format!(
            "no snapshot found under {}",
            dir.display()
        )))
    }
}

fn open_with_cfs(path: &Path) -> Result<DB, EngineError> {
    let mut db_opts = Options::default();
    db_opts.create_if_missing(true);
    db_opts.create_missing_column_families(true);
    Ok(DB::open_cf_descriptors(&db_opts, path, cf_descriptors())?)
}

fn load_fast(dir: &Path, config: &RheaConfig) -> Result<DB, EngineError> {
    let kv_dir = dir.join("kv");
    if config.data_dir.exists() {
        std::fs::remove_dir_all(&config.data_dir).map_err(io_err)?;
    }
    copy_dir_recursive(&kv_dir, &config.data_dir).map_err(io_err)?;
    open_with_cfs(&config.data_dir)
}

fn load_backup(dir: &Path, config: &RheaConfig) -> Result<DB, EngineError> {
    let backup_dir = dir.join("backup_engine_restore");
    if backup_dir.exists() {
        std::fs::remove_dir_all(&backup_dir).map_err(io_err)?;
    }
    unzip_directory(&dir.join("kv.zip"), &backup_dir)?;

    let opts = BackupEngineOptions::new(&backup_dir)?;
    let env = rocksdb::Env::new()?;
    let mut backup_engine = BackupEngine::open(&opts, &env)?;

    if config.data_dir.exists() {
        std::fs::remove_dir_all(&config.data_dir).map_err(io_err)?;
    }
    backup_engine.restore_from_latest_backup(
        &config.data_dir,
        &config.data_dir,
        &RestoreOptions::default(),
    )?;
    std::fs::remove_dir_all(&backup_dir).map_err(io_err)?;

    open_with_cfs(&config.data_dir)
}

fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

fn zip_directory(src_dir: &Path, zip_path: &Path) -> Result<(), EngineError> {
    let file = File::create(zip_path).map_err(io_err)?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    add_dir_to_zip(&mut writer, src_dir, src_dir, options)?;
    writer.finish().map_err(|e| EngineError::SnapshotIo(e.to_string()))?;
    Ok(())
}

fn add_dir_to_zip(
    writer: &mut ZipWriter<File>,
    base: &Path,
    dir: &Path,
    options: FileOptions,
) -> Result<(), EngineError> {
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        let relative = path
            .strip_prefix(base)
            .expect("entry path is always under base")
            .to_string_lossy()
            .into_owned();
        if entry.file_type().map_err(io_err)?.is_dir() {
            writer
                .add_directory(format!("{relative}/"), options)
                .map_err(|e| EngineError::SnapshotIo(e.to_string()))?;
            add_dir_to_zip(writer, base, &path, options)?;
        } else {
            writer
                .start_file(relative, options)
                .map_err(|e| EngineError::SnapshotIo(e.to_string()))?;
            let mut contents = Vec::new();
            File::open(&path).map_err(io_err)?.read_to_end(&mut contents).map_err(io_err)?;
            writer.write_all(&contents).map_err(io_err)?;
        }
    }
    Ok(())
}

fn unzip_directory(zip_path: &Path, dest_dir: &Path) -> Result<(), EngineError> {
    std::fs::create_dir_all(dest_dir).map_err(io_err)?;
    let file = File::open(zip_path).map_err(io_err)?;
    let mut archive = ZipArchive::new(file).map_err(|e| EngineError::SnapshotIo(e.to_string()))?;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| EngineError::SnapshotIo(e.to_string()))?;
        let out_path = dest_dir.join(entry.name());
        if entry.name().ends_with('/') {
            std::fs::create_dir_all(&out_path).map_err(io_err)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).map_err(io_err)?;
        File::create(&out_path).map_err(io_err)?.write_all(&contents).map_err(io_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::KvEngine;

    #[test]
    fn fast_snapshot_round_trips_into_a_fresh_engine() {
        let data_dir = tempfile::tempdir().unwrap();
        let snap_dir = tempfile::tempdir().unwrap();
        let config = RheaConfig::new(data_dir.path());
        let engine = KvEngine::open(&config).unwrap();
        engine.batch_put(&[(b"k".to_vec(), b"v".to_vec())]);
        engine.snapshot_save(snap_dir.path()).unwrap();

        let reload_dir = tempfile::tempdir().unwrap();
        let reload_config = RheaConfig::new(reload_dir.path());
        let reload_engine = KvEngine::open(&reload_config).unwrap();
        reload_engine.snapshot_load(snap_dir.path()).unwrap();
        assert_eq!(reload_engine.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn backup_snapshot_round_trips_into_a_fresh_engine() {
        let data_dir = tempfile::tempdir().unwrap();
        let snap_dir = tempfile::tempdir().unwrap();
        let config = RheaConfig::new(data_dir.path()).snapshot_mode(SnapshotMode::Backup);
        let engine = KvEngine::open(&config).unwrap();
        engine.batch_put(&[(b"k".to_vec(), b"v".to_vec())]);
        let meta = engine.snapshot_save(snap_dir.path()).unwrap();
        assert!(meta.user_meta.is_some());

        let reload_dir = tempfile::tempdir().unwrap();
        let reload_config = RheaConfig::new(reload_dir.path()).snapshot_mode(SnapshotMode::Backup);
        let reload_engine = KvEngine::open(&reload_config).unwrap();
        reload_engine.snapshot_load(snap_dir.path()).unwrap();
        assert_eq!(reload_engine.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
