use std::path::{Path, PathBuf};

/// Snapshot metadata the driver builds from its own bookkeeping (§4.1 "Snapshot save"):
/// the committed index/term/config the snapshot corresponds to. Distinct from
/// `LocalFileMeta`, which is what the *engine* returns after writing its own files.
#[derive(Debug, Clone, Default)]
pub struct SnapshotMetadata {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub peers: Vec<u64>,
    pub old_peers: Vec<u64>,
}

impl SnapshotMetadata {
    /// Lexicographic `(index, term)` comparison used to reject stale loads (§3, §4.1).
    pub fn is_newer_than(&self, current_index: u64, current_term: u64) -> bool {
        (current_index, current_term) <= (self.last_included_index, self.last_included_term)
    }
}

/// Opaque per-file metadata the state machine returns after persisting a snapshot
/// (§4.1, §6): absent in fast mode, the serialized backup descriptor in backup mode.
#[derive(Debug, Clone, Default)]
pub struct LocalFileMeta {
    pub user_meta: Option<Vec<u8>>,
}

/// Handed to the state machine on snapshot save; exposes the writer-side directory
/// `<writerPath>/kv/` the engine should persist into (§6).
pub trait SnapshotWriter: Send {
    fn path(&self) -> &Path;
}

/// Handed to the state machine on snapshot load; exposes the reader-side directory
/// holding the unpacked `kv/` contents (§6).
pub trait SnapshotReader: Send {
    fn path(&self) -> &Path;
}

#[derive(Debug, Clone)]
pub struct FsSnapshotWriter {
    base_path: PathBuf,
}

impl FsSnapshotWriter {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

impl SnapshotWriter for FsSnapshotWriter {
    fn path(&self) -> &Path {
        &self.base_path
    }
}

#[derive(Debug, Clone)]
pub struct FsSnapshotReader {
    base_path: PathBuf,
}

impl FsSnapshotReader {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

impl SnapshotReader for FsSnapshotReader {
    fn path(&self) -> &Path {
        &self.base_path
    }
}
