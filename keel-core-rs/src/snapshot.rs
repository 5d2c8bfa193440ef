//! Snapshot storage for log compaction and follower catch-up.
//!
//! Two backends share one contract behind [`SnapshotStore`]:
//! - `FileSnapshotStore`: a directory of `.snap` files
//! - `MemorySnapshotStore`: heap-backed twin for tests and the harness
//!
//! A snapshot is created pending, receives appended bytes, and is sealed by
//! `complete`, which stamps the length prefix and sets the `locked` flag in
//! the descriptor. Only completed snapshots are readable or discoverable as
//! current; incomplete files left behind by a crash are discarded on open.
//!
//! File layout:
//! ```text
//! {dir}/{id}-{index}.snap
//!   descriptor (64 B): magic 'SNP\0', version, id, index, timestamp, locked
//!   length:u32 | payload
//! ```

use crate::error::SnapshotError;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SNAPSHOT_MAGIC: u32 = 0x534E_5000; // "SNP\0"
const SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_DESCRIPTOR_SIZE: usize = 64;

/// Identity and state of one snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub id: u64,
    /// Last applied log index captured by the snapshot
    pub index: u64,
    /// Leader-assigned epoch milliseconds at capture time
    pub timestamp: u64,
    /// Set once `complete` seals the snapshot
    pub locked: bool,
}

impl SnapshotMeta {
    fn to_bytes(&self) -> [u8; SNAPSHOT_DESCRIPTOR_SIZE] {
        let mut buf = [0u8; SNAPSHOT_DESCRIPTOR_SIZE];
        buf[0..4].copy_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.index.to_le_bytes());
        buf[24..32].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[32] = self.locked as u8;
        buf
    }

    fn from_bytes(buf: &[u8; SNAPSHOT_DESCRIPTOR_SIZE]) -> Result<Self, SnapshotError> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().expect("slice length checked"));
        if magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::Corrupt(format!("bad magic {magic:#010x}")));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().expect("slice length checked"));
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Corrupt(format!(
                "unsupported version {version}"
            )));
        }
        Ok(Self {
            id: u64::from_le_bytes(buf[8..16].try_into().expect("slice length checked")),
            index: u64::from_le_bytes(buf[16..24].try_into().expect("slice length checked")),
            timestamp: u64::from_le_bytes(buf[24..32].try_into().expect("slice length checked")),
            locked: buf[32] != 0,
        })
    }
}

/// Snapshot storage backend
pub enum SnapshotStore {
    File(FileSnapshotStore),
    Memory(MemorySnapshotStore),
}

impl SnapshotStore {
    /// Open a file-backed store, recovering completed snapshots
    pub fn file(dir: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        Ok(SnapshotStore::File(FileSnapshotStore::open(dir.into())?))
    }

    /// Create a memory-backed store
    pub fn memory() -> Self {
        SnapshotStore::Memory(MemorySnapshotStore::new())
    }

    /// Create a pending snapshot whose id equals its index
    pub fn create(&mut self, index: u64, timestamp: u64) -> Result<SnapshotMeta, SnapshotError> {
        self.create_with_id(index, index, timestamp)
    }

    /// Create a pending snapshot with an explicit id (install path)
    pub fn create_with_id(
        &mut self,
        id: u64,
        index: u64,
        timestamp: u64,
    ) -> Result<SnapshotMeta, SnapshotError> {
        match self {
            SnapshotStore::File(s) => s.create(id, index, timestamp),
            SnapshotStore::Memory(s) => s.create(id, index, timestamp),
        }
    }

    /// Append bytes to a pending snapshot; returns the total bytes written
    pub fn append(&mut self, index: u64, data: &[u8]) -> Result<u64, SnapshotError> {
        match self {
            SnapshotStore::File(s) => s.append(index, data),
            SnapshotStore::Memory(s) => s.append(index, data),
        }
    }

    /// Bytes written so far to a pending snapshot
    pub fn written(&self, index: u64) -> Result<u64, SnapshotError> {
        match self {
            SnapshotStore::File(s) => s.written(index),
            SnapshotStore::Memory(s) => s.written(index),
        }
    }

    /// Whether a pending (not yet completed) snapshot exists at `index`
    pub fn is_pending(&self, index: u64) -> bool {
        match self {
            SnapshotStore::File(s) => s.pending.contains_key(&index),
            SnapshotStore::Memory(s) => s.pending.contains_key(&index),
        }
    }

    /// Seal a pending snapshot; afterwards it is immutable and current
    pub fn complete(&mut self, index: u64) -> Result<SnapshotMeta, SnapshotError> {
        match self {
            SnapshotStore::File(s) => s.complete(index),
            SnapshotStore::Memory(s) => s.complete(index),
        }
    }

    /// Highest-index completed snapshot
    pub fn current(&self) -> Option<SnapshotMeta> {
        match self {
            SnapshotStore::File(s) => s.completed.values().next_back().copied(),
            SnapshotStore::Memory(s) => s.completed.values().map(|(m, _)| *m).next_back(),
        }
    }

    /// Read the payload of a completed snapshot
    pub fn read(&self, index: u64) -> Result<Vec<u8>, SnapshotError> {
        match self {
            SnapshotStore::File(s) => s.read(index),
            SnapshotStore::Memory(s) => s.read(index),
        }
    }

    /// Remove a snapshot; succeeds whether or not it exists
    pub fn delete(&mut self, index: u64) -> Result<(), SnapshotError> {
        match self {
            SnapshotStore::File(s) => s.delete(index),
            SnapshotStore::Memory(s) => {
                s.completed.remove(&index);
                s.pending.remove(&index);
                Ok(())
            }
        }
    }
}

struct PendingFile {
    meta: SnapshotMeta,
    path: PathBuf,
    file: File,
    written: u64,
}

/// Directory-backed snapshot store
pub struct FileSnapshotStore {
    dir: PathBuf,
    completed: BTreeMap<u64, SnapshotMeta>,
    pending: HashMap<u64, PendingFile>,
}

impl FileSnapshotStore {
    fn open(dir: PathBuf) -> Result<Self, SnapshotError> {
        fs::create_dir_all(&dir)?;

        let mut completed = BTreeMap::new();
        for dir_entry in fs::read_dir(&dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("snap") {
                continue;
            }
            match Self::read_descriptor(&path) {
                Ok(meta) if meta.locked => {
                    debug!("Snapshot: Recovered snapshot at index {}", meta.index);
                    completed.insert(meta.index, meta);
                }
                Ok(meta) => {
                    warn!(
                        "Snapshot: Discarding incomplete snapshot at index {}",
                        meta.index
                    );
                    fs::remove_file(&path)?;
                }
                Err(e) => {
                    warn!("Snapshot: Discarding unreadable file {:?}: {}", path, e);
                    fs::remove_file(&path)?;
                }
            }
        }

        Ok(Self {
            dir,
            completed,
            pending: HashMap::new(),
        })
    }

    fn read_descriptor(path: &Path) -> Result<SnapshotMeta, SnapshotError> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; SNAPSHOT_DESCRIPTOR_SIZE];
        file.read_exact(&mut buf)?;
        SnapshotMeta::from_bytes(&buf)
    }

    fn snapshot_path(&self, id: u64, index: u64) -> PathBuf {
        self.dir.join(format!("{id:010}-{index:010}.snap"))
    }

    fn create(&mut self, id: u64, index: u64, timestamp: u64) -> Result<SnapshotMeta, SnapshotError> {
        if self.completed.contains_key(&index) || self.pending.contains_key(&index) {
            return Err(SnapshotError::AlreadyExists(index));
        }

        let meta = SnapshotMeta {
            id,
            index,
            timestamp,
            locked: false,
        };
        let path = self.snapshot_path(id, index);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&meta.to_bytes())?;
        file.write_all(&0u32.to_le_bytes())?; // length stamped on completion

        info!("Snapshot: Created pending snapshot at index {}", index);
        self.pending.insert(
            index,
            PendingFile {
                meta,
                path,
                file,
                written: 0,
            },
        );
        Ok(meta)
    }

    fn append(&mut self, index: u64, data: &[u8]) -> Result<u64, SnapshotError> {
        if self.completed.contains_key(&index) {
            return Err(SnapshotError::Sealed(index));
        }
        let pending = self
            .pending
            .get_mut(&index)
            .ok_or(SnapshotError::Unknown(index))?;
        pending.file.write_all(data)?;
        pending.written += data.len() as u64;
        Ok(pending.written)
    }

    fn written(&self, index: u64) -> Result<u64, SnapshotError> {
        self.pending
            .get(&index)
            .map(|p| p.written)
            .ok_or(SnapshotError::Unknown(index))
    }

    fn complete(&mut self, index: u64) -> Result<SnapshotMeta, SnapshotError> {
        let mut pending = self
            .pending
            .remove(&index)
            .ok_or(SnapshotError::Unknown(index))?;

        pending.meta.locked = true;
        pending
            .file
            .seek(SeekFrom::Start(SNAPSHOT_DESCRIPTOR_SIZE as u64))?;
        pending
            .file
            .write_all(&(pending.written as u32).to_le_bytes())?;
        pending.file.seek(SeekFrom::Start(0))?;
        pending.file.write_all(&pending.meta.to_bytes())?;
        pending.file.sync_all()?;

        info!(
            "Snapshot: Completed snapshot at index {} ({} bytes)",
            index, pending.written
        );
        self.completed.insert(index, pending.meta);
        Ok(pending.meta)
    }

    fn read(&self, index: u64) -> Result<Vec<u8>, SnapshotError> {
        let meta = match self.completed.get(&index) {
            Some(m) => m,
            None if self.pending.contains_key(&index) => {
                return Err(SnapshotError::Incomplete(index))
            }
            None => return Err(SnapshotError::Unknown(index)),
        };

        let mut file = File::open(self.snapshot_path(meta.id, meta.index))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        if data.len() < SNAPSHOT_DESCRIPTOR_SIZE + 4 {
            return Err(SnapshotError::Corrupt(format!(
                "snapshot file at index {index} is shorter than its header"
            )));
        }
        let length = u32::from_le_bytes(
            data[SNAPSHOT_DESCRIPTOR_SIZE..SNAPSHOT_DESCRIPTOR_SIZE + 4]
                .try_into()
                .expect("slice length checked"),
        ) as usize;
        let start = SNAPSHOT_DESCRIPTOR_SIZE + 4;
        if data.len() < start + length {
            return Err(SnapshotError::Corrupt(format!(
                "snapshot at index {index} truncated: expected {length} payload bytes"
            )));
        }
        Ok(data[start..start + length].to_vec())
    }

    fn delete(&mut self, index: u64) -> Result<(), SnapshotError> {
        if let Some(meta) = self.completed.remove(&index) {
            let path = self.snapshot_path(meta.id, meta.index);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        if let Some(pending) = self.pending.remove(&index) {
            drop(pending.file);
            if pending.path.exists() {
                fs::remove_file(pending.path)?;
            }
        }
        Ok(())
    }
}

/// Heap-backed snapshot store with the same contract as the file store
pub struct MemorySnapshotStore {
    completed: BTreeMap<u64, (SnapshotMeta, Vec<u8>)>,
    pending: HashMap<u64, (SnapshotMeta, Vec<u8>)>,
}

impl MemorySnapshotStore {
    fn new() -> Self {
        Self {
            completed: BTreeMap::new(),
            pending: HashMap::new(),
        }
    }

    fn create(&mut self, id: u64, index: u64, timestamp: u64) -> Result<SnapshotMeta, SnapshotError> {
        if self.completed.contains_key(&index) || self.pending.contains_key(&index) {
            return Err(SnapshotError::AlreadyExists(index));
        }
        let meta = SnapshotMeta {
            id,
            index,
            timestamp,
            locked: false,
        };
        self.pending.insert(index, (meta, Vec::new()));
        Ok(meta)
    }

    fn append(&mut self, index: u64, data: &[u8]) -> Result<u64, SnapshotError> {
        if self.completed.contains_key(&index) {
            return Err(SnapshotError::Sealed(index));
        }
        let (_, buf) = self
            .pending
            .get_mut(&index)
            .ok_or(SnapshotError::Unknown(index))?;
        buf.extend_from_slice(data);
        Ok(buf.len() as u64)
    }

    fn written(&self, index: u64) -> Result<u64, SnapshotError> {
        self.pending
            .get(&index)
            .map(|(_, buf)| buf.len() as u64)
            .ok_or(SnapshotError::Unknown(index))
    }

    fn complete(&mut self, index: u64) -> Result<SnapshotMeta, SnapshotError> {
        let (mut meta, buf) = self
            .pending
            .remove(&index)
            .ok_or(SnapshotError::Unknown(index))?;
        meta.locked = true;
        self.completed.insert(index, (meta, buf));
        Ok(meta)
    }

    fn read(&self, index: u64) -> Result<Vec<u8>, SnapshotError> {
        if let Some((_, buf)) = self.completed.get(&index) {
            return Ok(buf.clone());
        }
        if self.pending.contains_key(&index) {
            return Err(SnapshotError::Incomplete(index));
        }
        Err(SnapshotError::Unknown(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn lifecycle(store: &mut SnapshotStore) {
        let meta = store.create(10, 12345).unwrap();
        assert_eq!(meta.index, 10);
        assert!(!meta.locked);

        // A second snapshot at the same index is rejected
        assert!(matches!(
            store.create(10, 0),
            Err(SnapshotError::AlreadyExists(10))
        ));

        // Incomplete snapshots are not readable and not current
        assert!(matches!(store.read(10), Err(SnapshotError::Incomplete(10))));
        assert!(store.current().is_none());

        store.append(10, b"hello ").unwrap();
        let written = store.append(10, b"snapshot").unwrap();
        assert_eq!(written, 14);

        let sealed = store.complete(10).unwrap();
        assert!(sealed.locked);
        assert_eq!(store.read(10).unwrap(), b"hello snapshot");
        assert_eq!(store.current().map(|m| m.index), Some(10));

        // Appends after completion are rejected
        assert!(matches!(
            store.append(10, b"x"),
            Err(SnapshotError::Sealed(10))
        ));

        // Current tracks the highest completed index
        store.create(20, 0).unwrap();
        store.append(20, b"later").unwrap();
        store.complete(20).unwrap();
        assert_eq!(store.current().map(|m| m.index), Some(20));

        // Delete is idempotent
        store.delete(10).unwrap();
        store.delete(10).unwrap();
        assert!(matches!(store.read(10), Err(SnapshotError::Unknown(10))));
    }

    #[test]
    fn test_memory_store_lifecycle() {
        let mut store = SnapshotStore::memory();
        lifecycle(&mut store);
    }

    #[test]
    fn test_file_store_lifecycle() {
        let dir = tempdir().unwrap();
        let mut store = SnapshotStore::file(dir.path()).unwrap();
        lifecycle(&mut store);
    }

    #[test]
    fn test_file_store_recovery() {
        let dir = tempdir().unwrap();
        {
            let mut store = SnapshotStore::file(dir.path()).unwrap();
            store.create(5, 111).unwrap();
            store.append(5, b"sealed state").unwrap();
            store.complete(5).unwrap();

            // Left pending on purpose; must be discarded on reopen
            store.create(9, 222).unwrap();
            store.append(9, b"partial").unwrap();
        }

        let store = SnapshotStore::file(dir.path()).unwrap();
        let current = store.current().unwrap();
        assert_eq!(current.index, 5);
        assert_eq!(current.timestamp, 111);
        assert!(current.locked);
        assert_eq!(store.read(5).unwrap(), b"sealed state");
        assert!(matches!(store.read(9), Err(SnapshotError::Unknown(9))));
    }
}
