//! Segmented append-only log store.
//!
//! Implements:
//! - Durable entry storage across bounded segment files
//! - Fast random read by index via an in-memory offset index
//! - Suffix truncation for conflict resolution
//! - Whole-segment compaction driven by snapshots
//! - Torn-write detection and recovery by frame checksum
//!
//! On-disk layout per segment:
//! ```text
//! {dir}/{id}.log
//!   descriptor (64 B): magic 'LOG\0', version, id, index, max_segment_size,
//!                      max_entries, created, locked
//!   repeated frames:   length:u32 | checksum:u32 | payload (JSON entry)
//! ```
//! The checksum covers `length | payload`; recovery truncates at the first
//! corrupt frame. Segment index ranges partition the log with no overlap or
//! gap, and only the tail segment accepts appends.

use crate::entry::LogEntry;
use crate::error::LogError;
use crate::types::unix_timestamp_ms;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SEGMENT_MAGIC: u32 = 0x4C4F_4700; // "LOG\0"
const SEGMENT_VERSION: u32 = 1;
const DESCRIPTOR_SIZE: usize = 64;
const FRAME_HEADER_SIZE: usize = 8;

/// Log store configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the segment files
    pub dir: PathBuf,
    /// Maximum segment file size before rolling (bytes)
    pub max_segment_size: u64,
    /// Maximum entries per segment before rolling
    pub max_segment_entries: u64,
    /// Sync to disk after every append
    pub fsync_on_write: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./keel-data/log"),
            max_segment_size: 32 * 1024 * 1024, // 32 MB
            max_segment_entries: 8192,
            fsync_on_write: true,
        }
    }
}

/// Fixed-size segment file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub id: u64,
    /// First log index covered by this segment
    pub index: u64,
    pub max_segment_size: u64,
    pub max_entries: u64,
    /// Creation time (epoch ms)
    pub created: u64,
    /// Set when the segment stops accepting appends
    pub locked: bool,
}

impl SegmentDescriptor {
    fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.index.to_le_bytes());
        buf[24..32].copy_from_slice(&self.max_segment_size.to_le_bytes());
        buf[32..40].copy_from_slice(&self.max_entries.to_le_bytes());
        buf[40..48].copy_from_slice(&self.created.to_le_bytes());
        buf[48] = self.locked as u8;
        buf
    }

    fn from_bytes(buf: &[u8; DESCRIPTOR_SIZE]) -> Result<Self, LogError> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().expect("slice length checked"));
        if magic != SEGMENT_MAGIC {
            return Err(LogError::Corrupt(format!("bad magic {magic:#010x}")));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().expect("slice length checked"));
        if version != SEGMENT_VERSION {
            return Err(LogError::Corrupt(format!("unsupported version {version}")));
        }
        Ok(Self {
            id: u64::from_le_bytes(buf[8..16].try_into().expect("slice length checked")),
            index: u64::from_le_bytes(buf[16..24].try_into().expect("slice length checked")),
            max_segment_size: u64::from_le_bytes(
                buf[24..32].try_into().expect("slice length checked"),
            ),
            max_entries: u64::from_le_bytes(buf[32..40].try_into().expect("slice length checked")),
            created: u64::from_le_bytes(buf[40..48].try_into().expect("slice length checked")),
            locked: buf[48] != 0,
        })
    }
}

/// One segment: cached entries plus the parallel frame offset index
struct Segment {
    descriptor: SegmentDescriptor,
    path: PathBuf,
    entries: Vec<LogEntry>,
    /// Byte offset of each entry frame, parallel to `entries`
    offsets: Vec<u64>,
    /// Current file size
    size: u64,
}

impl Segment {
    /// Last index covered, or `index - 1` when empty
    fn last_index(&self) -> u64 {
        self.descriptor.index + self.entries.len() as u64 - 1
    }

    fn contains(&self, index: u64) -> bool {
        index >= self.descriptor.index && index <= self.last_index()
    }
}

/// Cursor read mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Read every stored entry
    All,
    /// Read only entries at or below the commit index
    Committed,
}

/// Cursor over the log; `Committed` mode clamps `has_next` to the commit index
pub struct LogReader<'a> {
    log: &'a Log,
    next_index: u64,
    mode: ReadMode,
}

impl<'a> LogReader<'a> {
    pub fn has_next(&self) -> bool {
        let limit = match self.mode {
            ReadMode::All => self.log.last_index(),
            ReadMode::Committed => self.log.commit_index(),
        };
        self.next_index <= limit
    }

    pub fn next(&mut self) -> Option<LogEntry> {
        if !self.has_next() {
            return None;
        }
        let entry = self.log.get(self.next_index).cloned();
        if entry.is_some() {
            self.next_index += 1;
        }
        entry
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }
}

/// Segmented durable log
pub struct Log {
    config: LogConfig,
    /// Segments sorted by first index; the last one is the writable tail
    segments: Vec<Segment>,
    writer: BufWriter<File>,
    commit_index: u64,
    /// Highest index removed by compaction or snapshot reset
    boundary_index: u64,
    /// Term of the boundary entry, needed for consistency checks at the edge
    boundary_term: u64,
    next_segment_id: u64,
}

impl Log {
    /// Open the log, recovering any existing segments
    pub fn open(config: LogConfig) -> Result<Self, LogError> {
        fs::create_dir_all(&config.dir)?;

        let mut segments = Vec::new();
        for dir_entry in fs::read_dir(&config.dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("log") {
                segments.push(Self::load_segment(&path)?);
            }
        }
        segments.sort_by_key(|s: &Segment| s.descriptor.index);

        for pair in segments.windows(2) {
            if pair[1].descriptor.index != pair[0].last_index() + 1 {
                return Err(LogError::Corrupt(format!(
                    "segment {} starts at {} but previous segment ends at {}",
                    pair[1].descriptor.id,
                    pair[1].descriptor.index,
                    pair[0].last_index()
                )));
            }
        }

        let mut next_segment_id = segments.iter().map(|s| s.descriptor.id).max().unwrap_or(0) + 1;

        if segments.is_empty() {
            let descriptor = SegmentDescriptor {
                id: next_segment_id,
                index: 1,
                max_segment_size: config.max_segment_size,
                max_entries: config.max_segment_entries,
                created: unix_timestamp_ms(),
                locked: false,
            };
            let path = config.dir.join(format!("{:010}.log", descriptor.id));
            let mut file = File::create(&path)?;
            file.write_all(&descriptor.to_bytes())?;
            file.sync_data()?;
            next_segment_id += 1;
            segments.push(Segment {
                descriptor,
                path,
                entries: Vec::new(),
                offsets: Vec::new(),
                size: DESCRIPTOR_SIZE as u64,
            });
        }

        let boundary_index = segments[0].descriptor.index - 1;
        let tail_path = segments
            .last()
            .expect("at least one segment exists after open")
            .path
            .clone();
        let writer = Self::open_writer(&tail_path)?;

        let log = Self {
            segments,
            writer,
            commit_index: boundary_index,
            boundary_index,
            boundary_term: 0,
            next_segment_id,
            config,
        };

        info!(
            "Log: Opened with {} segments, indexes [{}, {}]",
            log.segments.len(),
            log.first_index(),
            log.last_index()
        );
        Ok(log)
    }

    fn load_segment(path: &Path) -> Result<Segment, LogError> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        if data.len() < DESCRIPTOR_SIZE {
            return Err(LogError::Corrupt(format!(
                "segment file {} shorter than descriptor",
                path.display()
            )));
        }
        let mut header = [0u8; DESCRIPTOR_SIZE];
        header.copy_from_slice(&data[..DESCRIPTOR_SIZE]);
        let descriptor = SegmentDescriptor::from_bytes(&header)?;

        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut pos = DESCRIPTOR_SIZE;
        let mut valid_end = pos;

        while data.len() - pos >= FRAME_HEADER_SIZE {
            let length = u32::from_le_bytes(
                data[pos..pos + 4].try_into().expect("slice length checked"),
            ) as usize;
            let checksum =
                u32::from_le_bytes(data[pos + 4..pos + 8].try_into().expect("slice length checked"));
            let frame_end = pos + FRAME_HEADER_SIZE + length;
            if frame_end > data.len() {
                warn!(
                    "Log: Torn frame at offset {} in {}, truncating",
                    pos,
                    path.display()
                );
                break;
            }
            let payload = &data[pos + FRAME_HEADER_SIZE..frame_end];
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&(length as u32).to_le_bytes());
            hasher.update(payload);
            if hasher.finalize() != checksum {
                warn!(
                    "Log: Checksum mismatch at offset {} in {}, truncating",
                    pos,
                    path.display()
                );
                break;
            }
            match serde_json::from_slice::<LogEntry>(payload) {
                Ok(entry) => {
                    offsets.push(pos as u64);
                    entries.push(entry);
                }
                Err(e) => {
                    warn!(
                        "Log: Undecodable frame at offset {} in {}: {}",
                        pos,
                        path.display(),
                        e
                    );
                    break;
                }
            }
            pos = frame_end;
            valid_end = pos;
        }

        if valid_end < data.len() {
            // Drop the torn suffix so future appends start from a clean frame
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_end as u64)?;
            file.sync_data()?;
        }

        debug!(
            "Log: Recovered segment {} with {} entries from {}",
            descriptor.id,
            entries.len(),
            path.display()
        );

        Ok(Segment {
            descriptor,
            path: path.to_path_buf(),
            entries,
            offsets,
            size: valid_end as u64,
        })
    }

    fn segment_path(&self, id: u64) -> PathBuf {
        self.config.dir.join(format!("{id:010}.log"))
    }

    fn create_segment(&mut self, first_index: u64) -> Result<(), LogError> {
        let descriptor = SegmentDescriptor {
            id: self.next_segment_id,
            index: first_index,
            max_segment_size: self.config.max_segment_size,
            max_entries: self.config.max_segment_entries,
            created: unix_timestamp_ms(),
            locked: false,
        };
        self.next_segment_id += 1;

        let path = self.segment_path(descriptor.id);
        let mut file = File::create(&path)?;
        file.write_all(&descriptor.to_bytes())?;
        file.sync_data()?;
        drop(file);

        debug!(
            "Log: Created segment {} starting at index {}",
            descriptor.id, first_index
        );

        self.writer = Self::open_writer(&path)?;
        self.segments.push(Segment {
            descriptor,
            path,
            entries: Vec::new(),
            offsets: Vec::new(),
            size: DESCRIPTOR_SIZE as u64,
        });
        Ok(())
    }

    fn open_writer(path: &Path) -> Result<BufWriter<File>, LogError> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(BufWriter::new(file))
    }

    fn rewrite_descriptor(path: &Path, descriptor: &SegmentDescriptor) -> Result<(), LogError> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.write_all(&descriptor.to_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn tail(&self) -> &Segment {
        self.segments.last().expect("log always has a tail segment")
    }

    fn tail_mut(&mut self) -> &mut Segment {
        self.segments
            .last_mut()
            .expect("log always has a tail segment")
    }

    /// First index still stored (after compaction)
    pub fn first_index(&self) -> u64 {
        self.boundary_index + 1
    }

    /// Highest stored index, or the boundary when the log is empty
    pub fn last_index(&self) -> u64 {
        self.tail().last_index()
    }

    /// Term of the last stored entry
    pub fn last_term(&self) -> u64 {
        self.term(self.last_index()).unwrap_or(0)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    /// Highest index discarded by compaction or snapshot reset
    pub fn compacted_index(&self) -> u64 {
        self.boundary_index
    }

    /// Record the term at the compaction boundary, learned from a snapshot
    pub fn note_boundary_term(&mut self, index: u64, term: u64) {
        if index == self.boundary_index {
            self.boundary_term = term;
        }
    }

    /// Next index to be assigned
    pub fn next_index(&self) -> u64 {
        self.last_index() + 1
    }

    /// Get the entry at `index`, if still stored
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.boundary_index {
            return None;
        }
        self.segments
            .iter()
            .find(|s| s.contains(index))
            .and_then(|s| s.entries.get((index - s.descriptor.index) as usize))
    }

    /// Term at `index`: 0 for the empty prefix, the boundary term at the
    /// compaction edge, otherwise the stored entry's term
    pub fn term(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.boundary_index {
            return Some(self.boundary_term);
        }
        self.get(index).map(|e| e.term)
    }

    fn tail_is_full(&self) -> bool {
        let tail = self.tail();
        tail.entries.len() as u64 >= self.config.max_segment_entries
            || tail.size >= self.config.max_segment_size
    }

    fn roll_segment(&mut self) -> Result<(), LogError> {
        self.writer.flush()?;
        let next_index = self.last_index() + 1;
        {
            let tail = self.tail_mut();
            tail.descriptor.locked = true;
            let descriptor = tail.descriptor.clone();
            let path = tail.path.clone();
            Self::rewrite_descriptor(&path, &descriptor)?;
        }
        info!("Log: Sealed segment, rolling at index {}", next_index);
        self.create_segment(next_index)
    }

    fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>, LogError> {
        let payload = serde_json::to_vec(entry)?;
        let length = payload.len() as u32;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&length.to_le_bytes());
        hasher.update(&payload);
        let checksum = hasher.finalize();

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&checksum.to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Append a new entry as the leader, assigning the next index
    pub fn append(
        &mut self,
        term: u64,
        timestamp: u64,
        kind: crate::entry::EntryKind,
    ) -> Result<LogEntry, LogError> {
        let entry = LogEntry::new(self.next_index(), term, timestamp, kind);
        self.append_entry(entry.clone())?;
        Ok(entry)
    }

    /// Append an already-indexed entry (follower path). The index must equal
    /// the next index; callers truncate conflicting suffixes first.
    pub fn append_entry(&mut self, entry: LogEntry) -> Result<(), LogError> {
        let expected = self.next_index();
        if entry.index != expected {
            return Err(LogError::IndexMismatch {
                index: entry.index,
                expected,
            });
        }

        if self.tail_is_full() {
            self.roll_segment()?;
        }

        let frame = Self::encode_frame(&entry)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        if self.config.fsync_on_write {
            self.writer.get_ref().sync_data()?;
        }

        let tail = self.tail_mut();
        tail.offsets.push(tail.size);
        tail.size += frame.len() as u64;
        tail.entries.push(entry);
        Ok(())
    }

    /// Remove all entries above `index`, deleting or shrinking segments
    pub fn truncate(&mut self, index: u64) -> Result<(), LogError> {
        if index >= self.last_index() {
            return Ok(());
        }
        let index = index.max(self.boundary_index);

        while self.segments.len() > 1 && self.tail().descriptor.index > index {
            let seg = self
                .segments
                .pop()
                .expect("length checked above");
            fs::remove_file(&seg.path)?;
            debug!("Log: Truncation removed segment {}", seg.descriptor.id);
        }

        let tail = self.tail_mut();
        let keep = (index + 1).saturating_sub(tail.descriptor.index) as usize;
        if keep < tail.entries.len() {
            let new_size = if keep == 0 {
                DESCRIPTOR_SIZE as u64
            } else {
                tail.offsets[keep]
            };
            tail.entries.truncate(keep);
            tail.offsets.truncate(keep);
            tail.size = new_size;
            let file = OpenOptions::new().write(true).open(&tail.path)?;
            file.set_len(new_size)?;
            file.sync_data()?;
        }
        if tail.descriptor.locked {
            tail.descriptor.locked = false;
            let descriptor = tail.descriptor.clone();
            let path = tail.path.clone();
            Self::rewrite_descriptor(&path, &descriptor)?;
        }

        let tail_path = self.tail().path.clone();
        self.writer = Self::open_writer(&tail_path)?;
        self.commit_index = self.commit_index.min(self.last_index());
        info!("Log: Truncated to index {}", self.last_index());
        Ok(())
    }

    /// Advance the commit marker; regressions are ignored
    pub fn commit(&mut self, index: u64) {
        let clamped = index.min(self.last_index());
        if clamped > self.commit_index {
            self.commit_index = clamped;
            debug!("Log: Commit index advanced to {}", clamped);
        }
    }

    /// Discard whole segments whose last index is below `index`; never splits
    /// a segment
    pub fn compact(&mut self, index: u64) -> Result<(), LogError> {
        while self.segments.len() > 1 && self.segments[0].last_index() < index {
            let seg = self.segments.remove(0);
            if let Some(last) = seg.entries.last() {
                self.boundary_index = last.index;
                self.boundary_term = last.term;
            }
            fs::remove_file(&seg.path)?;
            info!(
                "Log: Compacted segment {} (boundary now {})",
                seg.descriptor.id, self.boundary_index
            );
        }
        Ok(())
    }

    /// Drop the entire log after a snapshot install and restart it just past
    /// the snapshot index
    pub fn reset(&mut self, index: u64, term: u64) -> Result<(), LogError> {
        for seg in self.segments.drain(..) {
            fs::remove_file(&seg.path)?;
        }
        self.boundary_index = index;
        self.boundary_term = term;
        self.commit_index = index;
        self.create_segment(index + 1)?;
        info!("Log: Reset past snapshot index {}", index);
        Ok(())
    }

    /// Cursor starting at `from`
    pub fn reader(&self, from: u64, mode: ReadMode) -> LogReader<'_> {
        LogReader {
            log: self,
            next_index: from.max(self.first_index()),
            mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> LogConfig {
        LogConfig {
            dir: dir.to_path_buf(),
            max_segment_size: 1024 * 1024,
            max_segment_entries: 4,
            fsync_on_write: false,
        }
    }

    fn command(op: &str) -> EntryKind {
        EntryKind::Command {
            session: 1,
            sequence: 1,
            operation: op.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_append_and_get() {
        let dir = tempdir().unwrap();
        let mut log = Log::open(test_config(dir.path())).unwrap();

        let entry = log.append(1, 100, command("a")).unwrap();
        assert_eq!(entry.index, 1);
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.get(1).unwrap().term, 1);
        assert_eq!(log.term(1), Some(1));
        assert_eq!(log.term(0), Some(0));
        assert!(log.get(2).is_none());
    }

    #[test]
    fn test_follower_append_requires_next_index() {
        let dir = tempdir().unwrap();
        let mut log = Log::open(test_config(dir.path())).unwrap();

        let entry = LogEntry::new(3, 1, 0, command("x"));
        let err = log.append_entry(entry).unwrap_err();
        match err {
            LogError::IndexMismatch { index, expected } => {
                assert_eq!(index, 3);
                assert_eq!(expected, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_segment_rolling_and_recovery() {
        let dir = tempdir().unwrap();
        {
            let mut log = Log::open(test_config(dir.path())).unwrap();
            for i in 0..10 {
                log.append(1, i, command(&format!("op{i}"))).unwrap();
            }
            assert_eq!(log.last_index(), 10);
        }

        // 10 entries at 4 per segment means three files on disk
        let files = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 3);

        let log = Log::open(test_config(dir.path())).unwrap();
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.first_index(), 1);
        for i in 1..=10 {
            assert!(log.get(i).is_some(), "missing entry {i}");
        }
    }

    #[test]
    fn test_truncate_across_segments() {
        let dir = tempdir().unwrap();
        let mut log = Log::open(test_config(dir.path())).unwrap();
        for i in 0..10 {
            log.append(1, i, command(&format!("op{i}"))).unwrap();
        }

        log.truncate(5).unwrap();
        assert_eq!(log.last_index(), 5);
        assert!(log.get(6).is_none());

        // The log accepts new appends at the truncation point
        let entry = log.append(2, 0, command("new")).unwrap();
        assert_eq!(entry.index, 6);

        // And survives recovery
        drop(log);
        let log = Log::open(test_config(dir.path())).unwrap();
        assert_eq!(log.last_index(), 6);
        assert_eq!(log.get(6).unwrap().term, 2);
    }

    #[test]
    fn test_commit_is_monotonic_and_clamped() {
        let dir = tempdir().unwrap();
        let mut log = Log::open(test_config(dir.path())).unwrap();
        for i in 0..3 {
            log.append(1, i, command("x")).unwrap();
        }

        log.commit(2);
        assert_eq!(log.commit_index(), 2);
        log.commit(1); // regression ignored
        assert_eq!(log.commit_index(), 2);
        log.commit(100); // clamped to the last stored index
        assert_eq!(log.commit_index(), 3);
    }

    #[test]
    fn test_committed_reader_clamps() {
        let dir = tempdir().unwrap();
        let mut log = Log::open(test_config(dir.path())).unwrap();
        for i in 0..5 {
            log.append(1, i, command("x")).unwrap();
        }
        log.commit(3);

        let mut committed = log.reader(1, ReadMode::Committed);
        let mut count = 0;
        while committed.has_next() {
            committed.next().unwrap();
            count += 1;
        }
        assert_eq!(count, 3);

        let mut all = log.reader(1, ReadMode::All);
        let mut count = 0;
        while all.has_next() {
            all.next().unwrap();
            count += 1;
        }
        assert_eq!(count, 5);
    }

    #[test]
    fn test_torn_write_recovery() {
        let dir = tempdir().unwrap();
        {
            let mut log = Log::open(test_config(dir.path())).unwrap();
            for i in 0..3 {
                log.append(1, i, command(&format!("op{i}"))).unwrap();
            }
        }

        // Simulate a torn write by appending garbage to the tail segment
        let tail_path = dir.path().join(format!("{:010}.log", 1));
        let mut file = OpenOptions::new().append(true).open(&tail_path).unwrap();
        file.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x01]).unwrap();
        drop(file);

        let mut log = Log::open(test_config(dir.path())).unwrap();
        assert_eq!(log.last_index(), 3);

        // Appends continue cleanly after the torn suffix was dropped
        let entry = log.append(1, 9, command("after")).unwrap();
        assert_eq!(entry.index, 4);
        drop(log);

        let log = Log::open(test_config(dir.path())).unwrap();
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn test_compact_discards_only_full_segments() {
        let dir = tempdir().unwrap();
        let mut log = Log::open(test_config(dir.path())).unwrap();
        for i in 0..10 {
            log.append(1, i, command(&format!("op{i}"))).unwrap();
        }

        // Segments cover [1,4], [5,8], [9,10]; compacting at 6 may only drop
        // the first
        log.compact(6).unwrap();
        assert_eq!(log.first_index(), 5);
        assert_eq!(log.compacted_index(), 4);
        assert!(log.get(4).is_none());
        assert!(log.get(5).is_some());
        assert_eq!(log.term(4), Some(1)); // boundary term preserved
    }

    #[test]
    fn test_reset_after_snapshot_install() {
        let dir = tempdir().unwrap();
        let mut log = Log::open(test_config(dir.path())).unwrap();
        for i in 0..5 {
            log.append(1, i, command("x")).unwrap();
        }

        log.reset(20, 3).unwrap();
        assert_eq!(log.last_index(), 20);
        assert_eq!(log.next_index(), 21);
        assert_eq!(log.commit_index(), 20);
        assert_eq!(log.term(20), Some(3));
        assert!(log.get(5).is_none());

        let entry = log.append(4, 0, command("fresh")).unwrap();
        assert_eq!(entry.index, 21);
    }
}
