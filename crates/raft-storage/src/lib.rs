//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements raft-core's LogStore trait so a node survives restarts
//! what: FileLogStore, a write-through json store over an in-memory log

use raft_core::{
    HardState, Index, LogEntry, LogStore, MemoryLogStore, Snapshot, StorageError, Term,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.json";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// snapshot plus the retained floor, stored together so a restart knows
/// where the log begins
#[derive(Serialize, Deserialize, Default)]
struct SnapshotFile {
    snapshot: Snapshot,
    floor_index: Index,
    floor_term: Term,
}

/// file-based log store
///
/// stores raft state in a directory with:
/// - meta.json: term, vote and commit index
/// - log.json: array of retained log entries
/// - snapshot.json: latest snapshot and the retained floor
///
/// reads are served from memory; every mutation rewrites the affected file
/// before returning.
#[derive(Debug)]
pub struct FileLogStore {
    /// directory path for storing state files
    dir: PathBuf,
    inner: MemoryLogStore,
}

impl FileLogStore {
    /// open the store at `dir`, creating the directory if it doesn't exist
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let hard_state: HardState = read_json(&dir.join(META_FILE))?;
        let snap: SnapshotFile = read_json(&dir.join(SNAPSHOT_FILE))?;
        let mut entries: Vec<LogEntry> = read_json(&dir.join(LOG_FILE))?;

        // a crash between writing the snapshot and the log leaves entries the
        // snapshot already covers
        let before = entries.len();
        entries.retain(|e| e.index > snap.floor_index);
        if entries.len() != before {
            warn!(
                dir = %dir.display(),
                dropped = before - entries.len(),
                floor = snap.floor_index,
                "discarding log entries covered by snapshot"
            );
        }

        let inner = MemoryLogStore::from_parts(
            hard_state,
            snap.snapshot,
            (snap.floor_index, snap.floor_term),
            entries,
        )?;
        info!(
            dir = %dir.display(),
            first_index = inner.first_index(),
            last_index = inner.last_index(),
            "opened log store"
        );
        Ok(Self { dir, inner })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn persist_meta(&self) -> Result<(), StorageError> {
        write_json(&self.dir, META_FILE, &self.inner.hard_state())
    }

    fn persist_log(&self) -> Result<(), StorageError> {
        write_json(&self.dir, LOG_FILE, &self.inner.entries())
    }

    fn persist_snapshot(&self) -> Result<(), StorageError> {
        let (floor_index, floor_term) = self.inner.floor();
        let file = SnapshotFile {
            snapshot: self.inner.snapshot()?,
            floor_index,
            floor_term,
        };
        write_json(&self.dir, SNAPSHOT_FILE, &file)
    }
}

impl LogStore for FileLogStore {
    fn hard_state(&self) -> HardState {
        self.inner.hard_state()
    }

    fn set_hard_state(&mut self, hard_state: HardState) -> Result<(), StorageError> {
        self.inner.set_hard_state(hard_state)?;
        self.persist_meta()
    }

    fn first_index(&self) -> Index {
        self.inner.first_index()
    }

    fn last_index(&self) -> Index {
        self.inner.last_index()
    }

    fn term_at(&self, index: Index) -> Result<Term, StorageError> {
        self.inner.term_at(index)
    }

    fn entries_from(&self, index: Index, max: usize) -> Result<Vec<LogEntry>, StorageError> {
        self.inner.entries_from(index, max)
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.inner.append(entries)?;
        self.persist_log()
    }

    fn create_snapshot(&mut self, index: Index, data: Vec<u8>) -> Result<Snapshot, StorageError> {
        let snapshot = self.inner.create_snapshot(index, data)?;
        self.persist_snapshot()?;
        Ok(snapshot)
    }

    fn compact_to(&mut self, index: Index) -> Result<(), StorageError> {
        self.inner.compact_to(index)?;
        // floor first; stale entries below it are dropped on open
        self.persist_snapshot()?;
        self.persist_log()?;
        debug!(dir = %self.dir.display(), index, "compacted log files");
        Ok(())
    }

    fn snapshot(&self) -> Result<Snapshot, StorageError> {
        self.inner.snapshot()
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        self.inner.apply_snapshot(snapshot)?;
        self.persist_snapshot()?;
        self.persist_log()?;
        self.persist_meta()
    }
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StorageError> {
    if !path.exists() {
        return Ok(T::default()); // default for new nodes
    }
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    Ok(serde_json::from_str(&contents)?)
}

/// atomic write: write to temp file, sync, then rename over the target
fn write_json<T: Serialize + ?Sized>(
    dir: &Path,
    name: &str,
    value: &T,
) -> Result<(), StorageError> {
    let json = serde_json::to_string_pretty(value)?;
    let temp_path = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&temp_path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;
    Ok(())
}
