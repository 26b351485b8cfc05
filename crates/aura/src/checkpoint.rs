// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Checkpointing for workflow threads.
//!
//! Every completed superstep writes a [`Checkpoint`] whose parent is the prior
//! checkpoint for the same thread, forming an append-only chain. A node whose
//! work finished before its checkpoint landed leaves a [`PendingWrite`]; on
//! resume the runtime folds outstanding writes into a fresh checkpoint instead
//! of re-executing the task, which is what makes at-least-once node execution
//! safe to observe.
//!
//! Two backends live here: [`MemoryCheckpointer`] for tests and short-lived
//! threads, and [`FileCheckpointer`] for single-node durability with CRC32
//! integrity framing. The PostgreSQL backend lives in
//! `aura-postgres-checkpointer`.

use crate::error::{CheckpointError, Error, Result};
use crate::state::GraphState;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

// ============================================================================
// Checkpoint file integrity framing
// ============================================================================
// Detects corruption from bit flips, partial writes, and format changes.

/// Magic bytes identifying an aura checkpoint file: "ACHK"
const CHECKPOINT_MAGIC: &[u8; 4] = b"ACHK";

/// Current format version for checkpoint files.
const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Header size: magic(4) + version(4) + crc32(4) + length(8) = 20 bytes
const CHECKPOINT_HEADER_SIZE: usize = 20;

/// Error types for checkpoint integrity failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum IntegrityError {
    #[error("Checkpoint file too small: {size} bytes (minimum {minimum} bytes)")]
    FileTooSmall { size: usize, minimum: usize },

    #[error("Invalid checkpoint magic bytes: expected {expected:?}, found {found:?}")]
    InvalidMagic { expected: [u8; 4], found: [u8; 4] },

    #[error("Unsupported checkpoint format version: found {found}, supported up to {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Checkpoint checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("Checkpoint length mismatch: declared {declared} bytes, actual {actual} bytes")]
    LengthMismatch { declared: u64, actual: u64 },
}

/// Wraps checkpoint payloads with an integrity header.
///
/// File format (20-byte header + payload):
/// - Bytes 0-3:   Magic "ACHK"
/// - Bytes 4-7:   Format version (u32 little-endian)
/// - Bytes 8-11:  CRC32 checksum of payload (u32 little-endian)
/// - Bytes 12-19: Payload length (u64 little-endian)
/// - Bytes 20+:   Payload (bincode-serialized checkpoint)
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityFrame;

impl IntegrityFrame {
    /// Prepend the integrity header to raw payload bytes.
    #[must_use]
    pub fn wrap(data: &[u8]) -> Vec<u8> {
        let checksum = crc32fast::hash(data);
        let length = data.len() as u64;

        let mut result = Vec::with_capacity(CHECKPOINT_HEADER_SIZE + data.len());
        result.extend_from_slice(CHECKPOINT_MAGIC);
        result.extend_from_slice(&CHECKPOINT_FORMAT_VERSION.to_le_bytes());
        result.extend_from_slice(&checksum.to_le_bytes());
        result.extend_from_slice(&length.to_le_bytes());
        result.extend_from_slice(data);
        result
    }

    /// Verify integrity and return the payload slice.
    // SAFETY: try_into().unwrap() is safe - data.len() >= CHECKPOINT_HEADER_SIZE
    // is verified before slicing, so [0..4], [4..8], [8..12], [12..20] always fit.
    #[allow(clippy::unwrap_used)]
    pub fn unwrap(data: &[u8]) -> std::result::Result<&[u8], IntegrityError> {
        if data.len() < CHECKPOINT_HEADER_SIZE {
            return Err(IntegrityError::FileTooSmall {
                size: data.len(),
                minimum: CHECKPOINT_HEADER_SIZE,
            });
        }

        let magic: [u8; 4] = data[0..4].try_into().unwrap();
        if &magic != CHECKPOINT_MAGIC {
            return Err(IntegrityError::InvalidMagic {
                expected: *CHECKPOINT_MAGIC,
                found: magic,
            });
        }

        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if version > CHECKPOINT_FORMAT_VERSION {
            return Err(IntegrityError::UnsupportedVersion {
                found: version,
                supported: CHECKPOINT_FORMAT_VERSION,
            });
        }

        let stored_checksum = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let declared_length = u64::from_le_bytes(data[12..20].try_into().unwrap());

        let payload = &data[CHECKPOINT_HEADER_SIZE..];

        let actual_length = payload.len() as u64;
        if declared_length != actual_length {
            return Err(IntegrityError::LengthMismatch {
                declared: declared_length,
                actual: actual_length,
            });
        }

        let computed_checksum = crc32fast::hash(payload);
        if stored_checksum != computed_checksum {
            return Err(IntegrityError::ChecksumMismatch {
                expected: stored_checksum,
                computed: computed_checksum,
            });
        }

        Ok(payload)
    }
}

// Thread-local counter for checkpoint IDs. Combined with a process-unique
// prefix this avoids per-checkpoint entropy syscalls while staying
// collision-free across restarts.
thread_local! {
    static CHECKPOINT_COUNTER: Cell<u64> = const { Cell::new(0) };
}

static PROCESS_UNIQUE_ID: std::sync::OnceLock<String> = std::sync::OnceLock::new();

fn process_unique_id() -> &'static str {
    PROCESS_UNIQUE_ID.get_or_init(|| {
        let start_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let pid = std::process::id();
        format!("{:x}{:04x}", start_time % 0xFFFF_FFFF_FFFF, pid % 0xFFFF)
    })
}

/// Unique identifier for a checkpoint.
pub type CheckpointId = String;

/// Unique identifier for a workflow thread.
pub type ThreadId = String;

/// Terminal and non-terminal thread statuses recorded in checkpoint metadata.
pub mod status {
    /// Metadata key under which the status is stored.
    pub const KEY: &str = "status";
    pub const RUNNING: &str = "running";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
    pub const INTERRUPTED: &str = "interrupted";
}

/// A snapshot of thread state at a superstep boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "S: Serialize",
    deserialize = "S: for<'de2> Deserialize<'de2>"
))]
pub struct Checkpoint<S: GraphState> {
    /// Unique identifier for this checkpoint (auto-generated).
    pub id: CheckpointId,

    /// Thread this checkpoint belongs to.
    pub thread_id: ThreadId,

    /// The complete state at this point.
    pub state: S,

    /// Node that was just executed.
    pub node: String,

    /// Monotonically increasing superstep number within the thread.
    pub superstep: u64,

    /// Timestamp when the checkpoint was created.
    #[serde(with = "systemtime_serde")]
    pub timestamp: SystemTime,

    /// Parent checkpoint ID. `None` only for the first checkpoint of a
    /// thread; the chain forms a DAG by ID, never by pointer.
    pub parent_id: Option<CheckpointId>,

    /// String metadata (status, error detail, interrupt position).
    pub metadata: HashMap<String, String>,
}

impl<S: GraphState> Checkpoint<S> {
    /// Create a new checkpoint.
    pub fn new(
        thread_id: ThreadId,
        state: S,
        node: String,
        superstep: u64,
        parent_id: Option<CheckpointId>,
    ) -> Self {
        let counter = CHECKPOINT_COUNTER.with(|c| {
            let current = c.get();
            c.set(current.wrapping_add(1));
            current
        });
        // Superstep is zero-padded so lexical ID order matches execution order.
        let id = format!(
            "{thread_id}_{:012}_{}_{counter}",
            superstep,
            process_unique_id()
        );

        Self {
            id,
            thread_id,
            state,
            node,
            superstep,
            timestamp: SystemTime::now(),
            parent_id,
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The thread status recorded on this checkpoint, if any.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.metadata.get(status::KEY).map(String::as_str)
    }
}

/// Metadata about a checkpoint without the (potentially large) state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub id: CheckpointId,
    pub thread_id: ThreadId,
    pub node: String,
    pub superstep: u64,
    #[serde(with = "systemtime_serde")]
    pub timestamp: SystemTime,
    pub parent_id: Option<CheckpointId>,
    pub metadata: HashMap<String, String>,
}

impl<S: GraphState> From<&Checkpoint<S>> for CheckpointMetadata {
    fn from(checkpoint: &Checkpoint<S>) -> Self {
        Self {
            id: checkpoint.id.clone(),
            thread_id: checkpoint.thread_id.clone(),
            node: checkpoint.node.clone(),
            superstep: checkpoint.superstep,
            timestamp: checkpoint.timestamp,
            parent_id: checkpoint.parent_id.clone(),
            metadata: checkpoint.metadata.clone(),
        }
    }
}

/// Summary of a thread stored in a checkpointer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub thread_id: ThreadId,
    pub latest_checkpoint_id: CheckpointId,
    #[serde(with = "systemtime_serde")]
    pub updated_at: SystemTime,
    pub checkpoint_count: Option<usize>,
}

/// A not-yet-folded channel update for a completed task.
///
/// Written after a node finishes and deleted once a checkpoint absorbing it
/// lands. After every successful superstep the write set for the thread is
/// empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    /// Thread this write belongs to.
    pub thread_id: ThreadId,
    /// Checkpoint that was current when the task ran (the parent of the
    /// checkpoint this write will fold into).
    pub checkpoint_id: CheckpointId,
    /// Deduplication key: `{thread}:{superstep}:{node}`.
    pub task_id: String,
    /// Position within the task's write sequence.
    pub idx: u32,
    /// Logical channel the payload belongs to.
    pub channel: String,
    /// Serialized payload (bincode-encoded state patch).
    pub payload: Vec<u8>,
}

impl PendingWrite {
    /// Build the deduplication key for a task.
    #[must_use]
    pub fn task_id_for(thread_id: &str, superstep: u64, node: &str) -> String {
        format!("{thread_id}:{superstep}:{node}")
    }
}

/// Trait for checkpoint persistence backends.
///
/// # Required methods
///
/// `save`, `load`, `list`, `delete`, and the pending-write triple
/// (`put_writes`, `get_writes`, `clear_writes`).
///
/// # Defaulted methods
///
/// `get_latest` (via `list` + `load`), `delete_thread` (via `list` +
/// `delete`), `list_threads` (errors unless overridden). Override them when
/// the backend can answer directly.
#[async_trait::async_trait]
pub trait Checkpointer<S: GraphState>: Send + Sync {
    /// Persist a checkpoint.
    async fn save(&self, checkpoint: Checkpoint<S>) -> Result<()>;

    /// Load a specific checkpoint by ID.
    async fn load(&self, checkpoint_id: &str) -> Result<Option<Checkpoint<S>>>;

    /// Get the latest checkpoint for a thread.
    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint<S>>> {
        let metadata_list = self.list(thread_id).await?;
        match metadata_list.first() {
            Some(metadata) => self.load(&metadata.id).await,
            None => Ok(None),
        }
    }

    /// List checkpoint metadata for a thread, newest first.
    async fn list(&self, thread_id: &str) -> Result<Vec<CheckpointMetadata>>;

    /// Delete a checkpoint.
    async fn delete(&self, checkpoint_id: &str) -> Result<()>;

    /// Delete all checkpoints and pending writes for a thread.
    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let metadata_list = self.list(thread_id).await?;
        for metadata in metadata_list {
            self.delete(&metadata.id).await?;
        }
        self.clear_writes(thread_id).await?;
        Ok(())
    }

    /// Record pending writes for a completed task.
    async fn put_writes(&self, writes: Vec<PendingWrite>) -> Result<()>;

    /// Accumulated pending writes for a thread since its latest checkpoint.
    async fn get_writes(&self, thread_id: &str) -> Result<Vec<PendingWrite>>;

    /// Discard all pending writes for a thread (fold or explicit discard).
    async fn clear_writes(&self, thread_id: &str) -> Result<()>;

    /// List all threads with checkpoints, most recently updated first.
    async fn list_threads(&self) -> Result<Vec<ThreadInfo>> {
        Err(Error::internal(
            "list_threads not implemented for this checkpointer",
        ))
    }
}

/// In-memory checkpoint storage.
///
/// Useful for tests and short-lived workflows. Does not persist across
/// process restarts.
#[derive(Clone)]
pub struct MemoryCheckpointer<S: GraphState> {
    checkpoints: Arc<Mutex<HashMap<CheckpointId, Checkpoint<S>>>>,
    writes: Arc<Mutex<HashMap<ThreadId, Vec<PendingWrite>>>>,
}

impl<S: GraphState> MemoryCheckpointer<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            checkpoints: Arc::new(Mutex::new(HashMap::new())),
            writes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of stored checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all checkpoints and pending writes.
    pub fn clear(&self) {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl<S: GraphState> Default for MemoryCheckpointer<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable newest-first ordering: superstep, then timestamp, then ID.
fn newer<S: GraphState>(a: &Checkpoint<S>, b: &Checkpoint<S>) -> std::cmp::Ordering {
    b.superstep
        .cmp(&a.superstep)
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| b.id.cmp(&a.id))
}

#[async_trait::async_trait]
impl<S: GraphState> Checkpointer<S> for MemoryCheckpointer<S> {
    async fn save(&self, checkpoint: Checkpoint<S>) -> Result<()> {
        let mut checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        checkpoints.insert(checkpoint.id.clone(), checkpoint);
        Ok(())
    }

    async fn load(&self, checkpoint_id: &str) -> Result<Option<Checkpoint<S>>> {
        let checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        Ok(checkpoints.get(checkpoint_id).cloned())
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint<S>>> {
        let checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        let mut thread_checkpoints: Vec<_> = checkpoints
            .values()
            .filter(|cp| cp.thread_id == thread_id)
            .collect();
        thread_checkpoints.sort_by(|a, b| newer(a, b));
        Ok(thread_checkpoints.first().map(|cp| (*cp).clone()))
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<CheckpointMetadata>> {
        let checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        let mut thread_checkpoints: Vec<_> = checkpoints
            .values()
            .filter(|cp| cp.thread_id == thread_id)
            .collect();
        thread_checkpoints.sort_by(|a, b| newer(a, b));
        Ok(thread_checkpoints
            .into_iter()
            .map(CheckpointMetadata::from)
            .collect())
    }

    async fn delete(&self, checkpoint_id: &str) -> Result<()> {
        let mut checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        checkpoints.remove(checkpoint_id);
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        {
            let mut checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
            checkpoints.retain(|_, cp| cp.thread_id != thread_id);
        }
        self.clear_writes(thread_id).await
    }

    async fn put_writes(&self, mut new_writes: Vec<PendingWrite>) -> Result<()> {
        let mut writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());
        for write in new_writes.drain(..) {
            writes
                .entry(write.thread_id.clone())
                .or_default()
                .push(write);
        }
        Ok(())
    }

    async fn get_writes(&self, thread_id: &str) -> Result<Vec<PendingWrite>> {
        let writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(writes.get(thread_id).cloned().unwrap_or_default())
    }

    async fn clear_writes(&self, thread_id: &str) -> Result<()> {
        let mut writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());
        writes.remove(thread_id);
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<ThreadInfo>> {
        let checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());

        let mut threads: HashMap<ThreadId, (CheckpointId, u64, SystemTime, usize)> = HashMap::new();
        for cp in checkpoints.values() {
            let entry = threads.entry(cp.thread_id.clone()).or_insert((
                cp.id.clone(),
                cp.superstep,
                cp.timestamp,
                0,
            ));
            entry.3 += 1;
            let is_newer = cp.superstep > entry.1
                || (cp.superstep == entry.1 && (cp.timestamp, &cp.id) > (entry.2, &entry.0));
            if is_newer {
                entry.0 = cp.id.clone();
                entry.1 = cp.superstep;
                entry.2 = cp.timestamp;
            }
        }

        let mut thread_infos: Vec<ThreadInfo> = threads
            .into_iter()
            .map(|(thread_id, (checkpoint_id, _, updated_at, count))| ThreadInfo {
                thread_id,
                latest_checkpoint_id: checkpoint_id,
                updated_at,
                checkpoint_count: Some(count),
            })
            .collect();

        thread_infos.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(thread_infos)
    }
}

/// File-based checkpoint storage.
///
/// Stores each checkpoint as a CRC32-framed bincode file plus a per-thread
/// pending-write sidecar. An index file gives O(1) latest-checkpoint lookup;
/// a corrupt or stale index falls back to a file scan.
pub struct FileCheckpointer<S: GraphState> {
    directory: std::path::PathBuf,
    // thread_id -> (checkpoint_id, superstep)
    index: Arc<Mutex<HashMap<ThreadId, (CheckpointId, u64)>>>,
    _phantom: std::marker::PhantomData<S>,
}

fn load_index(index_path: &std::path::Path) -> HashMap<ThreadId, (CheckpointId, u64)> {
    if !index_path.exists() {
        return HashMap::new();
    }
    match std::fs::read(index_path) {
        Ok(data) => match bincode::deserialize(&data) {
            Ok(idx) => idx,
            Err(e) => {
                tracing::warn!(
                    index_path = %index_path.display(),
                    error = %e,
                    "Checkpoint index is corrupted; starting empty. Lookups fall back to file scans until rebuilt."
                );
                HashMap::new()
            }
        },
        Err(e) => {
            tracing::warn!(
                index_path = %index_path.display(),
                error = %e,
                "Failed to read checkpoint index; starting empty."
            );
            HashMap::new()
        }
    }
}

/// Write to a uniquely-named temp file, fsync, then atomically rename.
fn atomic_write_file_sync(path: &std::path::Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        uuid::Uuid::new_v4()
    );
    let temp_path = path.with_file_name(&temp_name);

    let mut file = std::fs::File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    std::fs::rename(&temp_path, path)?;

    // Rename durability requires fsyncing the parent directory on some
    // filesystems; best effort.
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }

    Ok(())
}

/// Acquire an exclusive cross-process lock on the checkpoint directory.
/// The lock is released when the returned File is dropped.
fn acquire_exclusive_lock(directory: &std::path::Path) -> std::io::Result<std::fs::File> {
    let lock_path = directory.join(".checkpoint.lock");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)?;
    fs2::FileExt::lock_exclusive(&file)?;
    Ok(file)
}

impl<S: GraphState> FileCheckpointer<S> {
    /// Create a file checkpointer, creating the directory and loading the
    /// index if present.
    pub fn new(directory: impl Into<std::path::PathBuf>) -> Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory).map_err(CheckpointError::Io)?;

        let index_path = directory.join("index.bin");
        let index = load_index(&index_path);

        Ok(Self {
            directory,
            index: Arc::new(Mutex::new(index)),
            _phantom: std::marker::PhantomData,
        })
    }

    fn checkpoint_path(&self, checkpoint_id: &str) -> std::path::PathBuf {
        self.directory.join(format!("{checkpoint_id}.bin"))
    }

    fn writes_path(&self, thread_id: &str) -> std::path::PathBuf {
        // Thread ids may contain path-hostile characters; hash them.
        let digest = crc32fast::hash(thread_id.as_bytes());
        self.directory.join(format!("writes_{digest:08x}.bin"))
    }

    fn index_path(&self) -> std::path::PathBuf {
        self.directory.join("index.bin")
    }

    async fn save_index(&self) -> Result<()> {
        let data = {
            let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
            bincode::serialize(&*index).map_err(|e| CheckpointError::SerializationFailed {
                reason: format!("Failed to serialize checkpoint index: {e}"),
            })?
        };
        let index_path = self.index_path();
        let directory = self.directory.clone();

        tokio::task::spawn_blocking(move || {
            let _lock = acquire_exclusive_lock(&directory).map_err(|e| {
                Error::Checkpoint(CheckpointError::LockFailed {
                    path: directory.display().to_string(),
                    reason: e.to_string(),
                })
            })?;
            atomic_write_file_sync(&index_path, &data)
                .map_err(|e| Error::Checkpoint(CheckpointError::Io(e)))?;
            Ok::<_, Error>(())
        })
        .await
        .map_err(|e| CheckpointError::Other(format!("Task join error saving index: {e}")))??;

        Ok(())
    }

    async fn list_files(&self) -> Result<Vec<std::path::PathBuf>> {
        let directory = self.directory.clone();
        tokio::task::spawn_blocking(move || {
            let entries = std::fs::read_dir(&directory).map_err(CheckpointError::Io)?;
            let mut files = Vec::new();
            for entry in entries {
                let entry = entry.map_err(CheckpointError::Io)?;
                let path = entry.path();
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default();
                if name.ends_with(".bin") && name != "index.bin" && !name.starts_with("writes_") {
                    files.push(path);
                }
            }
            Ok::<_, Error>(files)
        })
        .await
        .map_err(|e| {
            Error::Checkpoint(CheckpointError::Other(format!(
                "Task join error listing checkpoint files: {e}"
            )))
        })?
    }

    async fn read_checkpoint_file(file: std::path::PathBuf) -> Result<Checkpoint<S>> {
        let file_display = file.display().to_string();
        tokio::task::spawn_blocking(move || {
            let data = std::fs::read(&file).map_err(CheckpointError::Io)?;
            let payload = IntegrityFrame::unwrap(&data).map_err(|e| {
                CheckpointError::IntegrityCheckFailed {
                    checkpoint_id: file.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
            let checkpoint =
                bincode::deserialize(payload).map_err(|e| CheckpointError::DeserializationFailed {
                    reason: format!("Failed to deserialize checkpoint from '{}': {e}", file.display()),
                })?;
            Ok::<_, Error>(checkpoint)
        })
        .await
        .map_err(|e| {
            Error::Checkpoint(CheckpointError::Other(format!(
                "Task join error reading checkpoint '{file_display}': {e}"
            )))
        })?
    }

    /// Fallback: find the latest checkpoint by scanning files. Used when the
    /// index is corrupt, reset, or points at a missing file.
    async fn get_latest_by_file_scan(&self, thread_id: &str) -> Result<Option<Checkpoint<S>>> {
        let files = self.list_files().await?;
        let mut latest: Option<Checkpoint<S>> = None;

        for file in files {
            match Self::read_checkpoint_file(file.clone()).await {
                Ok(checkpoint) => {
                    if checkpoint.thread_id == thread_id {
                        let replace = match &latest {
                            None => true,
                            Some(current) => newer(&checkpoint, current) == std::cmp::Ordering::Less,
                        };
                        if replace {
                            latest = Some(checkpoint);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(file = %file.display(), "Skipping corrupt file in recovery scan: {e}");
                }
            }
        }

        if let Some(ref checkpoint) = latest {
            let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
            index.insert(
                thread_id.to_string(),
                (checkpoint.id.clone(), checkpoint.superstep),
            );
        }

        Ok(latest)
    }
}

#[async_trait::async_trait]
impl<S: GraphState> Checkpointer<S> for FileCheckpointer<S> {
    async fn save(&self, checkpoint: Checkpoint<S>) -> Result<()> {
        let path = self.checkpoint_path(&checkpoint.id);
        let path_display = path.display().to_string();
        let thread_id = checkpoint.thread_id.clone();
        let checkpoint_id = checkpoint.id.clone();
        let superstep = checkpoint.superstep;

        let checkpoint_id_for_err = checkpoint_id.clone();
        tokio::task::spawn_blocking(move || {
            let serialized =
                bincode::serialize(&checkpoint).map_err(|e| CheckpointError::SerializationFailed {
                    reason: format!("Failed to serialize checkpoint '{checkpoint_id_for_err}': {e}"),
                })?;
            let data = IntegrityFrame::wrap(&serialized);
            atomic_write_file_sync(&path, &data).map_err(CheckpointError::Io)?;
            Ok::<_, CheckpointError>(())
        })
        .await
        .map_err(|e| {
            Error::Checkpoint(CheckpointError::Other(format!(
                "Task join error saving checkpoint '{path_display}': {e}"
            )))
        })??;

        {
            let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
            let entry = index
                .entry(thread_id)
                .or_insert((checkpoint_id.clone(), superstep));
            let is_newer = superstep > entry.1 || (superstep == entry.1 && checkpoint_id > entry.0);
            if is_newer {
                *entry = (checkpoint_id, superstep);
            }
        }

        self.save_index().await
    }

    async fn load(&self, checkpoint_id: &str) -> Result<Option<Checkpoint<S>>> {
        let path = self.checkpoint_path(checkpoint_id);
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(CheckpointError::Io)?;
        if !exists {
            return Ok(None);
        }
        Ok(Some(Self::read_checkpoint_file(path).await?))
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint<S>>> {
        let checkpoint_id = {
            let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
            index.get(thread_id).map(|(id, _)| id.clone())
        };

        match checkpoint_id {
            Some(id) => {
                if let Some(checkpoint) = self.load(&id).await? {
                    return Ok(Some(checkpoint));
                }
                tracing::warn!(
                    thread_id,
                    indexed_checkpoint = %id,
                    "Index pointed to missing checkpoint, falling back to file scan"
                );
                self.get_latest_by_file_scan(thread_id).await
            }
            None => self.get_latest_by_file_scan(thread_id).await,
        }
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<CheckpointMetadata>> {
        let files = self.list_files().await?;
        let mut checkpoints = Vec::new();

        for file in files {
            // One bad file must not break listing or recovery.
            match Self::read_checkpoint_file(file.clone()).await {
                Ok(checkpoint) => {
                    if checkpoint.thread_id == thread_id {
                        checkpoints.push(CheckpointMetadata::from(&checkpoint));
                    }
                }
                Err(e) => {
                    tracing::warn!(file = %file.display(), "Skipping corrupt checkpoint file: {e}");
                }
            }
        }

        checkpoints.sort_by(|a, b| {
            b.superstep
                .cmp(&a.superstep)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(checkpoints)
    }

    async fn delete(&self, checkpoint_id: &str) -> Result<()> {
        let path = self.checkpoint_path(checkpoint_id);
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(CheckpointError::Io)?;
        if exists {
            tokio::fs::remove_file(&path)
                .await
                .map_err(CheckpointError::Io)?;
        }

        {
            let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
            index.retain(|_, (id, _)| id != checkpoint_id);
        }
        self.save_index().await
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let files = self.list_files().await?;
        for file in files {
            match Self::read_checkpoint_file(file.clone()).await {
                Ok(checkpoint) if checkpoint.thread_id == thread_id => {
                    tokio::fs::remove_file(&file)
                        .await
                        .map_err(CheckpointError::Io)?;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(file = %file.display(), "Skipping corrupt checkpoint file during delete: {e}");
                }
            }
        }

        {
            let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
            index.remove(thread_id);
        }
        self.save_index().await?;
        self.clear_writes(thread_id).await
    }

    async fn put_writes(&self, new_writes: Vec<PendingWrite>) -> Result<()> {
        if new_writes.is_empty() {
            return Ok(());
        }
        let thread_id = new_writes[0].thread_id.clone();
        let mut all = self.get_writes(&thread_id).await?;
        all.extend(new_writes);

        let data = bincode::serialize(&all).map_err(|e| CheckpointError::SerializationFailed {
            reason: format!("Failed to serialize pending writes: {e}"),
        })?;
        let path = self.writes_path(&thread_id);
        tokio::task::spawn_blocking(move || {
            atomic_write_file_sync(&path, &IntegrityFrame::wrap(&data)).map_err(CheckpointError::Io)
        })
        .await
        .map_err(|e| CheckpointError::Other(format!("Task join error saving writes: {e}")))??;
        Ok(())
    }

    async fn get_writes(&self, thread_id: &str) -> Result<Vec<PendingWrite>> {
        let path = self.writes_path(thread_id);
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(CheckpointError::Io)?;
        if !exists {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read(&path).await.map_err(CheckpointError::Io)?;
        let payload =
            IntegrityFrame::unwrap(&data).map_err(|e| CheckpointError::IntegrityCheckFailed {
                checkpoint_id: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let writes =
            bincode::deserialize(payload).map_err(|e| CheckpointError::DeserializationFailed {
                reason: format!("Failed to deserialize pending writes: {e}"),
            })?;
        Ok(writes)
    }

    async fn clear_writes(&self, thread_id: &str) -> Result<()> {
        let path = self.writes_path(thread_id);
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(CheckpointError::Io)?;
        if exists {
            tokio::fs::remove_file(&path)
                .await
                .map_err(CheckpointError::Io)?;
        }
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<ThreadInfo>> {
        let entries: Vec<(ThreadId, CheckpointId)> = {
            let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
            index
                .iter()
                .map(|(thread_id, (checkpoint_id, _))| (thread_id.clone(), checkpoint_id.clone()))
                .collect()
        };

        let mut thread_infos = Vec::with_capacity(entries.len());
        for (thread_id, checkpoint_id) in entries {
            let updated_at = match self.load(&checkpoint_id).await? {
                Some(cp) => cp.timestamp,
                None => continue,
            };
            thread_infos.push(ThreadInfo {
                thread_id,
                latest_checkpoint_id: checkpoint_id,
                updated_at,
                checkpoint_count: None,
            });
        }

        thread_infos.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(thread_infos)
    }
}

/// Serde support for `SystemTime`.
mod systemtime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{SystemTime, UNIX_EPOCH};

    #[derive(Serialize, Deserialize)]
    struct SystemTimeRepr {
        secs: u64,
        nanos: u32,
    }

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let duration = time
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?;
        let repr = SystemTimeRepr {
            secs: duration.as_secs(),
            nanos: duration.subsec_nanos(),
        };
        repr.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let repr = SystemTimeRepr::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + std::time::Duration::new(repr.secs, repr.nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct TestState {
        step: u32,
        note: String,
    }

    fn checkpoint(thread: &str, step: u32, parent: Option<String>) -> Checkpoint<TestState> {
        Checkpoint::new(
            thread.to_string(),
            TestState {
                step,
                note: format!("step-{step}"),
            },
            format!("node{step}"),
            u64::from(step),
            parent,
        )
    }

    #[test]
    fn integrity_frame_round_trip() {
        let payload = b"checkpoint payload bytes";
        let wrapped = IntegrityFrame::wrap(payload);
        assert_eq!(IntegrityFrame::unwrap(&wrapped).unwrap(), payload);
    }

    #[test]
    fn integrity_frame_detects_corruption() {
        let mut wrapped = IntegrityFrame::wrap(b"payload");
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0xFF;
        assert!(matches!(
            IntegrityFrame::unwrap(&wrapped),
            Err(IntegrityError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn integrity_frame_rejects_bad_magic() {
        let mut wrapped = IntegrityFrame::wrap(b"payload");
        wrapped[0] = b'X';
        assert!(matches!(
            IntegrityFrame::unwrap(&wrapped),
            Err(IntegrityError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn integrity_frame_rejects_truncated_header() {
        assert!(matches!(
            IntegrityFrame::unwrap(b"ACH"),
            Err(IntegrityError::FileTooSmall { .. })
        ));
    }

    #[tokio::test]
    async fn memory_checkpointer_chain_has_parent_links() {
        let cp: MemoryCheckpointer<TestState> = MemoryCheckpointer::new();

        let first = checkpoint("t1", 1, None);
        let first_id = first.id.clone();
        cp.save(first).await.unwrap();

        let second = checkpoint("t1", 2, Some(first_id.clone()));
        cp.save(second).await.unwrap();

        let latest = cp.get_latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.superstep, 2);
        assert_eq!(latest.parent_id, Some(first_id));
    }

    #[tokio::test]
    async fn memory_checkpointer_latest_prefers_higher_superstep() {
        let cp: MemoryCheckpointer<TestState> = MemoryCheckpointer::new();
        cp.save(checkpoint("t1", 3, None)).await.unwrap();
        cp.save(checkpoint("t1", 1, None)).await.unwrap();
        cp.save(checkpoint("t2", 9, None)).await.unwrap();

        let latest = cp.get_latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.superstep, 3);
    }

    #[tokio::test]
    async fn memory_checkpointer_pending_writes_round_trip() {
        let cp: MemoryCheckpointer<TestState> = MemoryCheckpointer::new();
        let write = PendingWrite {
            thread_id: "t1".to_string(),
            checkpoint_id: "c0".to_string(),
            task_id: PendingWrite::task_id_for("t1", 1, "detect"),
            idx: 0,
            channel: "state".to_string(),
            payload: vec![1, 2, 3],
        };
        cp.put_writes(vec![write.clone()]).await.unwrap();
        assert_eq!(cp.get_writes("t1").await.unwrap(), vec![write]);

        cp.clear_writes("t1").await.unwrap();
        assert!(cp.get_writes("t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_checkpointer_list_threads() {
        let cp: MemoryCheckpointer<TestState> = MemoryCheckpointer::new();
        cp.save(checkpoint("a", 1, None)).await.unwrap();
        cp.save(checkpoint("a", 2, None)).await.unwrap();
        cp.save(checkpoint("b", 1, None)).await.unwrap();

        let threads = cp.list_threads().await.unwrap();
        assert_eq!(threads.len(), 2);
        let a = threads.iter().find(|t| t.thread_id == "a").unwrap();
        assert_eq!(a.checkpoint_count, Some(2));
    }

    #[tokio::test]
    async fn file_checkpointer_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cp: FileCheckpointer<TestState> = FileCheckpointer::new(dir.path()).unwrap();

        let first = checkpoint("t1", 1, None);
        let id = first.id.clone();
        cp.save(first.clone()).await.unwrap();

        let loaded = cp.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.state, first.state);
        assert_eq!(loaded.superstep, 1);
    }

    #[tokio::test]
    async fn file_checkpointer_recovers_latest_without_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cp: FileCheckpointer<TestState> = FileCheckpointer::new(dir.path()).unwrap();
            cp.save(checkpoint("t1", 1, None)).await.unwrap();
            cp.save(checkpoint("t1", 2, None)).await.unwrap();
        }

        // Simulate index loss; a fresh instance must recover by scanning.
        std::fs::remove_file(dir.path().join("index.bin")).unwrap();
        let cp: FileCheckpointer<TestState> = FileCheckpointer::new(dir.path()).unwrap();
        let latest = cp.get_latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.superstep, 2);
    }

    #[tokio::test]
    async fn file_checkpointer_skips_corrupt_files_in_list() {
        let dir = tempfile::tempdir().unwrap();
        let cp: FileCheckpointer<TestState> = FileCheckpointer::new(dir.path()).unwrap();
        cp.save(checkpoint("t1", 1, None)).await.unwrap();

        std::fs::write(dir.path().join("garbage.bin"), b"not a checkpoint").unwrap();

        let listed = cp.list("t1").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn file_checkpointer_pending_writes_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let write = PendingWrite {
            thread_id: "t1".to_string(),
            checkpoint_id: "c0".to_string(),
            task_id: PendingWrite::task_id_for("t1", 1, "detect"),
            idx: 0,
            channel: "state".to_string(),
            payload: vec![9, 9],
        };
        {
            let cp: FileCheckpointer<TestState> = FileCheckpointer::new(dir.path()).unwrap();
            cp.put_writes(vec![write.clone()]).await.unwrap();
        }
        let cp: FileCheckpointer<TestState> = FileCheckpointer::new(dir.path()).unwrap();
        assert_eq!(cp.get_writes("t1").await.unwrap(), vec![write]);
    }

    #[test]
    fn checkpoint_ids_sort_with_supersteps() {
        let a = checkpoint("t", 1, None);
        let b = checkpoint("t", 2, None);
        assert!(b.id > a.id);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn integrity_frame_round_trips_arbitrary_payloads(
                payload in proptest::collection::vec(any::<u8>(), 0..2048)
            ) {
                let wrapped = IntegrityFrame::wrap(&payload);
                prop_assert_eq!(IntegrityFrame::unwrap(&wrapped).unwrap(), payload.as_slice());
            }

            #[test]
            fn integrity_frame_rejects_single_payload_bit_flips(
                payload in proptest::collection::vec(any::<u8>(), 1..512),
                flip_ix in 0usize..512,
                flip_bit in 0u8..8,
            ) {
                let wrapped = IntegrityFrame::wrap(&payload);
                let mut corrupted = wrapped.clone();
                let ix = CHECKPOINT_HEADER_SIZE + (flip_ix % payload.len());
                corrupted[ix] ^= 1 << flip_bit;
                prop_assert!(IntegrityFrame::unwrap(&corrupted).is_err());
            }
        }
    }
}
