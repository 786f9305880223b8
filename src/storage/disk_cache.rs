//! Journal-indexed, size-bounded LRU store of raw records.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::error::StorageError;
use super::journal::{self, is_valid_key, JournalOp, Replay};
use super::record::{Snapshot, Transaction};
use crate::constants::{JOURNAL_FILE, JOURNAL_FILE_TMP, JOURNAL_REBUILD_THRESHOLD, STAGED_SUFFIX};

#[derive(Debug, Clone, Copy)]
struct RecordEntry {
    size: u64,
    readable: bool,
    editing: bool,
    /// Removed while a write was open; deleted once the write settles.
    doomed: bool,
    tick: u64,
}

impl RecordEntry {
    fn new(tick: u64) -> Self {
        Self {
            size: 0,
            readable: false,
            editing: false,
            doomed: false,
            tick,
        }
    }

    fn is_visible(&self) -> bool {
        self.readable && !self.doomed
    }
}

struct IndexState {
    entries: HashMap<String, RecordEntry>,
    order: BTreeMap<u64, String>,
    next_tick: u64,
    size: u64,
    redundant_ops: usize,
    journal: BufWriter<fs::File>,
}

impl IndexState {
    fn touch(&mut self, key: &str) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key.to_string());
        }
    }

    fn forget(&mut self, key: &str) -> Option<RecordEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        if entry.readable {
            self.size -= entry.size;
        }
        Some(entry)
    }

    fn append(&mut self, op: &JournalOp) -> io::Result<()> {
        writeln!(self.journal, "{}", op)
    }
}

/// Persistent second tier and landing zone for downloads.
///
/// Committed records live in `<root>/<key>`; writes are staged in
/// `<root>/<key>.tmp` and renamed into place on commit, so readers only ever
/// see complete records. The index (`<root>/journal`) records LRU order and
/// sizes and is tied to a schema version: opening with a different version
/// discards everything.
///
/// Record payloads are read and written asynchronously. Index updates, and
/// the record deletions and index rewrites they trigger, run on the blocking
/// pool under the state lock.
pub struct DiskCache {
    dir: PathBuf,
    schema_version: u32,
    max_size: u64,
    state: Mutex<IndexState>,
}

impl DiskCache {
    /// Opens (or creates) the store under `dir`.
    pub async fn open(
        dir: impl Into<PathBuf>,
        schema_version: u32,
        max_size: u64,
    ) -> Result<Arc<Self>, StorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let journal_path = dir.join(JOURNAL_FILE);
        let ops = match tokio::fs::read_to_string(&journal_path).await {
            Ok(contents) => match journal::replay(&contents, schema_version) {
                Ok(Replay::Ops { ops, torn }) => {
                    if let Some(line) = torn {
                        warn!(dir = %dir.display(), line = %line, "dropping torn journal tail");
                    }
                    ops
                }
                Ok(Replay::Incompatible(reason)) => {
                    info!(dir = %dir.display(), %reason, "disk cache schema changed, discarding contents");
                    wipe_dir(&dir).await?;
                    Vec::new()
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "disk cache journal corrupt, discarding contents");
                    wipe_dir(&dir).await?;
                    Vec::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(dir = %dir.display(), "disk cache journal unreadable, discarding contents");
                wipe_dir(&dir).await?;
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let op_count = ops.len();
        let mut entries: HashMap<String, RecordEntry> = HashMap::new();
        let mut order = BTreeMap::new();
        let mut next_tick = 0u64;

        for op in ops {
            let tick = next_tick;
            next_tick += 1;
            match op {
                JournalOp::Dirty(key) => {
                    let entry = entries
                        .entry(key.clone())
                        .or_insert_with(|| RecordEntry::new(tick));
                    entry.editing = true;
                    order.remove(&entry.tick);
                    entry.tick = tick;
                    order.insert(tick, key);
                }
                JournalOp::Clean(key, size) => {
                    let entry = entries
                        .entry(key.clone())
                        .or_insert_with(|| RecordEntry::new(tick));
                    entry.size = size;
                    entry.readable = true;
                    entry.editing = false;
                    order.remove(&entry.tick);
                    entry.tick = tick;
                    order.insert(tick, key);
                }
                JournalOp::Read(key) => {
                    if let Some(entry) = entries.get_mut(&key) {
                        order.remove(&entry.tick);
                        entry.tick = tick;
                        order.insert(tick, key);
                    }
                }
                JournalOp::Remove(key) => {
                    if let Some(entry) = entries.remove(&key) {
                        order.remove(&entry.tick);
                    }
                }
            }
        }

        // Writes interrupted by a crash leave DIRTY entries behind.
        let interrupted: Vec<(String, RecordEntry)> = entries
            .iter()
            .filter(|(_, e)| e.editing)
            .map(|(k, e)| (k.clone(), *e))
            .collect();
        for (key, entry) in interrupted {
            remove_if_exists(&staged_path(&dir, &key)).await?;
            if entry.readable {
                if let Some(e) = entries.get_mut(&key) {
                    e.editing = false;
                }
            } else {
                remove_if_exists(&dir.join(&key)).await?;
                entries.remove(&key);
                order.remove(&entry.tick);
            }
            debug!(key = %key, "discarded interrupted write");
        }

        let size = entries.values().filter(|e| e.readable).map(|e| e.size).sum();

        let cache = tokio::task::spawn_blocking(move || -> Result<Self, StorageError> {
            // Rewriting the index also drops a torn tail for good.
            let journal = rebuild_journal(&dir, schema_version, &entries, &order)?;
            let cache = Self {
                dir,
                schema_version,
                max_size,
                state: Mutex::new(IndexState {
                    entries,
                    order,
                    next_tick,
                    size,
                    redundant_ops: 0,
                    journal,
                }),
            };
            {
                let mut state = cache.state.lock();
                cache.trim_to_size(&mut state)?;
                state.journal.flush()?;
                info!(
                    dir = %cache.dir.display(),
                    records = state.entries.len(),
                    bytes = state.size,
                    replayed = op_count,
                    "disk cache opened"
                );
            }
            Ok(cache)
        })
        .await
        .map_err(|e| StorageError::Io(io::Error::other(e)))??;

        Ok(Arc::new(cache))
    }

    /// Runs index work on the blocking pool.
    async fn with_index<R, F>(self: &Arc<Self>, work: F) -> Result<R, StorageError>
    where
        F: FnOnce(&DiskCache) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static,
    {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || work(&cache))
            .await
            .map_err(|e| StorageError::Io(io::Error::other(e)))?
    }

    /// Returns a snapshot of the committed record for `key`, if any.
    pub async fn read(self: &Arc<Self>, key: &str) -> Result<Option<Snapshot>, StorageError> {
        validate_key(key)?;

        let owned = key.to_string();
        let Some(size) = self.with_index(move |cache| cache.note_read(&owned)).await? else {
            return Ok(None);
        };

        match tokio::fs::File::open(self.record_path(key)).await {
            Ok(file) => Ok(Some(Snapshot::new(key.to_string(), size, file))),
            // Evicted between the index lookup and the open.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn note_read(&self, key: &str) -> Result<Option<u64>, StorageError> {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get(key).copied() else {
            return Ok(None);
        };
        if !entry.is_visible() {
            return Ok(None);
        }
        state.touch(key);
        state.append(&JournalOp::Read(key.to_string()))?;
        state.redundant_ops += 1;
        self.maybe_rebuild(&mut state)?;
        Ok(Some(entry.size))
    }

    /// Opens a staged write for `key`. Returns `None` while another write for
    /// the same key is open.
    pub async fn begin_write(
        self: &Arc<Self>,
        key: &str,
    ) -> Result<Option<Transaction>, StorageError> {
        validate_key(key)?;

        let owned = key.to_string();
        if !self.with_index(move |cache| cache.start_edit(&owned)).await? {
            return Ok(None);
        }

        match tokio::fs::File::create(self.staged_path(key)).await {
            Ok(file) => Ok(Some(Transaction::new(
                Arc::clone(self),
                key.to_string(),
                file,
            ))),
            Err(e) => {
                self.complete_edit(key, None).await?;
                Err(e.into())
            }
        }
    }

    fn start_edit(&self, key: &str) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        let tick = state.next_tick;
        let entry = state
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RecordEntry::new(tick));
        if entry.editing {
            return Ok(false);
        }
        entry.editing = true;
        if entry.tick == tick {
            state.next_tick += 1;
            state.order.insert(tick, key.to_string());
        }
        state.append(&JournalOp::Dirty(key.to_string()))?;
        // A DIRTY line must hit the file before any staged bytes do.
        state.journal.flush()?;
        Ok(true)
    }

    /// Settles an open write. `Some(size)` commits a record whose staged file
    /// has already been renamed into place; `None` abandons the write and
    /// keeps whatever was committed before.
    pub(crate) async fn complete_edit(
        self: &Arc<Self>,
        key: &str,
        committed: Option<u64>,
    ) -> Result<(), StorageError> {
        let key = key.to_string();
        self.with_index(move |cache| cache.settle_edit(&key, committed))
            .await
    }

    /// Blocking form of [`complete_edit`](Self::complete_edit).
    pub(crate) fn settle_edit(&self, key: &str, committed: Option<u64>) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get(key).copied() else {
            return Ok(());
        };

        match committed {
            Some(size) => {
                let previous = if entry.readable { entry.size } else { 0 };
                if let Some(e) = state.entries.get_mut(key) {
                    e.editing = false;
                    e.readable = true;
                    e.size = size;
                }
                state.size = state.size - previous + size;
                state.touch(key);
                state.append(&JournalOp::Clean(key.to_string(), size))?;
            }
            None if entry.readable => {
                if let Some(e) = state.entries.get_mut(key) {
                    e.editing = false;
                }
                state.append(&JournalOp::Clean(key.to_string(), entry.size))?;
            }
            None => {
                state.forget(key);
                state.append(&JournalOp::Remove(key.to_string()))?;
            }
        }
        state.redundant_ops += 1;

        if entry.doomed && state.entries.contains_key(key) {
            debug!(key = %key, "dropping record removed during its write");
            self.remove_entry(&mut state, key)?;
        }

        self.trim_to_size(&mut state)?;
        self.maybe_rebuild(&mut state)?;
        Ok(())
    }

    /// Deletes the committed record for `key`. Returns false if there was
    /// nothing to delete.
    ///
    /// A key with an open write is marked instead: whatever that write
    /// settles to, committed or not, is deleted as soon as it settles.
    pub async fn remove(self: &Arc<Self>, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_index(move |cache| cache.remove_now(&key)).await
    }

    fn remove_now(&self, key: &str) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        match state.entries.get_mut(key) {
            None => return Ok(false),
            Some(entry) if entry.editing => {
                let already = entry.doomed;
                entry.doomed = true;
                if !already {
                    debug!(key = %key, "record has an open write, removing it once the write settles");
                }
                return Ok(!already);
            }
            Some(entry) if !entry.readable => return Ok(false),
            Some(_) => {}
        }
        self.remove_entry(&mut state, key)?;
        self.maybe_rebuild(&mut state)?;
        Ok(true)
    }

    fn remove_entry(&self, state: &mut IndexState, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        state.forget(key);
        state.append(&JournalOp::Remove(key.to_string()))?;
        state.redundant_ops += 1;
        Ok(())
    }

    /// Forces buffered index lines to durable storage.
    pub async fn flush(self: &Arc<Self>) -> Result<(), StorageError> {
        self.with_index(|cache| {
            let mut state = cache.state.lock();
            state.journal.flush()?;
            state.journal.get_ref().sync_data()?;
            Ok(())
        })
        .await
    }

    fn trim_to_size(&self, state: &mut IndexState) -> Result<(), StorageError> {
        while state.size > self.max_size {
            let victim = state
                .order
                .values()
                .find(|key| {
                    state
                        .entries
                        .get(*key)
                        .is_some_and(|e| e.readable && !e.editing)
                })
                .cloned();
            let Some(key) = victim else {
                break;
            };
            debug!(key = %key, "disk cache eviction");
            self.remove_entry(state, &key)?;
        }
        Ok(())
    }

    fn maybe_rebuild(&self, state: &mut IndexState) -> Result<(), StorageError> {
        if state.redundant_ops >= JOURNAL_REBUILD_THRESHOLD
            && state.redundant_ops >= state.entries.len()
        {
            state.journal.flush()?;
            state.journal =
                rebuild_journal(&self.dir, self.schema_version, &state.entries, &state.order)?;
            state.redundant_ops = 0;
            debug!(records = state.entries.len(), "disk cache journal compacted");
        }
        Ok(())
    }

    pub fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    pub(crate) fn staged_path(&self, key: &str) -> PathBuf {
        staged_path(&self.dir, key)
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Bytes held by committed records.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Number of committed records.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.is_visible())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| e.is_visible())
    }

    /// True while a write for `key` is open.
    pub fn is_writing(&self, key: &str) -> bool {
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| e.editing)
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    if is_valid_key(key) {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

fn staged_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}{}", key, STAGED_SUFFIX))
}

async fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn wipe_dir(dir: &Path) -> Result<(), StorageError> {
    tokio::fs::remove_dir_all(dir).await?;
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// Writes a compact index holding one line per live entry, in LRU order,
/// swaps it in and returns an append handle to it.
fn rebuild_journal(
    dir: &Path,
    schema_version: u32,
    entries: &HashMap<String, RecordEntry>,
    order: &BTreeMap<u64, String>,
) -> Result<BufWriter<fs::File>, StorageError> {
    let tmp_path = dir.join(JOURNAL_FILE_TMP);
    {
        let mut out = BufWriter::new(fs::File::create(&tmp_path)?);
        out.write_all(journal::header(schema_version).as_bytes())?;
        for key in order.values() {
            let Some(entry) = entries.get(key) else {
                continue;
            };
            let op = if entry.editing {
                JournalOp::Dirty(key.clone())
            } else {
                JournalOp::Clean(key.clone(), entry.size)
            };
            writeln!(out, "{}", op)?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
    }

    let journal_path = dir.join(JOURNAL_FILE);
    fs::rename(&tmp_path, &journal_path)?;

    let file = fs::OpenOptions::new().append(true).open(&journal_path)?;
    Ok(BufWriter::new(file))
}
