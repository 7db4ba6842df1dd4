//! Size-bounded, journal-backed LRU store for downloaded bytes.
//!
//! Each entry holds `value_count` blobs stored as `<key>.<index>` in the cache directory. Writes
//! go through an [`Editor`] into `<key>.<index>.tmp` files that are renamed into place on commit,
//! so readers never observe a partially written value. Every state transition is appended to
//! the journal (see `disk_cache_journal`) which is replayed on open; entries whose edit never
//! completed are purged during replay.
//!
//! A single mutex guards the index, the running size and the journal writer. Blob bytes are
//! written by the editor without holding it.

use super::cache_key::CacheKey;
use super::disk_cache_journal::{
  self as journal, JournalHeader, JournalWriter, Record, JOURNAL_BACKUP_FILE, JOURNAL_FILE,
  JOURNAL_TMP_FILE,
};
use crate::error::{CacheError, Error, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default byte budget (10 MiB).
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Journal rewrite happens once this many superseded records accumulated (and they outnumber the
/// live entries).
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

/// READ records appended between two journal rewrites. Later hits only reorder in memory; the
/// next rewrite persists the order.
const MAX_READ_RECORDS_BETWEEN_REWRITES: usize = 2000;

/// Editor id used for DIRTY records seen during replay.
const REPLAY_EDITOR: u64 = u64::MAX;

/// Tunables for a [`DiskCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskCacheConfig {
  /// Total bytes of committed values kept before least-recently-used entries are evicted.
  pub max_bytes: u64,
  /// Opening a directory written with a different app version wipes it.
  pub app_version: u32,
  /// Number of blobs per entry.
  pub value_count: usize,
  /// When editing an existing entry, slots the editor never wrote keep their committed value.
  /// When false such a commit fails with [`CacheError::IncompleteEdit`].
  pub reuse_unwritten_slots: bool,
  /// `fsync` values and the journal on every commit.
  pub sync_on_commit: bool,
}

impl Default for DiskCacheConfig {
  fn default() -> Self {
    Self {
      max_bytes: DEFAULT_MAX_BYTES,
      app_version: 1,
      value_count: 1,
      reuse_unwritten_slots: true,
      sync_on_commit: false,
    }
  }
}

impl DiskCacheConfig {
  pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
    self.max_bytes = max_bytes;
    self
  }

  pub fn with_app_version(mut self, app_version: u32) -> Self {
    self.app_version = app_version;
    self
  }

  pub fn with_value_count(mut self, value_count: usize) -> Self {
    self.value_count = value_count;
    self
  }

  pub fn with_reuse_unwritten_slots(mut self, reuse: bool) -> Self {
    self.reuse_unwritten_slots = reuse;
    self
  }

  pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
    self.sync_on_commit = sync;
    self
  }
}

/// Handle to an open cache directory. Clones share the same underlying cache.
#[derive(Debug, Clone)]
pub struct DiskCache {
  inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
  directory: PathBuf,
  header: JournalHeader,
  config: DiskCacheConfig,
  state: Mutex<State>,
  next_editor_id: AtomicU64,
}

#[derive(Debug)]
struct State {
  /// `None` once closed.
  journal: Option<JournalWriter>,
  /// Iteration order is most-recently-used first.
  entries: LruCache<CacheKey, Entry>,
  size: u64,
  max_bytes: u64,
  redundant_ops: usize,
  read_records: usize,
  next_sequence: u64,
  #[cfg(test)]
  rebuilds: usize,
}

#[derive(Debug, Clone)]
struct Entry {
  lengths: Vec<u64>,
  readable: bool,
  editor: Option<u64>,
  /// Changes on every commit; lets a [`Snapshot`] detect that its entry moved on.
  sequence: u64,
}

impl Entry {
  fn pending(value_count: usize, editor: u64) -> Self {
    Self {
      lengths: vec![0; value_count],
      readable: false,
      editor: Some(editor),
      sequence: 0,
    }
  }

  fn total_len(&self) -> u64 {
    self.lengths.iter().sum()
  }
}

impl State {
  fn new(max_bytes: u64) -> Self {
    Self {
      journal: None,
      entries: LruCache::unbounded(),
      size: 0,
      max_bytes,
      redundant_ops: 0,
      read_records: 0,
      next_sequence: 1,
      #[cfg(test)]
      rebuilds: 0,
    }
  }

  fn journal_mut(&mut self) -> Result<&mut JournalWriter> {
    self
      .journal
      .as_mut()
      .ok_or(Error::Cache(CacheError::Closed))
  }

  fn needs_rebuild(&self) -> bool {
    self.redundant_ops >= REDUNDANT_OP_COMPACT_THRESHOLD
      && self.redundant_ops >= self.entries.len()
  }
}

/// Whether an [`Editor`] started from an existing committed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditState {
  Exists,
  Create,
}

/// Key and value lengths of a committed entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EntryInfo {
  #[serde(serialize_with = "serialize_key")]
  pub key: CacheKey,
  pub lengths: Vec<u64>,
}

fn serialize_key<S: serde::Serializer>(key: &CacheKey, s: S) -> std::result::Result<S::Ok, S::Error> {
  s.serialize_str(&key.to_hex())
}

impl DiskCache {
  /// Opens (or creates) the cache in `directory`.
  pub fn open(
    directory: impl Into<PathBuf>,
    app_version: u32,
    value_count: usize,
    max_bytes: u64,
  ) -> Result<Self> {
    Self::open_with_config(
      directory,
      DiskCacheConfig {
        max_bytes,
        app_version,
        value_count,
        ..DiskCacheConfig::default()
      },
    )
  }

  /// Opens (or creates) the cache in `directory`.
  ///
  /// An existing journal with a matching header is replayed. A journal written by another app
  /// version, another value count, or that cannot be parsed causes the directory to be wiped.
  pub fn open_with_config(directory: impl Into<PathBuf>, config: DiskCacheConfig) -> Result<Self> {
    let directory = directory.into();
    if config.value_count == 0 {
      return Err(Error::Other("disk cache value_count must be at least 1".to_string()));
    }
    if config.max_bytes == 0 {
      return Err(Error::Other("disk cache max_bytes must be positive".to_string()));
    }
    fs::create_dir_all(&directory)?;

    let inner = Arc::new(Inner {
      header: JournalHeader {
        app_version: config.app_version,
        value_count: config.value_count,
      },
      state: Mutex::new(State::new(config.max_bytes)),
      next_editor_id: AtomicU64::new(1),
      directory,
      config,
    });

    {
      let mut state = inner.state.lock();
      inner.restore_backup_journal()?;
      let journal_path = inner.directory.join(JOURNAL_FILE);
      let mut loaded = false;
      if journal_path.exists() {
        match inner.load(&mut state) {
          Ok(()) => loaded = true,
          Err(err) => {
            info!(
              directory = %inner.directory.display(),
              error = %err,
              "disk cache journal unusable; wiping cache directory"
            );
            *state = State::new(inner.config.max_bytes);
            wipe_directory(&inner.directory)?;
          }
        }
      }
      if !loaded {
        inner.rebuild_journal(&mut state)?;
      }
      inner.trim_to_size(&mut state)?;
      debug!(
        directory = %inner.directory.display(),
        entries = state.entries.len(),
        size = state.size,
        "disk cache opened"
      );
    }

    Ok(Self { inner })
  }

  /// The `(app_version, value_count)` recorded in the journal under `directory`, without opening
  /// (and so without wiping) the cache. `None` when there is no journal of this format.
  pub fn stored_version(directory: &Path) -> Result<Option<(u32, usize)>> {
    let header = journal::read_header(&directory.join(JOURNAL_FILE))?;
    Ok(header.map(|h| (h.app_version, h.value_count)))
  }

  /// Returns a snapshot of the committed entry for `key`, or `None` when absent, not yet
  /// committed, or when a backing file has gone missing (the broken entry is removed).
  pub fn get(&self, key: &CacheKey) -> Result<Option<Snapshot>> {
    self.inner.get(key)
  }

  /// Reads value `index` of `key` in full.
  ///
  /// A value whose length no longer matches the journal, or that cannot be read, is treated as
  /// corrupt: the entry is removed and `None` returned.
  pub fn read_entry(&self, key: &CacheKey, index: usize) -> Result<Option<Vec<u8>>> {
    self.inner.check_index(index)?;
    let Some(mut snapshot) = self.get(key)? else {
      return Ok(None);
    };
    match snapshot.read(index) {
      Ok(bytes) => Ok(Some(bytes)),
      Err(err) => {
        warn!(key = %key, error = %err, "corrupt disk cache entry; removing");
        let sequence = snapshot.sequence;
        drop(snapshot);
        // A commit that landed since the snapshot replaced the corrupt values.
        self.inner.remove_if_current(key, sequence)?;
        Ok(None)
      }
    }
  }

  /// Starts an edit of `key`. `None` when another editor is live for the key.
  pub fn edit(&self, key: &CacheKey) -> Result<Option<Editor>> {
    self.inner.edit_if(key, None)
  }

  /// Like [`edit`](Self::edit) but reports a busy key as [`CacheError::ConcurrentEdit`].
  pub fn try_edit(&self, key: &CacheKey) -> Result<Editor> {
    self.edit(key)?.ok_or_else(|| {
      Error::Cache(CacheError::ConcurrentEdit {
        key: key.to_string(),
      })
    })
  }

  /// Removes a committed entry. Returns false when absent or currently being edited.
  pub fn remove(&self, key: &CacheKey) -> Result<bool> {
    let mut state = self.inner.state.lock();
    state.journal_mut()?;
    let removed = self.inner.remove_locked(&mut state, key)?;
    if removed {
      self.inner.compact_if_needed(&mut state);
    }
    Ok(removed)
  }

  /// Removes every committed entry that is not being edited. Returns how many were removed.
  pub fn clear(&self) -> Result<usize> {
    let mut state = self.inner.state.lock();
    state.journal_mut()?;
    let keys: Vec<CacheKey> = state
      .entries
      .iter()
      .filter(|(_, entry)| entry.readable && entry.editor.is_none())
      .map(|(key, _)| *key)
      .collect();
    for key in &keys {
      self.inner.drop_entry_locked(&mut state, key)?;
    }
    self.inner.compact(&mut state);
    Ok(keys.len())
  }

  /// Total bytes of committed values.
  pub fn size(&self) -> u64 {
    self.inner.state.lock().size
  }

  pub fn max_size(&self) -> u64 {
    self.inner.state.lock().max_bytes
  }

  /// Changes the byte budget, evicting immediately when it shrank.
  pub fn set_max_size(&self, max_bytes: u64) -> Result<()> {
    let mut state = self.inner.state.lock();
    state.journal_mut()?;
    state.max_bytes = max_bytes;
    self.inner.trim_to_size(&mut state)
  }

  /// Number of committed entries.
  pub fn len(&self) -> usize {
    let state = self.inner.state.lock();
    state.entries.iter().filter(|(_, e)| e.readable).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Committed entries from least to most recently used.
  pub fn entries(&self) -> Vec<EntryInfo> {
    let state = self.inner.state.lock();
    state
      .entries
      .iter()
      .rev()
      .filter(|(_, e)| e.readable)
      .map(|(key, e)| EntryInfo {
        key: *key,
        lengths: e.lengths.clone(),
      })
      .collect()
  }

  pub fn directory(&self) -> &Path {
    &self.inner.directory
  }

  pub fn config(&self) -> &DiskCacheConfig {
    &self.inner.config
  }

  pub fn is_closed(&self) -> bool {
    self.inner.state.lock().journal.is_none()
  }

  /// Forces buffered journal records to stable storage.
  pub fn flush(&self) -> Result<()> {
    let mut state = self.inner.state.lock();
    state.journal_mut()?.sync()?;
    Ok(())
  }

  /// Aborts live editors, flushes the journal and releases it. Later operations fail with
  /// [`CacheError::Closed`]. Closing twice is a no-op.
  pub fn close(&self) -> Result<()> {
    let mut state = self.inner.state.lock();
    if state.journal.is_none() {
      return Ok(());
    }
    let result = self.inner.close_locked(&mut state);
    state.journal = None;
    result
  }

  /// Closes the cache and deletes its directory.
  pub fn delete(&self) -> Result<()> {
    let closed = self.close();
    match fs::remove_dir_all(&self.inner.directory) {
      Ok(()) => {}
      Err(err) if err.kind() == io::ErrorKind::NotFound => {}
      Err(err) => return Err(err.into()),
    }
    closed
  }

  #[cfg(test)]
  fn debug_rebuilds(&self) -> usize {
    self.inner.state.lock().rebuilds
  }
}

impl Inner {
  fn clean_path(&self, key: &CacheKey, index: usize) -> PathBuf {
    self.directory.join(format!("{key}.{index}"))
  }

  fn dirty_path(&self, key: &CacheKey, index: usize) -> PathBuf {
    tmp_path(&self.clean_path(key, index))
  }

  fn check_index(&self, index: usize) -> Result<()> {
    if index >= self.config.value_count {
      return Err(Error::Cache(CacheError::InvalidIndex {
        index,
        value_count: self.config.value_count,
      }));
    }
    Ok(())
  }

  /// A backup only survives a crash between the two renames of a journal rewrite.
  fn restore_backup_journal(&self) -> Result<()> {
    let backup = self.directory.join(JOURNAL_BACKUP_FILE);
    if !backup.exists() {
      return Ok(());
    }
    let journal_path = self.directory.join(JOURNAL_FILE);
    if journal_path.exists() {
      fs::remove_file(&backup)?;
    } else {
      fs::rename(&backup, &journal_path)?;
    }
    Ok(())
  }

  fn load(&self, state: &mut State) -> Result<()> {
    let journal_path = self.directory.join(JOURNAL_FILE);
    let value_count = self.config.value_count;
    let entries = &mut state.entries;
    let summary = journal::replay(&journal_path, self.header, |record| {
      apply_record(entries, record, value_count)
    })?;
    self.process_replayed(state)?;
    state.redundant_ops = summary.records.saturating_sub(state.entries.len());
    if summary.truncated_tail {
      self.rebuild_journal(state)?;
    } else {
      state.journal = Some(JournalWriter::open_append(&journal_path)?);
    }
    Ok(())
  }

  /// Computes the size of replayed entries, purges edits that never completed and deletes files
  /// that no journaled entry owns.
  fn process_replayed(&self, state: &mut State) -> Result<()> {
    remove_if_exists(&self.directory.join(JOURNAL_TMP_FILE))?;

    let mut interrupted = Vec::new();
    let mut size = 0u64;
    for (key, entry) in state.entries.iter() {
      if entry.editor.is_some() {
        interrupted.push(*key);
      } else {
        size += entry.total_len();
      }
    }
    for key in interrupted {
      state.entries.pop(&key);
      for index in 0..self.config.value_count {
        remove_if_exists(&self.clean_path(&key, index))?;
        remove_if_exists(&self.dirty_path(&key, index))?;
      }
      debug!(key = %key, "purged interrupted disk cache edit");
    }
    state.size = size;

    for dir_entry in fs::read_dir(&self.directory)?.flatten() {
      let name = dir_entry.file_name();
      let Some(name) = name.to_str() else {
        continue;
      };
      if name == JOURNAL_FILE {
        continue;
      }
      let orphan = if name.ends_with(".tmp") {
        true
      } else {
        match parse_value_file_name(name) {
          Some((key, index)) => index >= self.config.value_count || !state.entries.contains(&key),
          None => false,
        }
      };
      if orphan {
        remove_if_exists(&dir_entry.path())?;
      }
    }
    Ok(())
  }

  /// Writes a compact journal reflecting the current index and swaps it in.
  ///
  /// The current writer stays in place until the new journal is open, so a failed rewrite leaves
  /// the cache appending to the old journal.
  fn rebuild_journal(&self, state: &mut State) -> Result<()> {
    if let Some(writer) = state.journal.as_mut() {
      writer.flush()?;
    }
    let tmp = self.directory.join(JOURNAL_TMP_FILE);
    let records = state.entries.iter().rev().flat_map(|(key, entry)| {
      let clean = entry
        .readable
        .then(|| Record::Clean(*key, entry.lengths.clone()));
      let dirty = entry.editor.map(|_| Record::Dirty(*key));
      clean.into_iter().chain(dirty)
    });
    if let Err(err) = journal::write_journal(&tmp, self.header, records) {
      let _ = remove_if_exists(&tmp);
      return Err(err.into());
    }

    let journal_path = self.directory.join(JOURNAL_FILE);
    let backup = self.directory.join(JOURNAL_BACKUP_FILE);
    let had_journal = journal_path.exists();
    if had_journal {
      fs::rename(&journal_path, &backup)?;
    }
    // From here on a failure puts the old journal back; the old writer's handle follows it.
    let swapped = fs::rename(&tmp, &journal_path)
      .and_then(|()| JournalWriter::open_append(&journal_path));
    let writer = match swapped {
      Ok(writer) => writer,
      Err(err) => {
        if had_journal {
          fs::rename(&backup, &journal_path)?;
        }
        let _ = remove_if_exists(&tmp);
        return Err(err.into());
      }
    };
    state.journal = Some(writer);
    if let Err(err) = remove_if_exists(&backup) {
      debug!(error = %err, "failed to delete journal backup");
    }

    state.redundant_ops = 0;
    state.read_records = 0;
    #[cfg(test)]
    {
      state.rebuilds += 1;
    }
    debug!(
      directory = %self.directory.display(),
      entries = state.entries.len(),
      "disk cache journal rewritten"
    );
    Ok(())
  }

  /// Rewrites the journal, logging a failure instead of returning it. The records already
  /// appended stay valid, so the cache keeps working on the longer journal and the next
  /// operation over the threshold retries.
  fn compact(&self, state: &mut State) {
    if let Err(err) = self.rebuild_journal(state) {
      warn!(
        directory = %self.directory.display(),
        error = %err,
        "disk cache journal rewrite failed; keeping current journal"
      );
    }
  }

  fn compact_if_needed(&self, state: &mut State) {
    if state.needs_rebuild() {
      self.compact(state);
    }
  }

  /// Removes `key` if it is still the entry with `sequence` and nobody is editing it.
  fn remove_if_current(&self, key: &CacheKey, sequence: u64) -> Result<bool> {
    let mut state = self.state.lock();
    state.journal_mut()?;
    match state.entries.peek(key) {
      Some(entry) if entry.readable && entry.sequence == sequence => {}
      _ => return Ok(false),
    }
    let removed = self.remove_locked(&mut state, key)?;
    if removed {
      self.compact_if_needed(&mut state);
    }
    Ok(removed)
  }

  fn get(self: &Arc<Self>, key: &CacheKey) -> Result<Option<Snapshot>> {
    let mut state = self.state.lock();
    state.journal_mut()?;
    let (lengths, sequence) = match state.entries.get(key) {
      Some(entry) if entry.readable => (entry.lengths.clone(), entry.sequence),
      _ => return Ok(None),
    };

    let mut files = Vec::with_capacity(lengths.len());
    for index in 0..lengths.len() {
      match File::open(self.clean_path(key, index)) {
        Ok(file) => files.push(file),
        Err(err) => {
          warn!(key = %key, index, error = %err, "disk cache value missing; removing entry");
          self.remove_locked(&mut state, key)?;
          return Ok(None);
        }
      }
    }

    state.redundant_ops += 1;
    if state.read_records < MAX_READ_RECORDS_BETWEEN_REWRITES {
      state.read_records += 1;
      state.journal_mut()?.append(&Record::Read(*key))?;
    }
    self.compact_if_needed(&mut state);

    Ok(Some(Snapshot {
      cache: Arc::clone(self),
      key: *key,
      sequence,
      lengths,
      files,
    }))
  }

  fn edit_if(self: &Arc<Self>, key: &CacheKey, expected_sequence: Option<u64>) -> Result<Option<Editor>> {
    let mut state = self.state.lock();
    state.journal_mut()?;

    match state.entries.peek(key) {
      Some(entry) => {
        if entry.editor.is_some() {
          return Ok(None);
        }
        if let Some(sequence) = expected_sequence {
          if !entry.readable || entry.sequence != sequence {
            return Ok(None);
          }
        }
      }
      None if expected_sequence.is_some() => return Ok(None),
      None => {}
    }

    let id = self.next_editor_id.fetch_add(1, Ordering::Relaxed);
    let readable = match state.entries.peek_mut(key) {
      Some(entry) => {
        entry.editor = Some(id);
        entry.readable
      }
      None => {
        state
          .entries
          .put(*key, Entry::pending(self.config.value_count, id));
        false
      }
    };

    // DIRTY must reach the file before any temp file exists so replay can clean up after a crash.
    if let Err(err) = state.journal_mut()?.append_and_flush(&Record::Dirty(*key)) {
      if readable {
        if let Some(entry) = state.entries.peek_mut(key) {
          entry.editor = None;
        }
      } else {
        state.entries.pop(key);
      }
      return Err(err.into());
    }

    Ok(Some(Editor {
      cache: Arc::clone(self),
      key: *key,
      id,
      state: if readable {
        EditState::Exists
      } else {
        EditState::Create
      },
      written: vec![false; self.config.value_count],
      finished: false,
    }))
  }

  fn complete_edit(&self, key: &CacheKey, id: u64, written: &[bool], success: bool) -> Result<()> {
    if success && self.config.sync_on_commit {
      for (index, _) in written.iter().enumerate().filter(|(_, w)| **w) {
        if let Ok(file) = File::open(self.dirty_path(key, index)) {
          file.sync_all()?;
        }
      }
    }

    let mut state = self.state.lock();
    let owns = matches!(state.entries.peek(key), Some(entry) if entry.editor == Some(id));
    if !owns {
      self.discard_dirty(key);
      if !success {
        return Ok(());
      }
      return Err(Error::Cache(if state.journal.is_none() {
        CacheError::Closed
      } else {
        CacheError::StaleEditor {
          key: key.to_string(),
        }
      }));
    }

    let (readable, prior_lengths) = match state.entries.peek(key) {
      Some(entry) => (entry.readable, entry.lengths.clone()),
      None => return Ok(()),
    };

    let mut failure = None;
    if success {
      for index in 0..self.config.value_count {
        let has_value = written[index] && self.dirty_path(key, index).exists();
        if !has_value && (!readable || !self.config.reuse_unwritten_slots) {
          failure = Some(CacheError::IncompleteEdit {
            key: key.to_string(),
            index,
          });
          break;
        }
      }
    }
    if !success || failure.is_some() {
      self.discard_dirty(key);
      self.close_out_edit(&mut state, key)?;
      return match failure {
        Some(err) => Err(err.into()),
        None => Ok(()),
      };
    }

    let lengths = match self.publish_values(key, written, &prior_lengths) {
      Ok(lengths) => lengths,
      Err(err) => {
        warn!(key = %key, error = %err, "disk cache commit failed; dropping entry");
        self.discard_dirty(key);
        self.drop_entry_locked(&mut state, key)?;
        return Err(err);
      }
    };

    let old_total: u64 = prior_lengths.iter().sum();
    let new_total: u64 = lengths.iter().sum();
    state.size = state.size.saturating_sub(old_total) + new_total;
    let sequence = state.next_sequence;
    state.next_sequence += 1;
    if let Some(entry) = state.entries.get_mut(key) {
      entry.lengths = lengths.clone();
      entry.readable = true;
      entry.editor = None;
      entry.sequence = sequence;
    }
    state.redundant_ops += 1;

    let writer = state.journal_mut()?;
    if let Err(err) = writer.append_and_flush(&Record::Clean(*key, lengths)) {
      // Without CLEAN the entry would vanish on replay; take it out now so `Err` means absent.
      warn!(key = %key, error = %err, "disk cache commit not journaled; dropping entry");
      self.forget_entry_locked(&mut state, key);
      return Err(err.into());
    }
    if self.config.sync_on_commit {
      if let Err(err) = writer.sync() {
        warn!(key = %key, error = %err, "disk cache journal sync failed");
      }
    }

    // The entry is committed; failures past this point only affect other entries.
    if let Err(err) = self.trim_to_size(&mut state) {
      warn!(key = %key, error = %err, "disk cache eviction failed after commit");
    }
    self.compact_if_needed(&mut state);
    Ok(())
  }

  /// Drops an entry from the index and deletes its values without journaling.
  fn forget_entry_locked(&self, state: &mut State, key: &CacheKey) {
    if let Some(entry) = state.entries.pop(key) {
      state.size = state.size.saturating_sub(entry.total_len());
    }
    for index in 0..self.config.value_count {
      if let Err(err) = remove_if_exists(&self.clean_path(key, index)) {
        debug!(key = %key, index, error = %err, "failed to delete disk cache value");
      }
    }
  }

  /// Renames written temp files into place, returning the entry's new value lengths.
  fn publish_values(&self, key: &CacheKey, written: &[bool], prior: &[u64]) -> Result<Vec<u64>> {
    let mut lengths = prior.to_vec();
    for index in 0..self.config.value_count {
      let dirty = self.dirty_path(key, index);
      if !written[index] || !dirty.exists() {
        continue;
      }
      let clean = self.clean_path(key, index);
      fs::rename(&dirty, &clean)?;
      lengths[index] = fs::metadata(&clean)?.len();
    }
    Ok(lengths)
  }

  fn discard_dirty(&self, key: &CacheKey) {
    for index in 0..self.config.value_count {
      if let Err(err) = remove_if_exists(&self.dirty_path(key, index)) {
        debug!(key = %key, index, error = %err, "failed to delete disk cache temp file");
      }
    }
  }

  /// Releases the edit lock without publishing and closes the DIRTY record with the entry's
  /// prior state.
  fn close_out_edit(&self, state: &mut State, key: &CacheKey) -> Result<()> {
    let record = match state.entries.peek_mut(key) {
      Some(entry) if entry.readable => {
        entry.editor = None;
        Record::Clean(*key, entry.lengths.clone())
      }
      Some(_) => {
        state.entries.pop(key);
        Record::Remove(*key)
      }
      None => return Ok(()),
    };
    state.redundant_ops += 1;
    state.journal_mut()?.append_and_flush(&record)?;
    Ok(())
  }

  fn remove_locked(&self, state: &mut State, key: &CacheKey) -> Result<bool> {
    match state.entries.peek(key) {
      Some(entry) if entry.editor.is_none() => {}
      _ => return Ok(false),
    }
    self.drop_entry_locked(state, key)?;
    Ok(true)
  }

  /// Deletes an entry's values and journals the removal, regardless of edit state.
  fn drop_entry_locked(&self, state: &mut State, key: &CacheKey) -> Result<()> {
    if !state.entries.contains(key) {
      return Ok(());
    }
    for index in 0..self.config.value_count {
      remove_if_exists(&self.clean_path(key, index))?;
    }
    if let Some(entry) = state.entries.pop(key) {
      state.size = state.size.saturating_sub(entry.total_len());
    }
    state.redundant_ops += 1;
    state.journal_mut()?.append_and_flush(&Record::Remove(*key))?;
    Ok(())
  }

  /// Evicts least-recently-used committed entries that are not being edited until the cache fits
  /// its budget.
  fn trim_to_size(&self, state: &mut State) -> Result<()> {
    while state.size > state.max_bytes {
      let victim = state
        .entries
        .iter()
        .rev()
        .find(|(_, entry)| entry.readable && entry.editor.is_none())
        .map(|(key, _)| *key);
      let Some(key) = victim else {
        break;
      };
      debug!(key = %key, size = state.size, max = state.max_bytes, "evicting disk cache entry");
      self.drop_entry_locked(state, &key)?;
    }
    Ok(())
  }

  fn close_locked(&self, state: &mut State) -> Result<()> {
    let editing: Vec<CacheKey> = state
      .entries
      .iter()
      .filter(|(_, entry)| entry.editor.is_some())
      .map(|(key, _)| *key)
      .collect();
    for key in &editing {
      self.discard_dirty(key);
      self.close_out_edit(state, key)?;
    }
    self.trim_to_size(state)?;
    state.journal_mut()?.sync()?;
    Ok(())
  }
}

fn apply_record(entries: &mut LruCache<CacheKey, Entry>, record: Record, value_count: usize) {
  match record {
    Record::Dirty(key) => match entries.peek_mut(&key) {
      Some(entry) => entry.editor = Some(REPLAY_EDITOR),
      None => {
        entries.put(key, Entry::pending(value_count, REPLAY_EDITOR));
      }
    },
    Record::Clean(key, lengths) => match entries.get_mut(&key) {
      Some(entry) => {
        entry.lengths = lengths;
        entry.readable = true;
        entry.editor = None;
      }
      None => {
        entries.put(
          key,
          Entry {
            lengths,
            readable: true,
            editor: None,
            sequence: 0,
          },
        );
      }
    },
    Record::Remove(key) => {
      entries.pop(&key);
    }
    Record::Read(key) => {
      entries.promote(&key);
    }
  }
}

/// Exclusive handle for writing one entry.
///
/// Dropping an editor without calling [`commit`](Self::commit) or [`abort`](Self::abort) aborts
/// it.
#[derive(Debug)]
pub struct Editor {
  cache: Arc<Inner>,
  key: CacheKey,
  id: u64,
  state: EditState,
  written: Vec<bool>,
  finished: bool,
}

impl Editor {
  pub fn key(&self) -> CacheKey {
    self.key
  }

  pub fn state(&self) -> EditState {
    self.state
  }

  /// Opens a writer for value `index`. Bytes land in a temp file until commit.
  pub fn new_writer(&mut self, index: usize) -> Result<BufWriter<File>> {
    self.cache.check_index(index)?;
    let path = self.cache.dirty_path(&self.key, index);
    let file = match File::create(&path) {
      Ok(file) => file,
      Err(err) if err.kind() == io::ErrorKind::NotFound => {
        // The directory was deleted underneath us.
        fs::create_dir_all(&self.cache.directory)?;
        File::create(&path)?
      }
      Err(err) => return Err(err.into()),
    };
    self.written[index] = true;
    Ok(BufWriter::new(file))
  }

  /// Writes all of `bytes` as value `index`.
  pub fn set(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
    let mut writer = self.new_writer(index)?;
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(())
  }

  /// The committed value this editor started from, if any.
  pub fn read_committed(&self, index: usize) -> Result<Option<Vec<u8>>> {
    self.cache.check_index(index)?;
    if self.state == EditState::Create {
      return Ok(None);
    }
    match fs::read(self.cache.clean_path(&self.key, index)) {
      Ok(bytes) => Ok(Some(bytes)),
      Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(err) => Err(err.into()),
    }
  }

  /// Publishes the written values atomically and releases the edit lock.
  pub fn commit(mut self) -> Result<()> {
    self.finished = true;
    self
      .cache
      .complete_edit(&self.key, self.id, &self.written, true)
  }

  /// Discards everything written and releases the edit lock.
  pub fn abort(mut self) -> Result<()> {
    self.finished = true;
    self
      .cache
      .complete_edit(&self.key, self.id, &self.written, false)
  }
}

impl Drop for Editor {
  fn drop(&mut self) {
    if self.finished {
      return;
    }
    if let Err(err) = self
      .cache
      .complete_edit(&self.key, self.id, &self.written, false)
    {
      debug!(key = %self.key, error = %err, "abandoned disk cache edit could not be aborted");
    }
  }
}

/// Point-in-time view of a committed entry.
///
/// Holds open handles to the value files, so a concurrent commit or eviction of the same key does
/// not change what the snapshot reads.
#[derive(Debug)]
pub struct Snapshot {
  cache: Arc<Inner>,
  key: CacheKey,
  sequence: u64,
  lengths: Vec<u64>,
  files: Vec<File>,
}

impl Snapshot {
  pub fn key(&self) -> CacheKey {
    self.key
  }

  /// Length of value `index` as recorded at commit.
  pub fn value_len(&self, index: usize) -> Option<u64> {
    self.lengths.get(index).copied()
  }

  pub fn file(&self, index: usize) -> Option<&File> {
    self.files.get(index)
  }

  /// Reads value `index` from the start. Fails when the file holds fewer or more bytes than
  /// were committed.
  pub fn read(&mut self, index: usize) -> Result<Vec<u8>> {
    self.cache.check_index(index)?;
    let expected = self.lengths[index];
    let file = &mut self.files[index];
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::with_capacity(usize::try_from(expected).unwrap_or(0));
    file.read_to_end(&mut bytes)?;
    if bytes.len() as u64 != expected {
      return Err(
        io::Error::new(
          io::ErrorKind::InvalidData,
          format!(
            "value {index} of {} holds {} bytes, journal says {expected}",
            self.key,
            bytes.len()
          ),
        )
        .into(),
      );
    }
    Ok(bytes)
  }

  /// Starts an edit only if the entry is unchanged since this snapshot was taken.
  pub fn edit(&self) -> Result<Option<Editor>> {
    self.cache.edit_if(&self.key, Some(self.sequence))
  }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
  let mut name = path.as_os_str().to_owned();
  name.push(suffix);
  PathBuf::from(name)
}

fn tmp_path(path: &Path) -> PathBuf {
  append_suffix(path, ".tmp")
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
  match fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(err) => Err(err),
  }
}

fn wipe_directory(directory: &Path) -> io::Result<()> {
  match fs::remove_dir_all(directory) {
    Ok(()) => {}
    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
    Err(err) => return Err(err),
  }
  fs::create_dir_all(directory)
}

/// Parses `<key>.<index>`.
fn parse_value_file_name(name: &str) -> Option<(CacheKey, usize)> {
  let (key, index) = name.split_once('.')?;
  Some((key.parse().ok()?, index.parse().ok()?))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(name: &str) -> CacheKey {
    CacheKey::for_source(name)
  }

  fn open(dir: &Path, max_bytes: u64) -> DiskCache {
    DiskCache::open(dir, 1, 1, max_bytes).unwrap()
  }

  fn put(cache: &DiskCache, k: &CacheKey, bytes: &[u8]) {
    let mut editor = cache.edit(k).unwrap().expect("editor available");
    editor.set(0, bytes).unwrap();
    editor.commit().unwrap();
  }

  fn read(cache: &DiskCache, k: &CacheKey) -> Option<Vec<u8>> {
    cache.read_entry(k, 0).unwrap()
  }

  #[test]
  fn commit_then_get_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 1024);
    let k = key("a");
    assert!(cache.get(&k).unwrap().is_none());
    put(&cache, &k, b"hello");
    let mut snapshot = cache.get(&k).unwrap().unwrap();
    assert_eq!(snapshot.value_len(0), Some(5));
    assert_eq!(snapshot.read(0).unwrap(), b"hello");
    assert_eq!(cache.size(), 5);
    assert!(dir.path().join(format!("{k}.0")).exists());
  }

  #[test]
  fn uncommitted_entry_is_invisible() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 1024);
    let k = key("a");
    let mut editor = cache.edit(&k).unwrap().unwrap();
    editor.set(0, b"partial").unwrap();
    assert!(cache.get(&k).unwrap().is_none());
    editor.commit().unwrap();
    assert_eq!(read(&cache, &k).unwrap(), b"partial");
  }

  #[test]
  fn second_editor_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 1024);
    let k = key("a");
    let editor = cache.edit(&k).unwrap().unwrap();
    assert!(cache.edit(&k).unwrap().is_none());
    let err = cache.try_edit(&k).unwrap_err();
    assert!(matches!(err, Error::Cache(CacheError::ConcurrentEdit { .. })));
    editor.abort().unwrap();
    assert!(cache.edit(&k).unwrap().is_some());
  }

  #[test]
  fn snapshot_sees_pre_edit_value() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 1024);
    let k = key("a");
    put(&cache, &k, b"old");
    let mut before = cache.get(&k).unwrap().unwrap();
    let mut editor = cache.edit(&k).unwrap().unwrap();
    assert_eq!(editor.state(), EditState::Exists);
    assert_eq!(editor.read_committed(0).unwrap().unwrap(), b"old");
    editor.set(0, b"newer").unwrap();
    assert_eq!(read(&cache, &k).unwrap(), b"old");
    editor.commit().unwrap();
    assert_eq!(before.read(0).unwrap(), b"old");
    assert_eq!(read(&cache, &k).unwrap(), b"newer");
    assert_eq!(cache.size(), 5);
  }

  #[test]
  fn snapshot_edit_requires_unchanged_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 1024);
    let k = key("a");
    put(&cache, &k, b"one");
    let snapshot = cache.get(&k).unwrap().unwrap();
    put(&cache, &k, b"two");
    assert!(snapshot.edit().unwrap().is_none());
    let fresh = cache.get(&k).unwrap().unwrap();
    let editor = fresh.edit().unwrap();
    assert!(editor.is_some());
  }

  #[test]
  fn incomplete_create_fails_and_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let cache = DiskCache::open(dir.path(), 1, 2, 1024).unwrap();
    let k = key("a");
    let mut editor = cache.edit(&k).unwrap().unwrap();
    editor.set(0, b"only first").unwrap();
    let err = editor.commit().unwrap_err();
    assert!(matches!(
      err,
      Error::Cache(CacheError::IncompleteEdit { index: 1, .. })
    ));
    assert!(cache.get(&k).unwrap().is_none());
    assert!(!dir.path().join(format!("{k}.0.tmp")).exists());
    assert!(cache.edit(&k).unwrap().is_some());
  }

  #[test]
  fn unwritten_slot_reuses_prior_value() {
    let dir = tempfile::tempdir().unwrap();
    let cache = DiskCache::open(dir.path(), 1, 2, 1024).unwrap();
    let k = key("a");
    let mut editor = cache.edit(&k).unwrap().unwrap();
    editor.set(0, b"body").unwrap();
    editor.set(1, b"meta").unwrap();
    editor.commit().unwrap();

    let mut editor = cache.edit(&k).unwrap().unwrap();
    editor.set(0, b"new body").unwrap();
    editor.commit().unwrap();
    assert_eq!(cache.read_entry(&k, 0).unwrap().unwrap(), b"new body");
    assert_eq!(cache.read_entry(&k, 1).unwrap().unwrap(), b"meta");
    assert_eq!(cache.size(), 12);
  }

  #[test]
  fn strict_slots_reject_partial_update() {
    let dir = tempfile::tempdir().unwrap();
    let config = DiskCacheConfig::default()
      .with_value_count(2)
      .with_reuse_unwritten_slots(false);
    let cache = DiskCache::open_with_config(dir.path(), config).unwrap();
    let k = key("a");
    let mut editor = cache.edit(&k).unwrap().unwrap();
    editor.set(0, b"body").unwrap();
    editor.set(1, b"meta").unwrap();
    editor.commit().unwrap();

    let mut editor = cache.edit(&k).unwrap().unwrap();
    editor.set(1, b"meta2").unwrap();
    assert!(editor.commit().is_err());
    assert_eq!(cache.read_entry(&k, 1).unwrap().unwrap(), b"meta");
  }

  #[test]
  fn dropped_editor_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 1024);
    let k = key("a");
    {
      let mut editor = cache.edit(&k).unwrap().unwrap();
      editor.set(0, b"lost").unwrap();
    }
    assert!(cache.get(&k).unwrap().is_none());
    assert!(!dir.path().join(format!("{k}.0.tmp")).exists());
    assert!(cache.edit(&k).unwrap().is_some());
  }

  #[test]
  fn eviction_keeps_size_within_budget() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 10);
    put(&cache, &key("a"), b"aaaa");
    put(&cache, &key("b"), b"bbbb");
    // Touch "a" so "b" becomes the eldest.
    assert!(read(&cache, &key("a")).is_some());
    put(&cache, &key("c"), b"cccc");
    assert!(cache.size() <= 10);
    assert!(read(&cache, &key("b")).is_none());
    assert!(read(&cache, &key("a")).is_some());
    assert!(read(&cache, &key("c")).is_some());
    assert!(!dir.path().join(format!("{}.0", key("b"))).exists());
  }

  #[test]
  fn set_max_size_evicts_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 100);
    for name in ["a", "b", "c"] {
      put(&cache, &key(name), b"0123456789");
    }
    cache.set_max_size(15).unwrap();
    assert_eq!(cache.size(), 10);
    assert_eq!(cache.len(), 1);
    assert!(read(&cache, &key("c")).is_some());
  }

  #[test]
  fn remove_deletes_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 100);
    let k = key("a");
    put(&cache, &k, b"bytes");
    assert!(cache.remove(&k).unwrap());
    assert!(!cache.remove(&k).unwrap());
    assert!(cache.get(&k).unwrap().is_none());
    assert_eq!(cache.size(), 0);
  }

  #[test]
  fn missing_value_file_self_heals() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 100);
    let k = key("a");
    put(&cache, &k, b"bytes");
    fs::remove_file(dir.path().join(format!("{k}.0"))).unwrap();
    assert!(cache.get(&k).unwrap().is_none());
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.size(), 0);
  }

  #[test]
  fn truncated_value_file_self_heals() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 100);
    let k = key("a");
    put(&cache, &k, b"0123456789");
    fs::write(dir.path().join(format!("{k}.0")), b"0123").unwrap();
    assert!(cache.read_entry(&k, 0).unwrap().is_none());
    assert!(cache.get(&k).unwrap().is_none());
  }

  #[test]
  fn journal_compacts_after_many_reads() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 1024);
    let k = key("a");
    put(&cache, &k, b"bytes");
    let rebuilds = cache.debug_rebuilds();
    for _ in 0..(REDUNDANT_OP_COMPACT_THRESHOLD + 10) {
      assert!(cache.get(&k).unwrap().is_some());
    }
    assert!(cache.debug_rebuilds() > rebuilds);
    cache.flush().unwrap();
    let journal = fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
    assert!(journal.lines().count() < 100);
  }

  #[test]
  fn failed_journal_rewrite_keeps_cache_open() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 1024);
    put(&cache, &key("a"), b"alpha");
    let blocker = dir.path().join(JOURNAL_TMP_FILE);
    fs::create_dir(&blocker).unwrap();

    assert_eq!(cache.clear().unwrap(), 1);
    assert!(!cache.is_closed());
    put(&cache, &key("b"), b"bravo");
    assert_eq!(read(&cache, &key("b")).unwrap(), b"bravo");

    fs::remove_dir(&blocker).unwrap();
    cache.close().unwrap();
    let cache = open(dir.path(), 1024);
    assert!(cache.get(&key("a")).unwrap().is_none());
    assert_eq!(read(&cache, &key("b")).unwrap(), b"bravo");
  }

  #[test]
  fn commit_succeeds_when_compaction_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 1024);
    put(&cache, &key("a"), b"alpha");
    let rebuilds = cache.debug_rebuilds();
    cache.inner.state.lock().redundant_ops = REDUNDANT_OP_COMPACT_THRESHOLD;
    let blocker = dir.path().join(JOURNAL_TMP_FILE);
    fs::create_dir(&blocker).unwrap();

    let mut editor = cache.edit(&key("b")).unwrap().unwrap();
    editor.set(0, b"bravo").unwrap();
    editor.commit().unwrap();
    assert!(!cache.is_closed());
    assert_eq!(cache.debug_rebuilds(), rebuilds);
    assert_eq!(read(&cache, &key("b")).unwrap(), b"bravo");

    // The next operation over the threshold retries the rewrite.
    fs::remove_dir(&blocker).unwrap();
    assert!(cache.get(&key("a")).unwrap().is_some());
    assert!(cache.debug_rebuilds() > rebuilds);
  }

  #[test]
  fn corrupt_read_spares_a_newer_commit() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 1024);
    let k = key("a");
    put(&cache, &k, b"0123456789");
    let stale = cache.get(&k).unwrap().unwrap();
    put(&cache, &k, b"fresh");

    assert!(!cache.inner.remove_if_current(&k, stale.sequence).unwrap());
    assert_eq!(read(&cache, &k).unwrap(), b"fresh");

    let current = cache.get(&k).unwrap().unwrap();
    assert!(cache.inner.remove_if_current(&k, current.sequence).unwrap());
    assert!(cache.get(&k).unwrap().is_none());
  }

  #[test]
  fn closed_cache_rejects_operations() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 1024);
    let k = key("a");
    let mut editor = cache.edit(&k).unwrap().unwrap();
    editor.set(0, b"pending").unwrap();
    cache.close().unwrap();
    assert!(cache.is_closed());
    let err = editor.commit().unwrap_err();
    assert!(matches!(err, Error::Cache(CacheError::Closed)));
    assert!(matches!(
      cache.get(&k).unwrap_err(),
      Error::Cache(CacheError::Closed)
    ));
    assert!(cache.edit(&k).is_err());
    assert!(cache.flush().is_err());
    cache.close().unwrap();
  }

  #[test]
  fn clear_removes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 1024);
    put(&cache, &key("a"), b"1");
    put(&cache, &key("b"), b"2");
    assert_eq!(cache.clear().unwrap(), 2);
    assert!(cache.is_empty());
    assert_eq!(cache.size(), 0);
  }

  #[test]
  fn delete_removes_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache");
    let cache = open(&path, 1024);
    put(&cache, &key("a"), b"1");
    cache.delete().unwrap();
    assert!(!path.exists());
    assert!(cache.is_closed());
  }

  #[test]
  fn rejects_invalid_configuration() {
    let dir = tempfile::tempdir().unwrap();
    assert!(DiskCache::open(dir.path(), 1, 0, 1024).is_err());
    assert!(DiskCache::open(dir.path(), 1, 1, 0).is_err());
  }

  #[test]
  fn stored_version_reads_header_without_opening() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(DiskCache::stored_version(dir.path()).unwrap(), None);
    let cache = DiskCache::open(dir.path(), 7, 2, 1024).unwrap();
    cache.close().unwrap();
    assert_eq!(DiskCache::stored_version(dir.path()).unwrap(), Some((7, 2)));
  }

  #[test]
  fn parses_value_file_names() {
    let k = key("a");
    assert_eq!(parse_value_file_name(&format!("{k}.0")), Some((k, 0)));
    assert_eq!(parse_value_file_name("journal"), None);
    assert_eq!(parse_value_file_name("notakey.0"), None);
  }
}
