//! In-memory tier of decoded images.

use crate::image_loader::{DecodedImage, TargetBox};
use crate::resource::CacheKey;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Arc;

/// Memory tier key: the same source decoded for different target boxes yields different pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryKey {
  pub key: CacheKey,
  pub target: TargetBox,
}

impl MemoryKey {
  pub fn new(key: CacheKey, target: TargetBox) -> Self {
    Self { key, target }
  }
}

/// Byte-bounded LRU of decoded images shared behind `Arc`.
///
/// Gets and puts are atomic with respect to each other; nothing more is promised.
#[derive(Debug)]
pub struct MemoryCache {
  state: Mutex<MemoryState>,
}

#[derive(Debug)]
struct MemoryState {
  entries: LruCache<MemoryKey, Arc<DecodedImage>>,
  bytes: u64,
  max_bytes: u64,
}

impl MemoryCache {
  /// `max_bytes == 0` disables caching.
  pub fn new(max_bytes: u64) -> Self {
    Self {
      state: Mutex::new(MemoryState {
        entries: LruCache::unbounded(),
        bytes: 0,
        max_bytes,
      }),
    }
  }

  pub fn get(&self, key: &MemoryKey) -> Option<Arc<DecodedImage>> {
    self.state.lock().entries.get(key).cloned()
  }

  /// Inserts `image`, evicting least-recently-used images until the budget holds. Images larger
  /// than the whole budget are not cached.
  pub fn put(&self, key: MemoryKey, image: Arc<DecodedImage>) {
    let size = image.byte_size();
    let mut state = self.state.lock();
    if size > state.max_bytes {
      return;
    }
    if let Some(previous) = state.entries.put(key, image) {
      state.bytes = state.bytes.saturating_sub(previous.byte_size());
    }
    state.bytes += size;
    while state.bytes > state.max_bytes {
      let Some((_, evicted)) = state.entries.pop_lru() else {
        break;
      };
      state.bytes = state.bytes.saturating_sub(evicted.byte_size());
    }
  }

  pub fn remove(&self, key: &MemoryKey) -> Option<Arc<DecodedImage>> {
    let mut state = self.state.lock();
    let removed = state.entries.pop(key)?;
    state.bytes = state.bytes.saturating_sub(removed.byte_size());
    Some(removed)
  }

  pub fn clear(&self) {
    let mut state = self.state.lock();
    state.entries.clear();
    state.bytes = 0;
  }

  pub fn len(&self) -> usize {
    self.state.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Bytes of pixels currently held.
  pub fn size(&self) -> u64 {
    self.state.lock().bytes
  }

  pub fn max_size(&self) -> u64 {
    self.state.lock().max_bytes
  }
}
