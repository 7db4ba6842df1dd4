//! Two-tier fetch coordination.
//!
//! [`MemoryTierCoordinator`] answers fetches from the memory tier, then the disk tier, then the
//! origin, writing results back through both tiers. Work runs on a [`WorkQueueExecutor`] and
//! every callback is posted to the caller's [`CompletionContext`] exactly once, tagged with the
//! caller's token.
//!
//! The disk tier opens in the background: construction submits the open job and returns at
//! once. Network fetches wait on a one-shot readiness signal before looking at disk; the other
//! source kinds never touch disk and do not wait.
//!
//! Concurrent fetches for the same `(key, target)` coalesce onto one in-flight job.

use crate::completion::{Completion, CompletionContext};
use crate::config::{DiskTierConfig, PipelineConfig};
use crate::error::{CacheError, Error, Result};
use crate::executor::WorkQueueExecutor;
use crate::fetch_task::{FetchEnv, FetchResult, Tier};
use crate::image_loader::{SampledDecoder, TargetBox};
use crate::memory_cache::{MemoryCache, MemoryKey};
use crate::resource::{CacheKey, DiskCache, HttpRequest, HttpResponse, HttpSession, Source};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One image fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
  pub source: Source,
  pub target: TargetBox,
  /// Defaults to the hash of the source's logical address.
  pub key: CacheKey,
}

impl FetchRequest {
  pub fn new(source: Source) -> Self {
    Self {
      key: source.cache_key(),
      source,
      target: TargetBox::UNBOUNDED,
    }
  }

  /// Request for an address classified by [`Source::parse`].
  pub fn parse(address: &str) -> Self {
    Self::new(Source::parse(address))
  }

  pub fn with_target(mut self, target: TargetBox) -> Self {
    self.target = target;
    self
  }

  pub fn with_key(mut self, key: CacheKey) -> Self {
    self.key = key;
    self
  }

  pub fn memory_key(&self) -> MemoryKey {
    MemoryKey::new(self.key, self.target)
  }
}

type Waiter = Box<dyn FnOnce(FetchResult) + Send + 'static>;
type ResponseWaiter = Box<dyn FnOnce(Result<HttpResponse>) + Send + 'static>;

/// One-shot signal carrying the disk tier once its open job finishes.
#[derive(Default)]
struct Readiness {
  state: Mutex<Option<Option<DiskCache>>>,
  resolved: Condvar,
}

impl Readiness {
  /// Sets the signal. Only the first call has an effect; returns whether this call won.
  fn resolve(&self, disk: Option<DiskCache>) -> bool {
    let mut state = self.state.lock();
    if state.is_some() {
      return false;
    }
    *state = Some(disk);
    self.resolved.notify_all();
    true
  }

  /// Blocks until the signal is set. [`MemoryTierCoordinator::close`] sets it to "no disk tier"
  /// when the open job has not run yet, which is how blocked workers are released early.
  fn wait(&self) -> Option<DiskCache> {
    let mut state = self.state.lock();
    loop {
      if let Some(disk) = state.as_ref() {
        return disk.clone();
      }
      self.resolved.wait(&mut state);
    }
  }
}

struct Shared {
  executor: Arc<WorkQueueExecutor>,
  completions: Arc<dyn CompletionContext>,
  env: FetchEnv,
  memory: MemoryCache,
  readiness: Readiness,
  in_flight: Mutex<HashMap<MemoryKey, Vec<Waiter>>>,
  closed: AtomicBool,
}

/// Memory, disk and origin tiers behind one asynchronous fetch call.
///
/// Clones share the same tiers.
#[derive(Clone)]
pub struct MemoryTierCoordinator {
  shared: Arc<Shared>,
}

impl MemoryTierCoordinator {
  /// Builds the coordinator with a fresh [`HttpSession`] and [`SampledDecoder`] from `config`.
  pub fn new(
    executor: Arc<WorkQueueExecutor>,
    completions: Arc<dyn CompletionContext>,
    config: PipelineConfig,
  ) -> Self {
    let env = FetchEnv::new(
      HttpSession::new(config.http.clone()),
      Arc::new(SampledDecoder::new(config.decode)),
    );
    Self::with_env(executor, completions, config, env)
  }

  /// Builds the coordinator around caller-supplied collaborators. `config.http` and
  /// `config.decode` are ignored in favor of `env`.
  pub fn with_env(
    executor: Arc<WorkQueueExecutor>,
    completions: Arc<dyn CompletionContext>,
    config: PipelineConfig,
    env: FetchEnv,
  ) -> Self {
    let shared = Arc::new(Shared {
      executor,
      completions,
      env,
      memory: MemoryCache::new(config.memory_max_bytes),
      readiness: Readiness::default(),
      in_flight: Mutex::new(HashMap::new()),
      closed: AtomicBool::new(false),
    });

    match config.disk {
      None => {
        shared.readiness.resolve(None);
      }
      Some(disk) => {
        let job_shared = Arc::clone(&shared);
        let submitted = shared.executor.submit(move || {
          let cache = open_disk_tier(&disk);
          if !job_shared.readiness.resolve(cache.clone()) {
            // Closed while opening.
            if let Some(cache) = cache {
              let _ = cache.close();
            }
          }
        });
        if let Err(err) = submitted {
          warn!(error = %err, "could not schedule disk cache open; running without disk tier");
          shared.readiness.resolve(None);
        }
      }
    }

    Self { shared }
  }

  /// Fetches `request` and posts `callback` to the completion context with the result and
  /// `token`.
  ///
  /// The callback runs exactly once and never inside this call, even on a memory hit.
  pub fn fetch<T, F>(&self, request: FetchRequest, token: T, callback: F)
  where
    T: Send + 'static,
    F: FnOnce(Completion<FetchResult, T>) + Send + 'static,
  {
    let completions = Arc::clone(&self.shared.completions);
    let deliver: Waiter = Box::new(move |result| {
      completions.post(Box::new(move || callback(Completion::new(result, token))));
    });

    if self.shared.closed.load(Ordering::Acquire) {
      deliver(FetchResult::failure(Error::Cache(CacheError::Closed)));
      return;
    }

    let memory_key = request.memory_key();
    if let Some(image) = self.shared.memory.get(&memory_key) {
      debug!(source = %request.source, tier = "memory", "fetch hit");
      deliver(FetchResult::success(image, Tier::Memory));
      return;
    }

    {
      let mut in_flight = self.shared.in_flight.lock();
      if let Some(waiters) = in_flight.get_mut(&memory_key) {
        debug!(source = %request.source, "joined in-flight fetch");
        waiters.push(deliver);
        return;
      }
      // A fetch that finished since the lookup above has already populated memory.
      if let Some(image) = self.shared.memory.get(&memory_key) {
        drop(in_flight);
        deliver(FetchResult::success(image, Tier::Memory));
        return;
      }
      in_flight.insert(memory_key, vec![deliver]);
    }

    let shared = Arc::clone(&self.shared);
    if let Err(err) = self.shared.executor.submit(move || shared.run_fetch(request)) {
      self.shared.finish(&memory_key, FetchResult::failure(err));
    }
  }

  /// Runs `request` on the generic, uncached request path and posts `callback` with the
  /// response and `token`. Error statuses arrive as responses; only transport and request
  /// errors are `Err`.
  pub fn request<T, F>(&self, request: HttpRequest, token: T, callback: F)
  where
    T: Send + 'static,
    F: FnOnce(Completion<Result<HttpResponse>, T>) + Send + 'static,
  {
    let completions = Arc::clone(&self.shared.completions);
    let deliver: ResponseWaiter = Box::new(move |payload| {
      completions.post(Box::new(move || callback(Completion::new(payload, token))));
    });
    let slot = Arc::new(Mutex::new(Some(deliver)));

    let job_slot = Arc::clone(&slot);
    let shared = Arc::clone(&self.shared);
    let submitted = self.shared.executor.submit(move || {
      let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        shared
          .env
          .session
          .request(&request, shared.env.decoder.as_ref())
      }));
      let payload = outcome.unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!(url = %request.url, panic = %message, "request task panicked");
        Err(Error::Other(format!("request task panicked: {message}")))
      });
      if let Some(deliver) = job_slot.lock().take() {
        deliver(payload);
      }
    });
    if let Err(err) = submitted {
      if let Some(deliver) = slot.lock().take() {
        deliver(Err(err));
      }
    }
  }

  /// Empties the memory tier and removes every disk entry not under edit.
  pub fn clear_caches(&self) -> Result<()> {
    self.shared.memory.clear();
    match self.shared.readiness.wait() {
      Some(disk) => {
        let removed = disk.clear()?;
        info!(removed, "cleared disk cache");
        Ok(())
      }
      None => Ok(()),
    }
  }

  /// Flushes the disk journal.
  pub fn flush(&self) -> Result<()> {
    match self.shared.readiness.wait() {
      Some(disk) => disk.flush(),
      None => Ok(()),
    }
  }

  /// Clears memory and closes the disk tier. Later fetches fail with
  /// [`CacheError::Closed`]; jobs already running finish without the disk tier.
  pub fn close(&self) -> Result<()> {
    self.shared.closed.store(true, Ordering::Release);
    self.shared.memory.clear();
    if self.shared.readiness.resolve(None) {
      return Ok(());
    }
    match self.shared.readiness.wait() {
      Some(disk) => disk.close(),
      None => Ok(()),
    }
  }

  pub fn is_closed(&self) -> bool {
    self.shared.closed.load(Ordering::Acquire)
  }

  /// The disk tier, once it has opened. Blocks until the open job has run; `None` when running
  /// without one.
  pub fn disk_cache(&self) -> Option<DiskCache> {
    self.shared.readiness.wait()
  }

  pub fn memory_cache(&self) -> &MemoryCache {
    &self.shared.memory
  }

  pub fn session(&self) -> &HttpSession {
    &self.shared.env.session
  }

  pub fn executor(&self) -> &Arc<WorkQueueExecutor> {
    &self.shared.executor
  }
}

impl Shared {
  fn run_fetch(&self, request: FetchRequest) {
    let memory_key = request.memory_key();
    let result = panic::catch_unwind(AssertUnwindSafe(|| self.resolve(&request)))
      .unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!(source = %request.source, panic = %message, "fetch task panicked");
        FetchResult::failure(Error::Other(format!("fetch task panicked: {message}")))
      });
    self.finish(&memory_key, result);
  }

  /// Hands `result` to every waiter on `memory_key`.
  fn finish(&self, memory_key: &MemoryKey, result: FetchResult) {
    let waiters = self.in_flight.lock().remove(memory_key).unwrap_or_default();
    for waiter in waiters {
      waiter(result.clone());
    }
  }

  fn resolve(&self, request: &FetchRequest) -> FetchResult {
    let Source::Network(url) = &request.source else {
      let result = self.env.task_for(&request.source).run(request.target);
      if let Some(image) = &result.image {
        self.memory.put(request.memory_key(), Arc::clone(image));
      }
      debug!(source = %request.source, success = result.is_success(), tier = "origin", "fetch done");
      return result;
    };

    let disk = self
      .readiness
      .wait()
      .filter(|disk| !disk.is_closed() && !self.closed.load(Ordering::Acquire));
    if let Some(disk) = &disk {
      if let Some(result) = self.from_disk(disk, request) {
        return result;
      }
    }
    self.from_network(url, request, disk.as_ref())
  }

  fn from_disk(&self, disk: &DiskCache, request: &FetchRequest) -> Option<FetchResult> {
    let bytes = match disk.read_entry(&request.key, 0) {
      Ok(Some(bytes)) => bytes,
      Ok(None) => return None,
      Err(err) => {
        warn!(key = %request.key, error = %err, "disk cache read failed");
        return None;
      }
    };
    match self.env.decoder.decode(&bytes, request.target) {
      Ok(image) => {
        let image = Arc::new(image);
        self.memory.put(request.memory_key(), Arc::clone(&image));
        debug!(source = %request.source, tier = "disk", "fetch hit");
        Some(FetchResult::success(image, Tier::Disk))
      }
      Err(err) => {
        warn!(key = %request.key, error = %err, "cached bytes failed to decode; dropping entry");
        if let Err(err) = disk.remove(&request.key) {
          warn!(key = %request.key, error = %err, "could not drop undecodable entry");
        }
        None
      }
    }
  }

  fn from_network(
    &self,
    url: &str,
    request: &FetchRequest,
    disk: Option<&DiskCache>,
  ) -> FetchResult {
    let bytes = match self.env.network(url).download() {
      Ok(bytes) => bytes,
      Err(err) => {
        debug!(url, error = %err, "network fetch failed");
        return FetchResult::failure(err);
      }
    };
    let image = match self.env.decoder.decode(&bytes, request.target) {
      Ok(image) => Arc::new(image),
      Err(err) => {
        debug!(url, error = %err, "downloaded bytes failed to decode");
        return FetchResult::failure(err);
      }
    };
    if let Some(disk) = disk {
      write_through(disk, &request.key, &bytes);
    }
    self.memory.put(request.memory_key(), Arc::clone(&image));
    debug!(url, bytes = bytes.len(), tier = "origin", "fetch done");
    FetchResult::success(image, Tier::Origin)
  }
}

fn open_disk_tier(config: &DiskTierConfig) -> Option<DiskCache> {
  match DiskCache::open_with_config(&config.directory, config.cache.clone()) {
    Ok(cache) => {
      info!(
        directory = %config.directory.display(),
        entries = cache.len(),
        bytes = cache.size(),
        "disk cache ready"
      );
      Some(cache)
    }
    Err(err) => {
      warn!(
        directory = %config.directory.display(),
        error = %err,
        "disk cache unavailable; continuing without disk tier"
      );
      None
    }
  }
}

/// Stores `bytes` under `key`. Failures only cost a future cache hit, so they are logged and
/// dropped.
fn write_through(disk: &DiskCache, key: &CacheKey, bytes: &[u8]) {
  let stored = (|| -> Result<bool> {
    let Some(mut editor) = disk.edit(key)? else {
      return Ok(false);
    };
    editor.set(0, bytes)?;
    editor.commit()?;
    Ok(true)
  })();
  match stored {
    Ok(true) => debug!(key = %key, bytes = bytes.len(), "stored in disk cache"),
    Ok(false) => warn!(key = %key, "disk entry is being edited; skipping write"),
    Err(err) => warn!(key = %key, error = %err, "disk cache write failed"),
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(msg) = payload.downcast_ref::<&str>() {
    (*msg).to_string()
  } else if let Some(msg) = payload.downcast_ref::<String>() {
    msg.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
