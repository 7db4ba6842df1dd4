//! Fixed-size worker pool for fetch work.
//!
//! Tasks are queued FIFO without bound and run on a dedicated rayon pool owned by the executor.
//! Workers can lower their own OS scheduling priority so fetching never competes with the
//! caller's interactive threads. A panicking task is logged and counted; its worker carries on
//! with the next task.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Niceness applied to workers when `background_priority` is set.
pub const BACKGROUND_NICENESS: i32 = 10;

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
  /// Worker count. `None` uses twice the number of logical CPUs.
  pub threads: Option<usize>,
  /// Run workers below normal scheduling priority.
  pub background_priority: bool,
  pub thread_name_prefix: String,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      threads: None,
      background_priority: true,
      thread_name_prefix: "imagefetch-worker".to_string(),
    }
  }
}

impl ExecutorConfig {
  pub fn with_threads(mut self, threads: usize) -> Self {
    self.threads = Some(threads);
    self
  }

  pub fn with_background_priority(mut self, background: bool) -> Self {
    self.background_priority = background;
    self
  }

  pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.thread_name_prefix = prefix.into();
    self
  }

  /// Worker count this config produces.
  pub fn resolved_threads(&self) -> usize {
    self
      .threads
      .unwrap_or_else(|| num_cpus::get().saturating_mul(2))
      .max(1)
  }
}

#[derive(Debug, Default)]
struct TaskTracker {
  state: Mutex<TrackerState>,
  drained: Condvar,
  panicked: AtomicUsize,
}

#[derive(Debug)]
struct TrackerState {
  pending: usize,
  accepting: bool,
}

impl Default for TrackerState {
  fn default() -> Self {
    Self {
      pending: 0,
      accepting: true,
    }
  }
}

/// Decrements the pending count when a task finishes, including by panicking.
struct PendingGuard(Arc<TaskTracker>);

impl Drop for PendingGuard {
  fn drop(&mut self) {
    let mut state = self.0.state.lock();
    state.pending -= 1;
    if state.pending == 0 {
      self.0.drained.notify_all();
    }
  }
}

/// Owned worker pool with an unbounded FIFO queue.
#[derive(Debug)]
pub struct WorkQueueExecutor {
  pool: ThreadPool,
  threads: usize,
  tracker: Arc<TaskTracker>,
}

impl WorkQueueExecutor {
  pub fn new(config: ExecutorConfig) -> Result<Self> {
    let threads = config.resolved_threads();
    let tracker = Arc::new(TaskTracker::default());
    let prefix = config.thread_name_prefix.clone();
    let background = config.background_priority;
    let panic_tracker = Arc::clone(&tracker);

    let pool = ThreadPoolBuilder::new()
      .num_threads(threads)
      .thread_name(move |index| format!("{prefix}-{index}"))
      .start_handler(move |index| {
        if background && !lower_current_thread_priority() {
          debug!(worker = index, "could not lower worker scheduling priority");
        }
      })
      .panic_handler(move |payload| {
        panic_tracker.panicked.fetch_add(1, Ordering::Relaxed);
        error!(panic = %panic_message(payload.as_ref()), "fetch task panicked");
      })
      .build()
      .map_err(|err| Error::Other(format!("failed to build worker pool: {err}")))?;

    debug!(threads, background, "work queue executor started");
    Ok(Self {
      pool,
      threads,
      tracker,
    })
  }

  /// Queues `task`. Never blocks; fails only once [`shutdown`](Self::shutdown) has begun.
  pub fn submit<F>(&self, task: F) -> Result<()>
  where
    F: FnOnce() + Send + 'static,
  {
    {
      let mut state = self.tracker.state.lock();
      if !state.accepting {
        return Err(Error::ExecutorShutdown);
      }
      state.pending += 1;
    }
    let guard = PendingGuard(Arc::clone(&self.tracker));
    self.pool.spawn_fifo(move || {
      let _guard = guard;
      task();
    });
    Ok(())
  }

  pub fn threads(&self) -> usize {
    self.threads
  }

  /// Tasks accepted but not yet finished.
  pub fn pending(&self) -> usize {
    self.tracker.state.lock().pending
  }

  /// Tasks that ended in a panic since the executor started.
  pub fn panicked_tasks(&self) -> usize {
    self.tracker.panicked.load(Ordering::Relaxed)
  }

  pub fn is_shutdown(&self) -> bool {
    !self.tracker.state.lock().accepting
  }

  /// Stops accepting work and blocks until every accepted task has finished.
  ///
  /// Called from one of the executor's own tasks it only stops intake: the calling task counts
  /// as pending, so waiting would never end.
  pub fn shutdown(&self) {
    let mut state = self.tracker.state.lock();
    state.accepting = false;
    if self.on_worker_thread() {
      debug!(pending = state.pending, "shutdown requested from a worker; not waiting");
      return;
    }
    while state.pending > 0 {
      self.tracker.drained.wait(&mut state);
    }
  }

  /// Like [`shutdown`](Self::shutdown) but gives up waiting after `timeout`. Returns whether
  /// the queue drained.
  pub fn shutdown_timeout(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut state = self.tracker.state.lock();
    state.accepting = false;
    if self.on_worker_thread() {
      return false;
    }
    while state.pending > 0 {
      if self
        .tracker
        .drained
        .wait_until(&mut state, deadline)
        .timed_out()
      {
        return state.pending == 0;
      }
    }
    true
  }

  fn on_worker_thread(&self) -> bool {
    self.pool.current_thread_index().is_some()
  }
}

#[cfg(target_os = "linux")]
fn lower_current_thread_priority() -> bool {
  // SAFETY: setpriority only reads its integer arguments. On Linux `who == 0` with
  // PRIO_PROCESS addresses the calling thread.
  let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, BACKGROUND_NICENESS) };
  rc == 0
}

#[cfg(not(target_os = "linux"))]
fn lower_current_thread_priority() -> bool {
  false
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

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;

  fn executor(threads: usize) -> WorkQueueExecutor {
    WorkQueueExecutor::new(
      ExecutorConfig::default()
        .with_threads(threads)
        .with_background_priority(false),
    )
    .unwrap()
  }

  #[test]
  fn default_pool_is_twice_the_cpus() {
    let config = ExecutorConfig::default();
    assert_eq!(config.resolved_threads(), num_cpus::get() * 2);
    assert_eq!(ExecutorConfig::default().with_threads(0).resolved_threads(), 1);
  }

  #[test]
  fn runs_tasks_in_submission_order_on_one_worker() {
    let exec = executor(1);
    let (tx, rx) = mpsc::channel();
    for i in 0..20 {
      let tx = tx.clone();
      exec.submit(move || tx.send(i).unwrap()).unwrap();
    }
    drop(tx);
    let order: Vec<i32> = rx.iter().collect();
    assert_eq!(order, (0..20).collect::<Vec<_>>());
  }

  #[test]
  fn tasks_run_off_the_calling_thread() {
    let exec = executor(2);
    let (tx, rx) = mpsc::channel();
    exec
      .submit(move || {
        let name = std::thread::current().name().map(str::to_string);
        tx.send(name).unwrap();
      })
      .unwrap();
    let name = rx.recv().unwrap().unwrap();
    assert!(name.starts_with("imagefetch-worker-"));
  }

  #[test]
  fn panicking_task_does_not_kill_the_worker() {
    let exec = executor(1);
    exec.submit(|| panic!("boom")).unwrap();
    let (tx, rx) = mpsc::channel();
    exec.submit(move || tx.send(7).unwrap()).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 7);
    exec.shutdown();
    assert_eq!(exec.panicked_tasks(), 1);
  }

  #[test]
  fn shutdown_drains_then_rejects() {
    let exec = executor(2);
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..16 {
      let done = Arc::clone(&done);
      exec
        .submit(move || {
          std::thread::sleep(Duration::from_millis(5));
          done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    exec.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 16);
    assert_eq!(exec.pending(), 0);
    assert!(exec.is_shutdown());
    assert!(matches!(exec.submit(|| {}), Err(Error::ExecutorShutdown)));
  }

  #[test]
  fn shutdown_timeout_reports_undrained_queue() {
    let exec = executor(1);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    exec
      .submit(move || {
        let _ = release_rx.recv_timeout(Duration::from_secs(10));
      })
      .unwrap();
    assert!(!exec.shutdown_timeout(Duration::from_millis(20)));
    release_tx.send(()).unwrap();
    assert!(exec.shutdown_timeout(Duration::from_secs(10)));
  }

  #[test]
  fn shutdown_from_a_task_does_not_wait_on_itself() {
    let exec = Arc::new(executor(1));
    let (tx, rx) = mpsc::channel();
    let inner = Arc::clone(&exec);
    exec
      .submit(move || {
        inner.shutdown();
        let drained = inner.shutdown_timeout(Duration::from_secs(5));
        tx.send((drained, inner.is_shutdown())).unwrap();
      })
      .unwrap();
    let (drained, stopped) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(!drained);
    assert!(stopped);
    assert!(matches!(exec.submit(|| {}), Err(Error::ExecutorShutdown)));
    exec.shutdown();
    assert_eq!(exec.pending(), 0);
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn background_workers_are_niced() {
    let exec = WorkQueueExecutor::new(ExecutorConfig::default().with_threads(1)).unwrap();
    let (tx, rx) = mpsc::channel();
    exec
      .submit(move || {
        // SAFETY: getpriority only reads its integer arguments.
        let nice = unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) };
        tx.send(nice).unwrap();
      })
      .unwrap();
    let nice = rx.recv().unwrap();
    assert!(nice >= BACKGROUND_NICENESS);
  }
}
