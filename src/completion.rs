//! Delivery of results back to the caller's execution context.
//!
//! Workers never run user callbacks themselves. They post a job to a [`CompletionContext`],
//! and the context runs it wherever the caller wants completions to happen. [`CompletionQueue`]
//! is the stock context: a channel the owning thread drains in its event loop.

use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A unit of work run on the completion context.
pub type CompletionJob = Box<dyn FnOnce() + Send + 'static>;

/// Tagged result handed to a callback: the payload plus the caller's correlation token,
/// returned unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion<P, T> {
  pub payload: P,
  pub token: T,
}

impl<P, T> Completion<P, T> {
  pub fn new(payload: P, token: T) -> Self {
    Self { payload, token }
  }

  pub fn into_parts(self) -> (P, T) {
    (self.payload, self.token)
  }
}

/// Where completion callbacks run.
pub trait CompletionContext: Send + Sync {
  /// Schedules `job`. Must not run it synchronously inside the caller's `fetch`.
  fn post(&self, job: CompletionJob);
}

impl<C: CompletionContext + ?Sized> CompletionContext for Arc<C> {
  fn post(&self, job: CompletionJob) {
    (**self).post(job)
  }
}

/// Channel-backed [`CompletionContext`] drained by its owning thread.
#[derive(Debug)]
pub struct CompletionQueue {
  sender: Mutex<Sender<CompletionJob>>,
  receiver: Mutex<Receiver<CompletionJob>>,
}

impl CompletionQueue {
  pub fn new() -> Arc<Self> {
    let (sender, receiver) = mpsc::channel();
    Arc::new(Self {
      sender: Mutex::new(sender),
      receiver: Mutex::new(receiver),
    })
  }

  /// Runs every job already posted and returns how many ran.
  pub fn run_pending(&self) -> usize {
    let mut ran = 0;
    while let Some(job) = self.try_next() {
      job();
      ran += 1;
    }
    ran
  }

  /// Runs jobs as they arrive until `count` have run or `timeout` elapses. Returns how many
  /// ran.
  pub fn run_until(&self, count: usize, timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    let mut ran = 0;
    while ran < count {
      let remaining = deadline.saturating_duration_since(Instant::now());
      let next = self.receiver.lock().recv_timeout(remaining);
      match next {
        Ok(job) => {
          job();
          ran += 1;
        }
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
      }
    }
    ran
  }

  fn try_next(&self) -> Option<CompletionJob> {
    self.receiver.lock().try_recv().ok()
  }
}

impl CompletionContext for CompletionQueue {
  fn post(&self, job: CompletionJob) {
    // The receiver lives as long as `self`, so sending cannot fail.
    let _ = self.sender.lock().send(job);
  }
}
