//! Restartable cancellation for background completion work.
//!
//! A [`TaskController`] owns the current generation of work. Every call to
//! [`TaskController::restart`] cancels the previous generation and hands out
//! a fresh [`TaskHandle`] that workers poll (or await) while they run.

use std::{
  borrow::Borrow,
  future::Future,
  sync::{
    Arc,
    Weak,
    atomic::{
      AtomicBool,
      Ordering,
    },
  },
};

use thiserror::Error;
use tokio::sync::Notify;

/// Marker error for work abandoned because its task was cancelled.
///
/// Cancellation is an expected outcome, not a failure: propagate it with `?`
/// and swallow it at the edge of the task. Never log it as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("task was cancelled")]
pub struct Cancelled;

#[derive(Debug, Default)]
struct HandleState {
  cancelled: AtomicBool,
  notify:    Notify,
}

/// Cancellation token for one generation of background work.
///
/// Handles are cheap to clone and safe to poll from any thread. Once the
/// owning [`TaskController`] cancels or restarts, every clone observes it.
#[derive(Debug, Clone)]
pub struct TaskHandle {
  state: Arc<HandleState>,
}

impl TaskHandle {
  pub fn is_canceled(&self) -> bool {
    self.state.cancelled.load(Ordering::Acquire)
  }

  /// Errors with [`Cancelled`] once the handle is cancelled. Convenient at
  /// the head of `?` chains in worker loops.
  pub fn check(&self) -> Result<(), Cancelled> {
    if self.is_canceled() {
      Err(Cancelled)
    } else {
      Ok(())
    }
  }

  /// Completes once the handle is cancelled.
  pub async fn canceled(&self) {
    loop {
      if self.is_canceled() {
        return;
      }
      let notified = self.state.notify.notified();
      tokio::pin!(notified);
      // Register before the re-check so a cancellation landing in between
      // cannot be missed.
      notified.as_mut().enable();
      if self.is_canceled() {
        return;
      }
      notified.await;
    }
  }
}

/// Owner side of [`TaskHandle`]: cancels the current generation of work and
/// starts the next one.
#[derive(Debug, Default)]
pub struct TaskController {
  current: Weak<HandleState>,
}

impl TaskController {
  pub fn new() -> Self {
    Self {
      current: Weak::new(),
    }
  }

  /// Whether any handle from the current generation is still alive.
  pub fn is_running(&self) -> bool {
    self.current.strong_count() != 0
  }

  /// Cancels the current generation. Returns whether a live task was
  /// actually cancelled. Idempotent.
  pub fn cancel(&mut self) -> bool {
    let Some(state) = self.current.upgrade() else {
      return false;
    };
    let was_live = !state.cancelled.swap(true, Ordering::AcqRel);
    state.notify.notify_waiters();
    was_live
  }

  /// Cancels the current generation and hands out the handle for the next
  /// one.
  pub fn restart(&mut self) -> TaskHandle {
    self.cancel();
    let state = Arc::new(HandleState::default());
    self.current = Arc::downgrade(&state);
    TaskHandle { state }
  }
}

/// Runs `future` to completion unless `handle` is cancelled first, in which
/// case the future is dropped and `None` returned.
pub async fn cancelable_future<T>(
  future: impl Future<Output = T>,
  handle: impl Borrow<TaskHandle>,
) -> Option<T> {
  let handle = handle.borrow();
  tokio::select! {
    biased;
    _ = handle.canceled() => None,
    res = future => Some(res),
  }
}
