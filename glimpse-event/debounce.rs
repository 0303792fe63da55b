//! Debounced async hooks for typing-side event streams.

use std::time::Duration;

use futures_executor::block_on;
use tokio::{
  sync::mpsc::{
    self,
    Sender,
    error::TrySendError,
  },
  time::Instant,
};

/// Upper bound on how long a synchronous sender may block on a full channel.
/// Dropping an event is always preferable to stalling the UI thread.
const SEND_TIMEOUT: Duration = Duration::from_millis(2);

/// A stateful event consumer running as a background tokio task.
///
/// Synchronous code (typing handlers, mostly) pushes events through the
/// channel returned by [`AsyncHook::spawn`]; the hook decides per event
/// whether to act immediately or to (re)arm a debounce deadline, and
/// [`AsyncHook::finish_debounce`] runs when that deadline passes quietly.
pub trait AsyncHook: Sync + Send + 'static + Sized {
  type Event: Sync + Send + 'static;

  /// Reacts to one event. The returned instant, if any, is the new debounce
  /// deadline; returning `None` disarms the timer.
  fn handle_event(&mut self, event: Self::Event, timeout: Option<Instant>) -> Option<Instant>;

  /// Runs when the debounce deadline elapses without further events.
  fn finish_debounce(&mut self);

  fn spawn(self) -> mpsc::Sender<Self::Event> {
    // Generous capacity so rapid typing rarely hits the send timeout.
    let (tx, rx) = mpsc::channel(256);
    // Unit tests construct hooks without a runtime; only spawn the driver
    // when one is actually available.
    if tokio::runtime::Handle::try_current().is_ok() {
      tokio::spawn(drive(self, rx));
    }
    tx
  }
}

async fn drive<H: AsyncHook>(mut hook: H, mut rx: mpsc::Receiver<H::Event>) {
  let mut deadline: Option<Instant> = None;
  loop {
    let event = match deadline {
      Some(at) => {
        match tokio::time::timeout_at(at, rx.recv()).await {
          Ok(event) => event,
          Err(_elapsed) => {
            deadline = None;
            hook.finish_debounce();
            continue;
          },
        }
      },
      None => rx.recv().await,
    };
    match event {
      Some(event) => deadline = hook.handle_event(event, deadline),
      None => break,
    }
  }
}

/// Sends an event from synchronous code, blocking at most [`SEND_TIMEOUT`]
/// when the channel is full. Events that still do not fit are dropped.
pub fn send_blocking<T>(tx: &Sender<T>, event: T) {
  match tx.try_send(event) {
    Ok(()) => {},
    Err(TrySendError::Full(event)) => {
      let _ = block_on(tx.send_timeout(event, SEND_TIMEOUT));
    },
    Err(TrySendError::Closed(_)) => {
      log::warn!("dropping event for a closed hook channel");
    },
  }
}

/// Sends without blocking at all. Returns whether the event was accepted.
pub fn try_send<T>(tx: &Sender<T>, event: T) -> bool {
  tx.try_send(event).is_ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  struct NoopHook;

  impl AsyncHook for NoopHook {
    type Event = u32;

    fn handle_event(&mut self, _event: u32, timeout: Option<Instant>) -> Option<Instant> {
      timeout
    }

    fn finish_debounce(&mut self) {}
  }

  #[test]
  fn spawn_outside_a_runtime_still_returns_a_channel() {
    let tx = NoopHook.spawn();
    // No driver task exists, so the channel simply buffers.
    assert!(try_send(&tx, 1));
  }

  #[test]
  fn send_helpers_survive_a_closed_channel() {
    let (tx, rx) = mpsc::channel::<u32>(1);
    drop(rx);
    send_blocking(&tx, 5);
    assert!(!try_send(&tx, 6));
  }
}
