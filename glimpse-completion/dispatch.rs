//! How gathering runs, and where its results flow.
//!
//! Two interchangeable strategies: inline on the calling thread, or a pair
//! of named worker threads (one gathering, one applying results). Both feed
//! a [`ResultSink`], so providers never know which one is active.

use std::{
  any::Any,
  io,
  mem,
  panic::{
    self,
    AssertUnwindSafe,
  },
  sync::{
    Arc,
    atomic::{
      AtomicU32,
      Ordering,
    },
  },
  thread::{
    self,
    JoinHandle,
  },
  time::Duration,
};

use crossbeam::channel::{
  self,
  Sender,
};
use parking_lot::Mutex;
use thiserror::Error;

use glimpse_event::TaskHandle;

use crate::{
  editor::UiTransactionError,
  indicator::CompletionIndicator,
  phase::ServiceHandle,
  provider::Suggestion,
  worker::ResultWorker,
};

/// Execution model for one gathering attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
  /// Gather inline on the calling thread; results apply immediately and
  /// the attempt is finished by the time the call returns.
  Sync,
  /// Gather on a dedicated thread; results flow through the ordered queue
  /// into the result worker.
  Background,
}

/// Ordered messages from producers to the single result consumer.
#[derive(Debug)]
pub enum ResultMessage {
  Item(Suggestion),
  Batch(Vec<Suggestion>),
  Stop,
}

#[derive(Debug, Error)]
pub enum DispatchError {
  #[error("failed to spawn a completion thread")]
  Spawn(#[from] io::Error),
  #[error("the gathering thread never signalled startup")]
  StartBarrier,
}

enum SinkTarget {
  /// Apply straight to the popup inside a UI transaction (sync dispatch).
  Direct {
    indicator: CompletionIndicator,
    middles:   Mutex<Vec<Suggestion>>,
  },
  /// Enqueue for the result worker (background dispatch).
  Queue { tx: Sender<ResultMessage> },
}

struct SinkShared {
  target:      SinkTarget,
  batch_depth: AtomicU32,
  batch:       Mutex<Vec<Suggestion>>,
}

/// Where producers put suggestions.
///
/// Clones share one attempt's state, so a batch scope opened through any
/// clone buffers additions from all of them until the outermost scope
/// closes.
#[derive(Clone)]
pub struct ResultSink {
  shared: Arc<SinkShared>,
}

impl ResultSink {
  pub(crate) fn direct(indicator: CompletionIndicator) -> Self {
    Self::with_target(SinkTarget::Direct {
      indicator,
      middles: Mutex::new(Vec::new()),
    })
  }

  pub(crate) fn queued(tx: Sender<ResultMessage>) -> Self {
    Self::with_target(SinkTarget::Queue { tx })
  }

  fn with_target(target: SinkTarget) -> Self {
    Self {
      shared: Arc::new(SinkShared {
        target,
        batch_depth: AtomicU32::new(0),
        batch: Mutex::new(Vec::new()),
      }),
    }
  }

  fn batching(&self) -> bool {
    self.shared.batch_depth.load(Ordering::Acquire) > 0
  }

  /// Adds one suggestion, preserving arrival order.
  pub fn push(&self, suggestion: Suggestion) {
    if self.batching() {
      self.shared.batch.lock().push(suggestion);
    } else {
      self.forward(ResultMessage::Item(suggestion));
    }
  }

  /// Adds a group of suggestions as one ordered unit.
  pub fn push_all(&self, suggestions: Vec<Suggestion>) {
    if suggestions.is_empty() {
      return;
    }
    if self.batching() {
      self.shared.batch.lock().extend(suggestions);
    } else {
      self.forward(ResultMessage::Batch(suggestions));
    }
  }

  /// Runs `f` with batching on. Additions made while the scope is open are
  /// flushed as one unit when the outermost scope closes, even if `f`
  /// unwinds.
  pub fn batched<T>(&self, f: impl FnOnce() -> T) -> T {
    struct Scope<'a>(&'a ResultSink);
    impl Drop for Scope<'_> {
      fn drop(&mut self) {
        if self.0.shared.batch_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
          self.0.flush_batched();
        }
      }
    }

    self.shared.batch_depth.fetch_add(1, Ordering::AcqRel);
    let _scope = Scope(self);
    f()
  }

  /// Sends whatever the batch buffer holds as one unit, immediately.
  pub fn flush_batched(&self) {
    let buffered = mem::take(&mut *self.shared.batch.lock());
    if !buffered.is_empty() {
      self.forward(ResultMessage::Batch(buffered));
    }
  }

  /// Marks the end of this attempt's production.
  pub(crate) fn stop(&self) {
    self.flush_batched();
    match &self.shared.target {
      SinkTarget::Direct { indicator, middles } => {
        // Deferred middle matches surface once, at the very end.
        let parked = mem::take(&mut *middles.lock());
        if !parked.is_empty() {
          apply_direct(indicator, &parked);
        }
      },
      SinkTarget::Queue { tx } => {
        let _ = tx.send(ResultMessage::Stop);
      },
    }
  }

  fn forward(&self, message: ResultMessage) {
    match &self.shared.target {
      SinkTarget::Queue { tx } => {
        if tx.send(message).is_err() {
          log::debug!("result worker is gone; dropping completion results");
        }
      },
      SinkTarget::Direct { indicator, middles } => {
        let mut direct = Vec::new();
        match message {
          ResultMessage::Item(s) if s.middle_match => middles.lock().push(s),
          ResultMessage::Item(s) => direct.push(s),
          ResultMessage::Batch(items) => {
            let mut parked = middles.lock();
            for s in items {
              if s.middle_match {
                parked.push(s);
              } else {
                direct.push(s);
              }
            }
          },
          ResultMessage::Stop => {},
        }
        if !direct.is_empty() {
          apply_direct(indicator, &direct);
        }
      },
    }
  }
}

/// Applies items inside one UI transaction. A refusal cancels the attempt
/// instead of retrying.
fn apply_direct(indicator: &CompletionIndicator, items: &[Suggestion]) {
  match indicator.update_ui(|| indicator.apply_items(items)) {
    Ok(()) => {},
    Err(UiTransactionError::Busy) => {
      log::warn!(
        "ui transaction refused while applying completion results; cancelling attempt {}",
        indicator.id()
      );
      indicator.cancel();
    },
    Err(UiTransactionError::Cancelled) => {},
  }
}

/// Work one attempt runs off the phase machine: the registered providers
/// wired to a sink and a cancellation handle.
pub(crate) type GatherWork = Box<dyn FnOnce(ResultSink, TaskHandle) + Send>;

/// Handle on the threads of one background attempt. Dropping it detaches
/// them; they wind down on cancellation or `Stop` on their own.
pub struct GatherHandle {
  gather: Option<JoinHandle<()>>,
  worker: Option<JoinHandle<()>>,
}

impl GatherHandle {
  fn inline() -> Self {
    Self {
      gather: None,
      worker: None,
    }
  }

  /// Waits for the attempt's threads to wind down. Shutdown and test
  /// convenience; the live path never blocks on this.
  pub fn join(mut self) {
    let handles = [self.gather.take(), self.worker.take()];
    for handle in handles.into_iter().flatten() {
      if handle.join().is_err() {
        log::error!("a completion thread panicked past its catch point");
      }
    }
  }
}

/// Starts gathering under `mode`. An error means nothing is left running:
/// no results will arrive and the attempt is already cancelled.
pub(crate) fn start_gathering(
  mode: DispatchMode,
  indicator: &CompletionIndicator,
  service: ServiceHandle,
  poll: Duration,
  work: GatherWork,
) -> Result<GatherHandle, DispatchError> {
  match mode {
    DispatchMode::Sync => {
      let sink = ResultSink::direct(indicator.clone());
      indicator.set_sink(sink.clone());
      run_work(work, &sink, indicator);
      Ok(GatherHandle::inline())
    },
    DispatchMode::Background => {
      let (tx, rx) = channel::unbounded();
      let sink = ResultSink::queued(tx);
      indicator.set_sink(sink.clone());

      let worker = ResultWorker {
        channel: rx,
        indicator: indicator.clone(),
        service,
        poll,
      };
      let worker = thread::Builder::new()
        .name(format!("glimpse-results-{}", indicator.id()))
        .spawn(move || worker.run())?;

      // Rendezvous with the gathering thread so a cancellation registered
      // right after this call reliably reaches the work.
      let (started_tx, started_rx) = channel::bounded::<()>(0);
      let gather = {
        let sink = sink.clone();
        let task = indicator.clone();
        thread::Builder::new()
          .name(format!("glimpse-gather-{}", indicator.id()))
          .spawn(move || {
            let _ = started_tx.send(());
            run_work(work, &sink, &task);
          })
      };
      let gather = match gather {
        Ok(handle) => handle,
        Err(err) => {
          indicator.cancel();
          sink.stop();
          let _ = worker.join();
          return Err(err.into());
        },
      };
      if started_rx.recv().is_err() {
        indicator.cancel();
        sink.stop();
        return Err(DispatchError::StartBarrier);
      }
      Ok(GatherHandle {
        gather: Some(gather),
        worker: Some(worker),
      })
    },
  }
}

fn run_work(work: GatherWork, sink: &ResultSink, indicator: &CompletionIndicator) {
  let handle = indicator.task_handle();
  let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(sink.clone(), handle)));
  if let Err(payload) = outcome {
    log::error!(
      "completion gathering panicked: {}",
      panic_message(payload.as_ref())
    );
    indicator.cancel();
  }
  sink.stop();
}

/// Best-effort text out of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
  payload
    .downcast_ref::<&'static str>()
    .copied()
    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
    .unwrap_or("opaque panic payload")
}

#[cfg(test)]
mod tests {
  use crossbeam::channel::Receiver;

  use super::*;
  use crate::{
    editor::EditorHandle,
    indicator::PopupHandle,
  };

  fn queued_sink() -> (ResultSink, Receiver<ResultMessage>) {
    let (tx, rx) = channel::unbounded();
    (ResultSink::queued(tx), rx)
  }

  fn direct_sink(editor: &EditorHandle) -> (ResultSink, CompletionIndicator) {
    let indicator =
      CompletionIndicator::new(editor.clone(), PopupHandle::new(), 1, false);
    (ResultSink::direct(indicator.clone()), indicator)
  }

  fn names(messages: &[ResultMessage]) -> Vec<String> {
    messages
      .iter()
      .flat_map(|message| match message {
        ResultMessage::Item(s) => vec![s.text.clone()],
        ResultMessage::Batch(items) => items.iter().map(|s| s.text.clone()).collect(),
        ResultMessage::Stop => vec!["<stop>".to_owned()],
      })
      .collect()
  }

  #[test]
  fn queue_preserves_arrival_order() {
    let (sink, rx) = queued_sink();
    sink.push(Suggestion::new("a"));
    sink.push_all(vec![Suggestion::new("b"), Suggestion::new("c")]);
    sink.push(Suggestion::new("d"));
    sink.stop();

    let messages: Vec<_> = rx.try_iter().collect();
    assert_eq!(names(&messages), ["a", "b", "c", "d", "<stop>"]);
    assert!(matches!(messages[0], ResultMessage::Item(_)));
    assert!(matches!(&messages[1], ResultMessage::Batch(items) if items.len() == 2));
    assert!(matches!(messages.last(), Some(ResultMessage::Stop)));
  }

  #[test]
  fn batch_scope_flushes_as_one_unit() {
    let (sink, rx) = queued_sink();
    sink.push(Suggestion::new("before"));
    sink.batched(|| {
      sink.push(Suggestion::new("x"));
      sink.batched(|| sink.push(Suggestion::new("y")));
      sink.push(Suggestion::new("z"));
    });

    let messages: Vec<_> = rx.try_iter().collect();
    assert_eq!(messages.len(), 2);
    assert!(matches!(messages[0], ResultMessage::Item(_)));
    assert!(matches!(&messages[1], ResultMessage::Batch(items) if items.len() == 3));
  }

  #[test]
  fn batch_scope_survives_an_unwinding_closure() {
    let (sink, rx) = queued_sink();
    let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
      sink.batched(|| {
        sink.push(Suggestion::new("partial"));
        panic!("provider blew up");
      })
    }));
    assert!(unwound.is_err());

    // The scope closed on unwind: the buffer flushed and batching is off.
    sink.push(Suggestion::new("later"));
    let messages: Vec<_> = rx.try_iter().collect();
    assert_eq!(names(&messages), ["partial", "later"]);
    assert!(matches!(&messages[0], ResultMessage::Batch(_)));
    assert!(matches!(&messages[1], ResultMessage::Item(_)));
  }

  #[test]
  fn clones_share_one_batch_scope() {
    let (sink, rx) = queued_sink();
    let other = sink.clone();
    sink.batched(|| {
      other.push(Suggestion::new("from-clone"));
      sink.push(Suggestion::new("from-original"));
    });

    let messages: Vec<_> = rx.try_iter().collect();
    assert_eq!(messages.len(), 1);
    assert_eq!(names(&messages), ["from-clone", "from-original"]);
  }

  #[test]
  fn direct_sink_applies_immediately_and_parks_middle_matches() {
    let editor = EditorHandle::new("");
    let (sink, indicator) = direct_sink(&editor);

    sink.push(Suggestion::new("prefix"));
    sink.push(Suggestion::middle_match("middle"));
    assert_eq!(indicator.popup().item_count(), 1);

    sink.stop();
    let items = indicator.popup().items();
    assert_eq!(items.len(), 2);
    assert_eq!(items[1].text, "middle");
    assert!(items[1].middle_match);
  }

  #[test]
  fn direct_sink_cancels_on_a_busy_editor() {
    let editor = EditorHandle::new("");
    let (sink, indicator) = direct_sink(&editor);

    let _guard = editor.begin_exclusive().unwrap();
    sink.push(Suggestion::new("never-shown"));

    assert!(indicator.is_cancelled());
    assert_eq!(indicator.popup().item_count(), 0);
  }
}
