//! Single consumer that applies ordered completion results to the popup.

use std::time::Duration;

use crossbeam::channel::{
  Receiver,
  RecvTimeoutError,
};

use crate::{
  dispatch::ResultMessage,
  editor::UiTransactionError,
  gather::{
    self,
    AttemptOutcome,
  },
  indicator::CompletionIndicator,
  phase::ServiceHandle,
  provider::Suggestion,
};

/// Drains one attempt's result queue on its own named thread and applies
/// everything in arrival order, one UI transaction per drain cycle.
pub(crate) struct ResultWorker {
  pub channel:   Receiver<ResultMessage>,
  pub indicator: CompletionIndicator,
  pub service:   ServiceHandle,
  pub poll:      Duration,
}

impl ResultWorker {
  pub fn run(self) {
    let mut pending: Vec<Suggestion> = Vec::new();
    let mut middles: Vec<Suggestion> = Vec::new();
    let mut applied = 0usize;
    let mut stopped = false;

    'drain: while !stopped {
      // Wait for the next message, waking often enough to notice
      // cancellation promptly.
      let first = loop {
        if self.indicator.is_cancelled() {
          break 'drain;
        }
        match self.channel.recv_timeout(self.poll) {
          Ok(message) => break message,
          Err(RecvTimeoutError::Timeout) => {},
          Err(RecvTimeoutError::Disconnected) => break 'drain,
        }
      };

      stopped = self.file_message(first, &mut pending, &mut middles);
      while !stopped {
        match self.channel.try_recv() {
          Ok(message) => stopped = self.file_message(message, &mut pending, &mut middles),
          Err(_) => break,
        }
      }

      if stopped {
        // Deferred middle matches surface once, at the very end.
        pending.append(&mut middles);
      }
      if pending.is_empty() {
        continue;
      }

      match self.indicator.update_ui(|| self.indicator.apply_items(&pending)) {
        Ok(()) => {
          applied += pending.len();
          pending.clear();
        },
        Err(UiTransactionError::Busy) => {
          log::warn!(
            "ui transaction refused; cancelling completion attempt {}",
            self.indicator.id()
          );
          self.indicator.cancel();
          break 'drain;
        },
        Err(UiTransactionError::Cancelled) => break 'drain,
      }
    }

    let outcome = AttemptOutcome {
      applied,
      cancelled: self.indicator.is_cancelled(),
    };
    log::debug!(
      "completion attempt {} drained: {} applied, cancelled: {}",
      self.indicator.id(),
      outcome.applied,
      outcome.cancelled
    );
    let indicator = self.indicator.clone();
    self.service.post(move |service| {
      gather::finish_attempt(service, &indicator, outcome);
    });
  }

  /// Files one message into the right bucket; returns whether it was the
  /// stop marker.
  fn file_message(
    &self,
    message: ResultMessage,
    pending: &mut Vec<Suggestion>,
    middles: &mut Vec<Suggestion>,
  ) -> bool {
    match message {
      ResultMessage::Item(s) if s.middle_match => middles.push(s),
      ResultMessage::Item(s) => pending.push(s),
      ResultMessage::Batch(items) => {
        for s in items {
          if s.middle_match {
            middles.push(s);
          } else {
            pending.push(s);
          }
        }
      },
      ResultMessage::Stop => return true,
    }
    false
  }
}

#[cfg(test)]
mod tests {
  use std::thread;

  use crossbeam::channel;

  use super::*;
  use crate::{
    config::CompletionConfig,
    editor::EditorHandle,
    indicator::PopupHandle,
    phase::CompletionService,
    provider::Suggestion,
  };

  fn harness() -> (CompletionService, CompletionIndicator) {
    let editor = EditorHandle::new("");
    let service = CompletionService::new(editor.clone(), CompletionConfig::default());
    let indicator = CompletionIndicator::new(editor, PopupHandle::new(), 1, false);
    (service, indicator)
  }

  fn spawn_worker(
    indicator: &CompletionIndicator,
    service: &CompletionService,
  ) -> (channel::Sender<ResultMessage>, thread::JoinHandle<()>) {
    let (tx, rx) = channel::unbounded();
    let worker = ResultWorker {
      channel:   rx,
      indicator: indicator.clone(),
      service:   service.handle(),
      poll:      Duration::from_millis(5),
    };
    (tx, thread::spawn(move || worker.run()))
  }

  #[test]
  fn applies_in_arrival_order_with_middles_last() {
    let (service, indicator) = harness();
    let (tx, worker) = spawn_worker(&indicator, &service);

    tx.send(ResultMessage::Item(Suggestion::new("a"))).unwrap();
    tx.send(ResultMessage::Item(Suggestion::middle_match("m"))).unwrap();
    tx.send(ResultMessage::Batch(vec![
      Suggestion::new("b"),
      Suggestion::new("c"),
    ]))
    .unwrap();
    tx.send(ResultMessage::Stop).unwrap();
    worker.join().unwrap();

    let texts: Vec<_> = indicator
      .popup()
      .items()
      .into_iter()
      .map(|s| s.text)
      .collect();
    assert_eq!(texts, ["a", "b", "c", "m"]);
  }

  #[test]
  fn busy_editor_cancels_the_attempt() {
    let (service, indicator) = harness();
    let guard = indicator.editor().begin_exclusive().unwrap();
    let (tx, worker) = spawn_worker(&indicator, &service);

    tx.send(ResultMessage::Item(Suggestion::new("never"))).unwrap();
    tx.send(ResultMessage::Stop).unwrap();
    worker.join().unwrap();
    drop(guard);

    assert!(indicator.is_cancelled());
    assert_eq!(indicator.popup().item_count(), 0);
  }

  #[test]
  fn cancellation_stops_the_drain_without_a_stop_marker() {
    let (service, indicator) = harness();
    let (_tx, worker) = spawn_worker(&indicator, &service);

    indicator.cancel();
    // Bounded by the poll interval; join hangs forever if the worker
    // misses the flag.
    worker.join().unwrap();
  }
}
