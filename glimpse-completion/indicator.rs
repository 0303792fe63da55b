//! The cancellable handle for one gathering attempt, and the popup surface
//! it feeds.

use std::sync::{
  Arc,
  atomic::{
    AtomicBool,
    AtomicU64,
    Ordering,
  },
};

use crossbeam::channel::{
  self,
  Receiver,
  Sender,
};
use parking_lot::Mutex;

use glimpse_event::{
  TaskController,
  TaskHandle,
};

use crate::{
  dispatch::ResultSink,
  editor::{
    EditorHandle,
    SavePoint,
    UiTransactionError,
  },
  provider::Suggestion,
};

static NEXT_INDICATOR_ID: AtomicU64 = AtomicU64::new(1);

/// What the popup surface tells the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopupEvent {
  Shown,
  ItemsApplied { total: usize },
  Closed { restored: bool },
  RestartScheduled,
}

struct PopupShared {
  items:     Mutex<Vec<Suggestion>>,
  visible:   AtomicBool,
  owner:     AtomicU64,
  events_tx: Sender<PopupEvent>,
  events_rx: Receiver<PopupEvent>,
}

/// The UI-facing suggestion list for one completion session.
///
/// A session can span several gathering attempts (restarts). Only the
/// attempt currently owning the popup may mutate it, which is what makes
/// updates from superseded attempts harmless.
#[derive(Clone)]
pub struct PopupHandle {
  shared: Arc<PopupShared>,
}

impl PopupHandle {
  pub fn new() -> Self {
    let (events_tx, events_rx) = channel::unbounded();
    Self {
      shared: Arc::new(PopupShared {
        items: Mutex::new(Vec::new()),
        visible: AtomicBool::new(false),
        owner: AtomicU64::new(0),
        events_tx,
        events_rx,
      }),
    }
  }

  /// Stream of presentation events, drainable from any thread.
  pub fn events(&self) -> Receiver<PopupEvent> {
    self.shared.events_rx.clone()
  }

  pub fn items(&self) -> Vec<Suggestion> {
    self.shared.items.lock().clone()
  }

  pub fn item_count(&self) -> usize {
    self.shared.items.lock().len()
  }

  pub fn is_visible(&self) -> bool {
    self.shared.visible.load(Ordering::Acquire)
  }

  fn owner(&self) -> u64 {
    self.shared.owner.load(Ordering::Acquire)
  }

  /// Hands the popup to a new attempt. Items of the previous owner are
  /// dropped; visibility carries over so a restart does not flicker.
  fn take_ownership(&self, indicator_id: u64) {
    self.shared.owner.store(indicator_id, Ordering::Release);
    self.shared.items.lock().clear();
  }

  fn push_event(&self, event: PopupEvent) {
    let _ = self.shared.events_tx.send(event);
  }

  fn apply(&self, indicator_id: u64, items: &[Suggestion]) {
    if items.is_empty() {
      return;
    }
    if self.owner() != indicator_id {
      log::debug!("ignoring popup update from superseded attempt {indicator_id}");
      return;
    }
    let total = {
      let mut slot = self.shared.items.lock();
      slot.extend_from_slice(items);
      slot.len()
    };
    if !self.shared.visible.swap(true, Ordering::AcqRel) {
      self.push_event(PopupEvent::Shown);
    }
    self.push_event(PopupEvent::ItemsApplied { total });
  }

  fn close(&self, indicator_id: u64, restored: bool) {
    if self.owner() != indicator_id {
      return;
    }
    self.shared.items.lock().clear();
    if self.shared.visible.swap(false, Ordering::AcqRel) {
      self.push_event(PopupEvent::Closed { restored });
    }
  }
}

impl Default for PopupHandle {
  fn default() -> Self {
    Self::new()
  }
}

struct IndicatorShared {
  id:         u64,
  invocation: u32,
  explicit:   bool,
  editor:     EditorHandle,
  popup:      PopupHandle,
  cancelled:  AtomicBool,
  finished:   AtomicBool,
  restart:    AtomicBool,
  controller: Mutex<TaskController>,
  handle:     TaskHandle,
  savepoint:  Mutex<Option<SavePoint>>,
  sink:       Mutex<Option<ResultSink>>,
}

/// The cancellable handle representing one in-flight completion attempt.
///
/// Cloneable and thread-safe. Background producers poll it for
/// cancellation; the UI side cancels, finishes, and feeds it into the next
/// phase. Taking popup ownership happens at construction, so making a new
/// indicator for an existing popup is the hand-over.
#[derive(Clone)]
pub struct CompletionIndicator {
  shared: Arc<IndicatorShared>,
}

impl CompletionIndicator {
  pub(crate) fn new(
    editor: EditorHandle,
    popup: PopupHandle,
    invocation: u32,
    explicit: bool,
  ) -> Self {
    let id = NEXT_INDICATOR_ID.fetch_add(1, Ordering::Relaxed);
    let mut controller = TaskController::new();
    let handle = controller.restart();
    popup.take_ownership(id);
    Self {
      shared: Arc::new(IndicatorShared {
        id,
        invocation,
        explicit,
        editor,
        popup,
        cancelled: AtomicBool::new(false),
        finished: AtomicBool::new(false),
        restart: AtomicBool::new(false),
        controller: Mutex::new(controller),
        handle,
        savepoint: Mutex::new(None),
        sink: Mutex::new(None),
      }),
    }
  }

  pub fn id(&self) -> u64 {
    self.shared.id
  }

  pub fn invocation_count(&self) -> u32 {
    self.shared.invocation
  }

  pub fn is_explicit(&self) -> bool {
    self.shared.explicit
  }

  pub fn editor(&self) -> &EditorHandle {
    &self.shared.editor
  }

  pub fn popup(&self) -> &PopupHandle {
    &self.shared.popup
  }

  /// Cancellation token for background work tied to this attempt.
  pub fn task_handle(&self) -> TaskHandle {
    self.shared.handle.clone()
  }

  pub fn is_cancelled(&self) -> bool {
    self.shared.cancelled.load(Ordering::Acquire)
  }

  /// Stops the attempt. Safe from any thread; repeated calls do nothing.
  pub fn cancel(&self) {
    if self.shared.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    self.shared.controller.lock().cancel();
    log::debug!("completion attempt {} cancelled", self.shared.id);
  }

  /// Asks for a fresh attempt that keeps the popup. Cancels this one; the
  /// dispatcher-side continuation performs the actual restart.
  pub fn schedule_restart(&self) {
    if self.shared.finished.load(Ordering::Acquire) {
      return;
    }
    if self.shared.restart.swap(true, Ordering::AcqRel) {
      return;
    }
    log::debug!("restart scheduled for completion attempt {}", self.shared.id);
    self.cancel();
    self.shared.popup.push_event(PopupEvent::RestartScheduled);
  }

  pub fn restart_scheduled(&self) -> bool {
    self.shared.restart.load(Ordering::Acquire)
  }

  pub fn is_finished(&self) -> bool {
    self.shared.finished.load(Ordering::Acquire)
  }

  pub(crate) fn set_savepoint(&self, savepoint: SavePoint) {
    *self.shared.savepoint.lock() = Some(savepoint);
  }

  pub(crate) fn set_sink(&self, sink: ResultSink) {
    *self.shared.sink.lock() = Some(sink);
  }

  /// Sink of the running attempt, while one is wired up.
  pub(crate) fn sink(&self) -> Option<ResultSink> {
    self.shared.sink.lock().clone()
  }

  /// Puts back the text captured before a provisional insertion. One shot;
  /// works even after the attempt finished.
  pub fn restore_prefix(&self) -> bool {
    let savepoint = self.shared.savepoint.lock().take();
    match savepoint {
      Some(savepoint) => {
        self.shared.editor.restore(&savepoint);
        true
      },
      None => false,
    }
  }

  /// Ends the attempt exactly once: cancels outstanding work, optionally
  /// restores the pre-insertion save point, and closes the popup if this
  /// attempt still owns it.
  pub fn close_and_finish(&self, restore_prefix: bool) {
    if self.shared.finished.swap(true, Ordering::AcqRel) {
      return;
    }
    self.cancel();
    let restored = restore_prefix && self.restore_prefix();
    self.shared.popup.close(self.shared.id, restored);
  }

  /// Applies suggestions to the popup. Call inside [`Self::update_ui`].
  pub(crate) fn apply_items(&self, items: &[Suggestion]) {
    self.shared.popup.apply(self.shared.id, items);
  }

  /// One transactional, cancellation-checked UI update. A refusal is
  /// final: the caller abandons the attempt rather than retrying.
  pub fn update_ui<T>(&self, f: impl FnOnce() -> T) -> Result<T, UiTransactionError> {
    self
      .shared
      .editor
      .try_ui_transaction(|| self.is_cancelled(), f)
  }
}
