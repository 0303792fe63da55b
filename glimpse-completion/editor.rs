//! The slice of editor state the coordinator observes and updates.
//!
//! The host owns real text editing; this handle models exactly the surface
//! the completion control plane needs: a version stamp, carets, change
//! listeners, an exclusive-operation gate for transactional UI updates, and
//! enough text to capture and restore completion prefixes.

use std::{
  ops::Range,
  sync::{
    Arc,
    atomic::{
      AtomicBool,
      AtomicU64,
      Ordering,
    },
  },
};

use parking_lot::{
  Mutex,
  RwLock,
};
use ropey::Rope;
use smallvec::{
  SmallVec,
  smallvec,
};
use thiserror::Error;

/// Caret offsets in chars, primary first. Never empty.
pub type CaretSet = SmallVec<[usize; 1]>;

/// Registration token for a change listener.
pub type ListenerToken = u64;

/// What changed in the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
  Document,
  Caret,
  Selection,
  Focus,
}

/// Why a UI transaction was refused. Refusal is final for the caller: the
/// attempt is abandoned, never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UiTransactionError {
  #[error("an exclusive editor operation is in progress")]
  Busy,
  #[error("the completion attempt was cancelled")]
  Cancelled,
}

/// Text and carets captured before a provisional edit.
#[derive(Debug, Clone, PartialEq)]
pub struct SavePoint {
  text:   Rope,
  carets: CaretSet,
}

impl SavePoint {
  pub fn text(&self) -> &Rope {
    &self.text
  }

  pub fn carets(&self) -> &CaretSet {
    &self.carets
  }
}

struct Listener {
  token:    ListenerToken,
  callback: Box<dyn FnMut(ChangeEvent) + Send>,
}

/// Cap on the trace-gated action log.
const ACTION_LOG_CAP: usize = 32;

struct EditorShared {
  version:       AtomicU64,
  text:          RwLock<Rope>,
  carets:        RwLock<CaretSet>,
  indexing:      AtomicBool,
  actions:       AtomicU64,
  action_log:    Mutex<Vec<String>>,
  exclusive:     AtomicBool,
  listeners:     Mutex<Vec<Listener>>,
  next_listener: AtomicU64,
}

/// Cloneable, thread-safe handle on one editor. Edits are expected to come
/// from the UI dispatcher; reads are safe from anywhere.
#[derive(Clone)]
pub struct EditorHandle {
  shared: Arc<EditorShared>,
}

impl EditorHandle {
  pub fn new(text: &str) -> Self {
    Self {
      shared: Arc::new(EditorShared {
        version:       AtomicU64::new(0),
        text:          RwLock::new(Rope::from_str(text)),
        carets:        RwLock::new(smallvec![0]),
        indexing:      AtomicBool::new(false),
        actions:       AtomicU64::new(0),
        action_log:    Mutex::new(Vec::new()),
        exclusive:     AtomicBool::new(false),
        listeners:     Mutex::new(Vec::new()),
        next_listener: AtomicU64::new(1),
      }),
    }
  }

  /// Monotonic document version, bumped on every text change.
  pub fn version(&self) -> u64 {
    self.shared.version.load(Ordering::Acquire)
  }

  /// Snapshot of the text. Rope clones share their backing storage, so
  /// this stays cheap and the snapshot stays consistent while edits
  /// continue elsewhere.
  pub fn text(&self) -> Rope {
    self.shared.text.read().clone()
  }

  pub fn len_chars(&self) -> usize {
    self.shared.text.read().len_chars()
  }

  pub fn carets(&self) -> CaretSet {
    self.shared.carets.read().clone()
  }

  pub fn primary_caret(&self) -> usize {
    self.shared.carets.read()[0]
  }

  pub fn is_indexing(&self) -> bool {
    self.shared.indexing.load(Ordering::Acquire)
  }

  pub fn set_indexing(&self, active: bool) {
    self.shared.indexing.store(active, Ordering::Release);
  }

  /// Count of editor actions recorded so far.
  pub fn action_count(&self) -> u64 {
    self.shared.actions.load(Ordering::Acquire)
  }

  /// Records that some editor action ran. The human-readable log only
  /// fills in under trace logging so the common path stays a counter bump.
  pub fn note_action(&self, name: &str) {
    self.shared.actions.fetch_add(1, Ordering::AcqRel);
    if log::log_enabled!(log::Level::Trace) {
      let mut entries = self.shared.action_log.lock();
      if entries.len() == ACTION_LOG_CAP {
        entries.remove(0);
      }
      entries.push(name.to_owned());
    }
  }

  /// Actions recorded while trace logging was enabled, oldest first.
  pub fn recent_actions(&self) -> Vec<String> {
    self.shared.action_log.lock().clone()
  }

  /// Inserts `text` at `char_idx`, shifting carets at or past the
  /// insertion point. Fires `Document` listeners.
  pub fn insert(&self, char_idx: usize, text: &str) {
    let inserted = text.chars().count();
    if inserted == 0 {
      return;
    }
    let at = {
      let mut rope = self.shared.text.write();
      let at = char_idx.min(rope.len_chars());
      rope.insert(at, text);
      at
    };
    {
      let mut carets = self.shared.carets.write();
      for caret in carets.iter_mut() {
        if *caret >= at {
          *caret += inserted;
        }
      }
    }
    self.shared.version.fetch_add(1, Ordering::AcqRel);
    self.fire(ChangeEvent::Document);
  }

  /// Removes the chars in `range`, pulling carets back. Fires `Document`
  /// listeners.
  pub fn remove(&self, range: Range<usize>) {
    let (start, end) = {
      let mut rope = self.shared.text.write();
      let end = range.end.min(rope.len_chars());
      let start = range.start.min(end);
      rope.remove(start..end);
      (start, end)
    };
    let removed = end - start;
    if removed == 0 {
      return;
    }
    {
      let mut carets = self.shared.carets.write();
      for caret in carets.iter_mut() {
        if *caret > end {
          *caret -= removed;
        } else if *caret > start {
          *caret = start;
        }
      }
    }
    self.shared.version.fetch_add(1, Ordering::AcqRel);
    self.fire(ChangeEvent::Document);
  }

  /// Moves the primary caret. Fires `Caret` listeners.
  pub fn move_caret(&self, offset: usize) {
    let clamped = offset.min(self.len_chars());
    self.shared.carets.write()[0] = clamped;
    self.fire(ChangeEvent::Caret);
  }

  /// Replaces the whole caret set, primary first. Fires `Caret` listeners.
  pub fn set_carets(&self, carets: CaretSet) {
    if carets.is_empty() {
      log::error!("refusing to install an empty caret set");
      return;
    }
    let len = self.len_chars();
    {
      let mut slot = self.shared.carets.write();
      *slot = carets;
      for caret in slot.iter_mut() {
        *caret = (*caret).min(len);
      }
    }
    self.fire(ChangeEvent::Caret);
  }

  /// Signals a selection change that did not move the primary caret.
  pub fn notify_selection_changed(&self) {
    self.fire(ChangeEvent::Selection);
  }

  /// Signals that the editor lost focus.
  pub fn notify_focus_lost(&self) {
    self.fire(ChangeEvent::Focus);
  }

  /// Captures text and carets for a later [`EditorHandle::restore`].
  pub fn savepoint(&self) -> SavePoint {
    SavePoint {
      text:   self.text(),
      carets: self.carets(),
    }
  }

  /// Puts text and carets back to a captured save point. Fires `Document`
  /// listeners.
  pub fn restore(&self, savepoint: &SavePoint) {
    *self.shared.text.write() = savepoint.text.clone();
    *self.shared.carets.write() = savepoint.carets.clone();
    self.shared.version.fetch_add(1, Ordering::AcqRel);
    self.fire(ChangeEvent::Document);
  }

  /// Registers a change listener. Callbacks run on the thread performing
  /// the change and must stay cheap; in particular they must not register
  /// or remove listeners themselves. Post a job back to the service for
  /// anything heavier than flag flips.
  pub fn add_listener(&self, callback: impl FnMut(ChangeEvent) + Send + 'static) -> ListenerToken {
    let token = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
    self.shared.listeners.lock().push(Listener {
      token,
      callback: Box::new(callback),
    });
    token
  }

  pub fn remove_listener(&self, token: ListenerToken) {
    self.shared.listeners.lock().retain(|l| l.token != token);
  }

  /// Number of live listeners. Mostly useful to verify phases clean up
  /// after themselves.
  pub fn listener_count(&self) -> usize {
    self.shared.listeners.lock().len()
  }

  fn fire(&self, event: ChangeEvent) {
    for listener in self.shared.listeners.lock().iter_mut() {
      (listener.callback)(event);
    }
  }

  /// Claims the editor for an exclusive operation, blocking UI
  /// transactions until the guard drops. `None` when someone else already
  /// holds the claim.
  pub fn begin_exclusive(&self) -> Option<ExclusiveGuard> {
    self
      .shared
      .exclusive
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .ok()?;
    Some(ExclusiveGuard {
      shared: Arc::clone(&self.shared),
    })
  }

  /// Runs `f` as one UI-equivalent update unless the exclusive gate is
  /// held or `cancelled` reports true. A refusal is final: callers abandon
  /// their attempt instead of retrying.
  pub fn try_ui_transaction<T>(
    &self,
    cancelled: impl Fn() -> bool,
    f: impl FnOnce() -> T,
  ) -> Result<T, UiTransactionError> {
    if cancelled() {
      return Err(UiTransactionError::Cancelled);
    }
    let Some(_guard) = self.begin_exclusive() else {
      return Err(UiTransactionError::Busy);
    };
    if cancelled() {
      return Err(UiTransactionError::Cancelled);
    }
    Ok(f())
  }
}

/// Holds the editor's exclusive-operation gate until dropped.
pub struct ExclusiveGuard {
  shared: Arc<EditorShared>,
}

impl Drop for ExclusiveGuard {
  fn drop(&mut self) {
    self.shared.exclusive.store(false, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    Mutex,
  };

  use super::*;

  #[test]
  fn insert_shifts_carets_at_or_past_the_edit() {
    let editor = EditorHandle::new("fn main() {}");
    editor.set_carets(smallvec![3, 10]);
    editor.insert(3, "my_");

    assert_eq!(editor.text().to_string(), "fn my_main() {}");
    assert_eq!(editor.carets().as_slice(), &[6, 13]);
    assert_eq!(editor.version(), 1);
  }

  #[test]
  fn remove_pulls_carets_back() {
    let editor = EditorHandle::new("hello world");
    editor.set_carets(smallvec![11, 8, 3]);
    editor.remove(5..8);

    assert_eq!(editor.text().to_string(), "hellorld");
    assert_eq!(editor.carets().as_slice(), &[8, 5, 3]);
  }

  #[test]
  fn savepoint_restores_text_and_carets() {
    let editor = EditorHandle::new("let x = ");
    editor.move_caret(8);
    let savepoint = editor.savepoint();

    editor.insert(8, "value");
    assert_eq!(editor.primary_caret(), 13);

    editor.restore(&savepoint);
    assert_eq!(editor.text().to_string(), "let x = ");
    assert_eq!(editor.primary_caret(), 8);
  }

  #[test]
  fn listeners_observe_changes_until_removed() {
    let editor = EditorHandle::new("");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let token = editor.add_listener(move |event| sink.lock().unwrap().push(event));

    editor.insert(0, "a");
    editor.move_caret(0);
    editor.notify_focus_lost();
    assert_eq!(seen.lock().unwrap().as_slice(), &[
      ChangeEvent::Document,
      ChangeEvent::Caret,
      ChangeEvent::Focus
    ]);

    editor.remove_listener(token);
    editor.insert(0, "b");
    assert_eq!(seen.lock().unwrap().len(), 3);
    assert_eq!(editor.listener_count(), 0);
  }

  #[test]
  fn exclusive_gate_refuses_transactions() {
    let editor = EditorHandle::new("");
    let guard = editor.begin_exclusive().unwrap();
    assert!(editor.begin_exclusive().is_none());

    let refused = editor.try_ui_transaction(|| false, || ());
    assert_eq!(refused.unwrap_err(), UiTransactionError::Busy);

    drop(guard);
    assert!(editor.try_ui_transaction(|| false, || ()).is_ok());
  }

  #[test]
  fn cancelled_transactions_never_run() {
    let editor = EditorHandle::new("");
    let mut ran = false;
    let refused = editor.try_ui_transaction(|| true, || ran = true);
    assert_eq!(refused.unwrap_err(), UiTransactionError::Cancelled);
    assert!(!ran);
  }

  #[test]
  fn action_log_fills_under_trace_only() {
    let editor = EditorHandle::new("");
    editor.note_action("reformat");
    assert_eq!(editor.action_count(), 1);
    // Trace logging is off in tests, so only the counter moves.
    assert!(editor.recent_actions().is_empty());
  }
}
