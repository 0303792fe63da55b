//! Point-in-time fingerprint of the editor environment.

use crate::editor::{
  CaretSet,
  EditorHandle,
};

/// Snapshot of everything that invalidates an in-flight completion:
/// document version, caret positions, background indexing, and whether any
/// editor action ran at all. Capture once, ask later whether the world
/// still matches.
#[derive(Clone)]
pub struct ChangeTracker {
  editor:   EditorHandle,
  version:  u64,
  carets:   CaretSet,
  indexing: bool,
  actions:  u64,
}

impl ChangeTracker {
  pub fn capture(editor: &EditorHandle) -> Self {
    Self {
      editor:   editor.clone(),
      version:  editor.version(),
      carets:   editor.carets(),
      indexing: editor.is_indexing(),
      actions:  editor.action_count(),
    }
  }

  /// Whether anything at all happened since the capture.
  pub fn anything_happened(&self) -> bool {
    self.change_reason().is_some()
  }

  /// Human-readable account of the first difference found, `None` while
  /// the environment still matches the capture.
  pub fn change_reason(&self) -> Option<String> {
    let editor = &self.editor;
    if editor.version() != self.version {
      return Some(format!(
        "document changed (v{} -> v{})",
        self.version,
        editor.version()
      ));
    }
    let carets = editor.carets();
    if carets != self.carets {
      return Some(format!("carets moved ({:?} -> {:?})", self.carets, carets));
    }
    if editor.is_indexing() != self.indexing {
      return Some("background indexing flipped".to_owned());
    }
    if editor.action_count() != self.actions {
      // The named log only exists under trace logging.
      let recent = editor.recent_actions();
      if recent.is_empty() {
        return Some("an editor action ran since capture".to_owned());
      }
      return Some(format!("editor actions ran since capture: {recent:?}"));
    }
    None
  }

  /// Re-anchors the snapshot on the current editor state so the change
  /// that just landed stops counting as a difference.
  pub fn ignore_current_change(&mut self) {
    let editor = self.editor.clone();
    *self = Self::capture(&editor);
  }

  pub fn editor(&self) -> &EditorHandle {
    &self.editor
  }
}
