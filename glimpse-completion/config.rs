//! Completion policy knobs, loadable from TOML.

use std::time::Duration;

use serde::Deserialize;

/// Everything about completion behavior that is policy rather than
/// mechanism. Hosts load this once and may swap it at runtime; attempts
/// read the value that was current when they started.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct CompletionConfig {
  /// Pop the suggestion list up automatically while typing.
  pub auto_popup:          bool,
  /// Debounce for plain typing before an auto trigger fires, in ms.
  pub auto_popup_delay_ms: u64,
  /// Debounce after a provider trigger character, in ms. Much shorter
  /// than the typing debounce: the user just asked for members.
  pub trigger_char_delay_ms: u64,
  /// How many word characters must precede the caret before plain typing
  /// may trigger the popup.
  pub trigger_word_len:    usize,
  /// Characters that force a fresh popup even while a just-finished empty
  /// auto-popup would normally suppress one. Host policy; empty unless
  /// configured.
  pub popup_restart_chars: Vec<char>,
  /// Insert outright when an explicit invocation finds exactly one item.
  pub insert_single_item:  bool,
  /// How long the result worker sleeps between cancellation checks while
  /// waiting for more results, in ms.
  pub result_poll_ms:      u64,
}

impl Default for CompletionConfig {
  fn default() -> Self {
    Self {
      auto_popup:            true,
      auto_popup_delay_ms:   120,
      trigger_char_delay_ms: 5,
      trigger_word_len:      2,
      popup_restart_chars:   Vec::new(),
      insert_single_item:    true,
      result_poll_ms:        30,
    }
  }
}

impl CompletionConfig {
  pub fn from_toml(source: &str) -> Result<Self, toml::de::Error> {
    toml::from_str(source)
  }

  pub fn auto_popup_delay(&self) -> Duration {
    Duration::from_millis(self.auto_popup_delay_ms)
  }

  pub fn trigger_char_delay(&self) -> Duration {
    Duration::from_millis(self.trigger_char_delay_ms)
  }

  pub fn result_poll(&self) -> Duration {
    Duration::from_millis(self.result_poll_ms)
  }

  pub fn is_restart_char(&self, c: char) -> bool {
    self.popup_restart_chars.contains(&c)
  }
}
