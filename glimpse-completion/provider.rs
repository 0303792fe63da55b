//! Suggestion providers, the pluggable sources one gathering attempt runs.

use thiserror::Error;

use glimpse_event::{
  Cancelled,
  TaskHandle,
};

use crate::{
  dispatch::ResultSink,
  editor::EditorHandle,
};

/// One completion suggestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
  pub text:         String,
  pub detail:       Option<String>,
  /// Matched somewhere other than the prefix. Parked until the attempt
  /// finishes so prefix matches always surface first.
  pub middle_match: bool,
}

impl Suggestion {
  pub fn new(text: impl Into<String>) -> Self {
    Self {
      text:         text.into(),
      detail:       None,
      middle_match: false,
    }
  }

  pub fn middle_match(text: impl Into<String>) -> Self {
    Self {
      middle_match: true,
      ..Self::new(text)
    }
  }

  pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
    self.detail = Some(detail.into());
    self
  }
}

/// How a provider run can end early.
#[derive(Debug, Error)]
pub enum ProviderError {
  /// The attempt was cancelled underneath the provider. Expected; never
  /// logged as an error.
  #[error(transparent)]
  Cancelled(#[from] Cancelled),
  /// The provider's backing data is not ready yet. The provider is
  /// skipped; the attempt continues with the others.
  #[error("provider data is not ready")]
  NotReady,
  /// Anything else. Logged, and the whole attempt is abandoned.
  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

/// Everything a provider sees while gathering runs off the UI dispatcher.
pub struct GatherContext {
  editor:     EditorHandle,
  offset:     usize,
  invocation: u32,
  explicit:   bool,
  handle:     TaskHandle,
  sink:       ResultSink,
}

impl GatherContext {
  pub(crate) fn new(
    editor: EditorHandle,
    offset: usize,
    invocation: u32,
    explicit: bool,
    handle: TaskHandle,
    sink: ResultSink,
  ) -> Self {
    Self {
      editor,
      offset,
      invocation,
      explicit,
      handle,
      sink,
    }
  }

  pub fn editor(&self) -> &EditorHandle {
    &self.editor
  }

  /// Caret offset the attempt was started for.
  pub fn offset(&self) -> usize {
    self.offset
  }

  /// How many times in a row completion has been invoked here. Providers
  /// typically widen their net on higher counts.
  pub fn invocation(&self) -> u32 {
    self.invocation
  }

  /// Whether the user asked for completion outright.
  pub fn is_explicit(&self) -> bool {
    self.explicit
  }

  pub fn is_cancelled(&self) -> bool {
    self.handle.is_canceled()
  }

  /// Poll this between units of work; errs once the attempt is cancelled,
  /// so `?` unwinds the provider cleanly.
  pub fn check_cancelled(&self) -> Result<(), Cancelled> {
    self.handle.check()
  }

  /// Publishes one suggestion. Arrival order is presentation order.
  pub fn add(&self, suggestion: Suggestion) {
    self.sink.push(suggestion);
  }

  /// Publishes a group of suggestions as one ordered unit.
  pub fn add_all(&self, suggestions: Vec<Suggestion>) {
    self.sink.push_all(suggestions);
  }

  /// Runs `f` with result batching: everything added inside the scope
  /// lands as a single transactional update when the scope closes.
  pub fn batched<T>(&self, f: impl FnOnce() -> T) -> T {
    self.sink.batched(f)
  }
}

/// A source of completion suggestions.
///
/// Runs off the UI dispatcher. Implementations must poll
/// [`GatherContext::check_cancelled`] at reasonable intervals and must
/// never touch the phase machine; their whole interface to the world is
/// the context they are handed.
pub trait SuggestionProvider: Send + Sync + 'static {
  fn name(&self) -> &str;

  /// Characters that should pop completion up almost immediately after
  /// being typed.
  fn trigger_chars(&self) -> &[char] {
    &[]
  }

  /// Called off the UI dispatcher while documents stabilize, to warm
  /// caches before gathering starts.
  fn warm_up(&self, _editor: &EditorHandle) {}

  /// Produces suggestions for the position in `cx`.
  fn gather(&self, cx: &GatherContext) -> Result<(), ProviderError>;
}
