//! Typing-side entry points: the debounced auto-popup pipeline and the
//! two-step typed-character protocol.

use std::sync::{
  Arc,
  atomic::{
    AtomicU64,
    Ordering,
  },
};

use arc_swap::ArcSwap;
use tokio::{
  sync::mpsc::Sender,
  time::Instant,
};

use glimpse_event::{
  AsyncHook,
  TaskController,
};

use crate::{
  commit::{
    self,
    CommitRequest,
  },
  config::CompletionConfig,
  phase::{
    CompletionPhase,
    CompletionService,
    PhaseKind,
    ServiceHandle,
    StartDecision,
  },
};

static NEXT_TRIGGER_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identity of one input event. Requests born from the same event carry
/// the same token and may share a document-preparation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerToken(u64);

impl TriggerToken {
  pub fn next() -> Self {
    TriggerToken(NEXT_TRIGGER_TOKEN.fetch_add(1, Ordering::Relaxed))
  }

  pub fn get(self) -> u64 {
    self.0
  }
}

/// Events the typing side feeds into the auto-popup hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
  /// Plain typing reached the trigger word length at `offset`.
  Auto { offset: usize, token: TriggerToken },
  /// A provider trigger character was typed; `offset` is past it.
  TriggerChar { offset: usize, token: TriggerToken },
  /// The user asked outright. No debounce; fires on arrival.
  Manual { offset: usize, token: TriggerToken },
  /// Text was deleted; `offset` is where the deletion ended.
  DeleteText { offset: usize },
  /// Leaving insert context; drop everything pending.
  Cancel,
}

#[derive(Debug, Clone, Copy)]
struct PendingTrigger {
  offset: usize,
  token:  TriggerToken,
  kind:   TriggerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerKind {
  Auto,
  TriggerChar,
  Manual,
}

/// Debounced bridge between raw typing and the completion service. Runs as
/// a background task; `finish_debounce` hands over to the UI dispatcher
/// through a posted job.
pub struct AutoPopupHook {
  service:    ServiceHandle,
  config:     Arc<ArcSwap<CompletionConfig>>,
  pending:    Option<PendingTrigger>,
  in_flight:  Option<PendingTrigger>,
  controller: TaskController,
}

impl AutoPopupHook {
  pub fn new(service: &CompletionService) -> Self {
    Self {
      service:    service.handle(),
      config:     service.config_store(),
      pending:    None,
      in_flight:  None,
      controller: TaskController::new(),
    }
  }

  /// Spawns the hook onto the current tokio runtime and returns its event
  /// channel.
  pub fn spawn(self) -> Sender<TriggerEvent> {
    AsyncHook::spawn(self)
  }
}

impl AsyncHook for AutoPopupHook {
  type Event = TriggerEvent;

  fn handle_event(&mut self, event: TriggerEvent, timeout: Option<Instant>) -> Option<Instant> {
    if self.in_flight.is_some() && !self.controller.is_running() {
      self.in_flight = None;
    }

    let config = self.config.load();
    match event {
      TriggerEvent::Auto { offset, token } => {
        if !config.auto_popup {
          return timeout;
        }
        self.pending = Some(PendingTrigger {
          offset,
          token,
          kind: TriggerKind::Auto,
        });
        Some(Instant::now() + config.auto_popup_delay())
      },
      TriggerEvent::TriggerChar { offset, token } => {
        if !config.auto_popup {
          return timeout;
        }
        // A trigger char supersedes whatever was brewing.
        self.controller.cancel();
        self.pending = Some(PendingTrigger {
          offset,
          token,
          kind: TriggerKind::TriggerChar,
        });
        Some(Instant::now() + config.trigger_char_delay())
      },
      TriggerEvent::Manual { offset, token } => {
        self.pending = Some(PendingTrigger {
          offset,
          token,
          kind: TriggerKind::Manual,
        });
        self.finish_debounce();
        None
      },
      TriggerEvent::DeleteText { offset } => {
        // Deleting back past the position a request was made for kills
        // the request; the context it saw no longer exists.
        match self.pending.or(self.in_flight) {
          Some(PendingTrigger { offset: requested, .. }) if offset < requested => {
            self.pending = None;
            self.in_flight = None;
            self.controller.cancel();
            None
          },
          _ => timeout,
        }
      },
      TriggerEvent::Cancel => {
        self.pending = None;
        self.in_flight = None;
        self.controller.cancel();
        None
      },
    }
  }

  fn finish_debounce(&mut self) {
    let Some(trigger) = self.pending.take() else {
      return;
    };
    self.in_flight = Some(trigger);
    let guard = self.controller.restart();
    self.service.post(move |service| {
      if guard.is_canceled() {
        return;
      }
      start_scheduled_trigger(service, trigger);
    });
  }
}

/// Dispatcher side of a fired trigger.
fn start_scheduled_trigger(service: &mut CompletionService, trigger: PendingTrigger) {
  // Phases that own a live attempt react to edits through their own
  // listeners; a debounce firing into them must not start a second
  // pipeline.
  if matches!(
    service.current_kind(),
    PhaseKind::Synchronous | PhaseKind::BackgroundCalculation | PhaseKind::ItemsCalculated
  ) {
    return;
  }

  match trigger.kind {
    TriggerKind::Manual => service.invoke(crate::dispatch::DispatchMode::Background),
    TriggerKind::Auto | TriggerKind::TriggerChar => {
      let requested = trigger.offset;
      commit::schedule_async_completion(service, trigger.token, CommitRequest {
        explicit: false,
        invocation: 0,
        precondition: Box::new(move |text, offset| {
          // More typing may have carried the caret forward; a backwards
          // move means the trigger context is gone.
          (offset >= requested && offset <= text.len_chars()).then_some(offset)
        }),
      });
    },
  }
}

/// First half of the typed-character protocol, called before the char is
/// inserted. True means the auto popup may stay silent for this char.
pub fn before_char_typed(service: &mut CompletionService, c: char) -> bool {
  if !matches!(service.current_kind(), PhaseKind::EmptyAutoPopup) {
    return false;
  }
  matches!(
    service.new_completion_started(0, false, Some(c)),
    StartDecision::Suppressed
  )
}

/// Second half, called after the char landed in the document. Re-anchors a
/// suppressed empty-popup snapshot, or emits the matching trigger event.
pub fn char_typed(
  service: &mut CompletionService,
  c: char,
  suppressed: bool,
  hook: &Sender<TriggerEvent>,
) {
  if suppressed {
    if let CompletionPhase::EmptyAutoPopup { tracker, .. } = service.current_mut() {
      tracker.ignore_current_change();
    }
    return;
  }

  if matches!(
    service.current_kind(),
    PhaseKind::Synchronous | PhaseKind::BackgroundCalculation | PhaseKind::ItemsCalculated
  ) {
    // A live attempt already watches the document; its own listeners
    // decide between restart and cancel.
    return;
  }

  let config = service.config();
  if !config.auto_popup {
    return;
  }

  let offset = service.editor().primary_caret();
  if provider_trigger_char(service, c) {
    glimpse_event::send_blocking(hook, TriggerEvent::TriggerChar {
      offset,
      token: TriggerToken::next(),
    });
  } else if is_word_char(c) && word_run_len(service, offset) >= config.trigger_word_len {
    glimpse_event::send_blocking(hook, TriggerEvent::Auto {
      offset,
      token: TriggerToken::next(),
    });
  }
}

fn provider_trigger_char(service: &CompletionService, c: char) -> bool {
  service
    .providers()
    .iter()
    .any(|provider| provider.trigger_chars().contains(&c))
}

fn is_word_char(c: char) -> bool {
  c.is_alphanumeric() || c == '_'
}

/// Length of the word-character run ending at `offset`.
fn word_run_len(service: &CompletionService, offset: usize) -> usize {
  let text = service.editor().text();
  text
    .chars_at(offset.min(text.len_chars()))
    .reversed()
    .take_while(|&ch| is_word_char(ch))
    .count()
}
