//! The completion phase machine: one current phase per service, mutated on
//! the UI dispatcher only, with release-on-replace resource handling.

use std::{
  mem,
  panic::{
    self,
    AssertUnwindSafe,
  },
  sync::{
    Arc,
    atomic::{
      AtomicU64,
      Ordering,
    },
  },
  thread::{
    self,
    ThreadId,
  },
};

use arc_swap::ArcSwap;
use crossbeam::channel::{
  self,
  Receiver,
  Sender,
};
use smallvec::SmallVec;

use crate::{
  commit::{
    self,
    PendingCommit,
  },
  config::CompletionConfig,
  dispatch::{
    DispatchMode,
    GatherHandle,
  },
  editor::{
    EditorHandle,
    ListenerToken,
  },
  gather::{
    self,
    AttemptParams,
  },
  indicator::CompletionIndicator,
  provider::SuggestionProvider,
  tracker::ChangeTracker,
  trigger::TriggerToken,
};

static NEXT_PHASE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one phase instance. Continuations posted from background
/// threads compare these to find out whether their phase is still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhaseId(u64);

impl PhaseId {
  pub(crate) fn next() -> Self {
    PhaseId(NEXT_PHASE_ID.fetch_add(1, Ordering::Relaxed))
  }

  pub fn get(self) -> u64 {
    self.0
  }
}

/// Which step of the completion life cycle is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
  NoCompletion,
  CommittingDocuments,
  Synchronous,
  BackgroundCalculation,
  ItemsCalculated,
  EmptyAutoPopup,
  InsertedSingleItem,
  NoSuggestionsHint,
}

/// Listener registrations owned by a phase.
pub(crate) type PhaseListeners = SmallVec<[ListenerToken; 2]>;

/// The current step of one completion interaction, together with the
/// resources that step owns. Replacing the phase releases those resources;
/// nothing else does.
pub enum CompletionPhase {
  /// Idle. Owns nothing.
  NoCompletion,
  /// Waiting for the document to stabilize before real work may start.
  CommittingDocuments {
    id:        PhaseId,
    token:     TriggerToken,
    tracker:   ChangeTracker,
    commit:    PendingCommit,
    /// Pre-created for explicit invocations; handed to the successor
    /// phase when a request wins.
    indicator: Option<CompletionIndicator>,
    /// The indicator now belongs to a successor phase, so release must
    /// leave it alone.
    replaced:  bool,
  },
  /// Inline gathering on the dispatcher. Never observable mid-flight.
  Synchronous {
    id:        PhaseId,
    indicator: CompletionIndicator,
  },
  /// Background gathering in progress.
  BackgroundCalculation {
    id:        PhaseId,
    indicator: CompletionIndicator,
    listeners: PhaseListeners,
  },
  /// Results are showing.
  ItemsCalculated {
    id:        PhaseId,
    indicator: CompletionIndicator,
  },
  /// An auto-popup ran and found nothing. Holds the snapshot that decides
  /// whether further typing may skip popping up again.
  EmptyAutoPopup {
    id:      PhaseId,
    tracker: ChangeTracker,
  },
  /// An explicit invocation found exactly one item and inserted it.
  InsertedSingleItem {
    id:        PhaseId,
    indicator: CompletionIndicator,
    listeners: PhaseListeners,
  },
  /// An explicit invocation found nothing to suggest.
  NoSuggestionsHint {
    id:        PhaseId,
    indicator: CompletionIndicator,
    listeners: PhaseListeners,
  },
}

impl CompletionPhase {
  pub fn kind(&self) -> PhaseKind {
    match self {
      Self::NoCompletion => PhaseKind::NoCompletion,
      Self::CommittingDocuments { .. } => PhaseKind::CommittingDocuments,
      Self::Synchronous { .. } => PhaseKind::Synchronous,
      Self::BackgroundCalculation { .. } => PhaseKind::BackgroundCalculation,
      Self::ItemsCalculated { .. } => PhaseKind::ItemsCalculated,
      Self::EmptyAutoPopup { .. } => PhaseKind::EmptyAutoPopup,
      Self::InsertedSingleItem { .. } => PhaseKind::InsertedSingleItem,
      Self::NoSuggestionsHint { .. } => PhaseKind::NoSuggestionsHint,
    }
  }

  pub fn id(&self) -> Option<PhaseId> {
    match self {
      Self::NoCompletion => None,
      Self::CommittingDocuments { id, .. }
      | Self::Synchronous { id, .. }
      | Self::BackgroundCalculation { id, .. }
      | Self::ItemsCalculated { id, .. }
      | Self::EmptyAutoPopup { id, .. }
      | Self::InsertedSingleItem { id, .. }
      | Self::NoSuggestionsHint { id, .. } => Some(*id),
    }
  }

  /// The attempt this phase carries, if any.
  pub fn indicator(&self) -> Option<&CompletionIndicator> {
    match self {
      Self::NoCompletion | Self::EmptyAutoPopup { .. } => None,
      Self::CommittingDocuments { indicator, .. } => indicator.as_ref(),
      Self::Synchronous { indicator, .. }
      | Self::BackgroundCalculation { indicator, .. }
      | Self::ItemsCalculated { indicator, .. }
      | Self::InsertedSingleItem { indicator, .. }
      | Self::NoSuggestionsHint { indicator, .. } => Some(indicator),
    }
  }
}

/// Answer to "a new completion wants to start while you are current".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
  /// Go ahead, with this invocation count.
  Proceed { invocation: u32 },
  /// Do not start anything; the current phase stays.
  Suppressed,
}

/// Work posted back onto the UI dispatcher.
pub type UiJob = Box<dyn FnOnce(&mut CompletionService) + Send>;

type PhaseObserver = Box<dyn FnMut(PhaseKind, PhaseKind)>;

pub(crate) struct ServiceShared {
  current_id: AtomicU64,
  jobs_tx:    Sender<UiJob>,
  jobs_rx:    Receiver<UiJob>,
}

/// Thread-safe face of the service for background code: post jobs back to
/// the dispatcher, and read the current phase id for cheap staleness
/// checks.
#[derive(Clone)]
pub struct ServiceHandle {
  shared: Arc<ServiceShared>,
}

impl ServiceHandle {
  /// Queues `job` for the next [`CompletionService::pump`].
  pub fn post(&self, job: impl FnOnce(&mut CompletionService) + Send + 'static) {
    let _ = self.shared.jobs_tx.send(Box::new(job));
  }

  /// Raw id of the current phase, `0` while idle. May be stale by the time
  /// it is read; posted jobs re-check on the dispatcher.
  pub fn current_phase_id(&self) -> u64 {
    self.shared.current_id.load(Ordering::Acquire)
  }
}

/// Dispatcher-owned coordinator for one editor's completion.
///
/// All phase mutation happens through this value on the thread that
/// created it. Background code talks to it through [`ServiceHandle`] jobs,
/// drained by the host's dispatcher loop calling
/// [`CompletionService::pump`].
pub struct CompletionService {
  editor:    EditorHandle,
  config:    Arc<ArcSwap<CompletionConfig>>,
  providers: Vec<Arc<dyn SuggestionProvider>>,
  current:   CompletionPhase,
  shared:    Arc<ServiceShared>,
  observers: Vec<PhaseObserver>,
  gather:    Option<GatherHandle>,
  ui_thread: ThreadId,
}

impl CompletionService {
  pub fn new(editor: EditorHandle, config: CompletionConfig) -> Self {
    let (jobs_tx, jobs_rx) = channel::unbounded();
    Self {
      editor,
      config: Arc::new(ArcSwap::from_pointee(config)),
      providers: Vec::new(),
      current: CompletionPhase::NoCompletion,
      shared: Arc::new(ServiceShared {
        current_id: AtomicU64::new(0),
        jobs_tx,
        jobs_rx,
      }),
      observers: Vec::new(),
      gather: None,
      ui_thread: thread::current().id(),
    }
  }

  pub fn editor(&self) -> &EditorHandle {
    &self.editor
  }

  /// Configuration current attempts started with.
  pub fn config(&self) -> Arc<CompletionConfig> {
    self.config.load_full()
  }

  /// Swaps in a new configuration; takes effect for subsequent attempts.
  pub fn update_config(&self, config: CompletionConfig) {
    self.config.store(Arc::new(config));
  }

  pub(crate) fn config_store(&self) -> Arc<ArcSwap<CompletionConfig>> {
    Arc::clone(&self.config)
  }

  pub fn register_provider(&mut self, provider: Arc<dyn SuggestionProvider>) {
    self.providers.push(provider);
  }

  pub(crate) fn providers(&self) -> &[Arc<dyn SuggestionProvider>] {
    &self.providers
  }

  pub fn handle(&self) -> ServiceHandle {
    ServiceHandle {
      shared: Arc::clone(&self.shared),
    }
  }

  /// Drains pending UI jobs. The host calls this from its dispatcher loop
  /// whenever the handle may have been posted to.
  pub fn pump(&mut self) -> usize {
    let mut ran = 0;
    while let Ok(job) = self.shared.jobs_rx.try_recv() {
      job(self);
      ran += 1;
    }
    ran
  }

  pub fn current(&self) -> &CompletionPhase {
    &self.current
  }

  pub(crate) fn current_mut(&mut self) -> &mut CompletionPhase {
    &mut self.current
  }

  pub fn current_kind(&self) -> PhaseKind {
    self.current.kind()
  }

  /// Observer for phase transitions, called `(from, to)` after each one.
  /// Telemetry only: a panicking observer is caught and logged, and cannot
  /// wedge the machine.
  pub fn add_phase_observer(&mut self, observer: impl FnMut(PhaseKind, PhaseKind) + 'static) {
    self.observers.push(Box::new(observer));
  }

  /// Handle on the most recent attempt's threads. Hosts that want a clean
  /// shutdown take it and join.
  pub fn take_gather(&mut self) -> Option<GatherHandle> {
    self.gather.take()
  }

  pub(crate) fn store_gather(&mut self, handle: GatherHandle) {
    self.gather = Some(handle);
  }

  /// The single way to replace the current phase. Releases the outgoing
  /// phase's resources exactly once, then notifies observers.
  pub fn set_phase(&mut self, next: CompletionPhase) {
    self.assert_ui_thread("set_phase");
    let to = next.kind();
    let previous = mem::replace(&mut self.current, next);
    let from = previous.kind();
    self
      .shared
      .current_id
      .store(self.current.id().map_or(0, PhaseId::get), Ordering::Release);
    self.release(previous);
    log::debug!("completion phase {from:?} -> {to:?}");
    self.notify_observers(from, to);
  }

  fn release(&mut self, phase: CompletionPhase) {
    match phase {
      CompletionPhase::NoCompletion | CompletionPhase::EmptyAutoPopup { .. } => {},
      CompletionPhase::CommittingDocuments {
        mut commit,
        indicator,
        replaced,
        ..
      } => {
        commit.dispose();
        if !replaced {
          if let Some(indicator) = indicator {
            indicator.close_and_finish(false);
          }
        }
      },
      CompletionPhase::Synchronous { indicator, .. }
      | CompletionPhase::ItemsCalculated { indicator, .. } => {
        indicator.close_and_finish(false);
      },
      CompletionPhase::BackgroundCalculation {
        indicator,
        listeners,
        ..
      }
      | CompletionPhase::InsertedSingleItem {
        indicator,
        listeners,
        ..
      }
      | CompletionPhase::NoSuggestionsHint {
        indicator,
        listeners,
        ..
      } => {
        for token in listeners {
          self.editor.remove_listener(token);
        }
        indicator.close_and_finish(false);
      },
    }
  }

  /// Detaches the current phase's editor listeners ahead of wrap-up edits,
  /// so finishing an attempt cannot trip its own invalidation.
  pub(crate) fn strip_current_listeners(&mut self) {
    let editor = self.editor.clone();
    match &mut self.current {
      CompletionPhase::BackgroundCalculation { listeners, .. }
      | CompletionPhase::InsertedSingleItem { listeners, .. }
      | CompletionPhase::NoSuggestionsHint { listeners, .. } => {
        for token in listeners.drain(..) {
          editor.remove_listener(token);
        }
      },
      _ => {},
    }
  }

  /// Tells the current phase that a fresh completion request is about to
  /// start. `typed` carries the triggering character on the typed path;
  /// only the empty-auto-popup phase looks at it.
  ///
  /// Every non-idle phase reacts by wrapping up whatever it owns; the one
  /// exception is the empty auto-popup, which may veto the start outright.
  pub fn new_completion_started(
    &mut self,
    invocation: u32,
    repeated: bool,
    typed: Option<char>,
  ) -> StartDecision {
    self.assert_ui_thread("new_completion_started");
    match &self.current {
      CompletionPhase::NoCompletion | CompletionPhase::CommittingDocuments { .. } => {
        StartDecision::Proceed { invocation }
      },
      CompletionPhase::Synchronous { .. } => {
        // Inline gathering finishes before anything else may run on the
        // dispatcher; observing it here means the protocol broke. Heal
        // and move on.
        log::error!("new completion started while a synchronous attempt is still current");
        self.set_phase(CompletionPhase::NoCompletion);
        StartDecision::Proceed { invocation }
      },
      CompletionPhase::BackgroundCalculation { indicator, .. } => {
        let previous = indicator.invocation_count();
        indicator.cancel();
        let next = if repeated {
          previous.saturating_add(1).max(2)
        } else {
          invocation
        };
        StartDecision::Proceed { invocation: next }
      },
      CompletionPhase::ItemsCalculated { .. } => {
        self.set_phase(CompletionPhase::NoCompletion);
        StartDecision::Proceed { invocation }
      },
      CompletionPhase::InsertedSingleItem { indicator, .. } => {
        let indicator = indicator.clone();
        self.strip_current_listeners();
        if repeated {
          // A repeated invocation wants to widen the search for the text
          // the user originally typed, not for the inserted item.
          indicator.restore_prefix();
        }
        self.set_phase(CompletionPhase::NoCompletion);
        StartDecision::Proceed {
          invocation: bumped(invocation, repeated),
        }
      },
      CompletionPhase::NoSuggestionsHint { .. } => {
        self.strip_current_listeners();
        self.set_phase(CompletionPhase::NoCompletion);
        StartDecision::Proceed {
          invocation: bumped(invocation, repeated),
        }
      },
      CompletionPhase::EmptyAutoPopup { tracker, .. } => {
        let quiet = !tracker.anything_happened();
        let bypass = typed.is_some_and(|c| self.config.load().is_restart_char(c));
        if typed.is_some() && quiet && !bypass {
          // Nothing moved and the char is not one that must reopen the
          // popup: keep showing nothing instead of re-running providers.
          StartDecision::Suppressed
        } else {
          StartDecision::Proceed { invocation }
        }
      },
    }
  }

  /// Explicitly invokes completion at the primary caret.
  pub fn invoke(&mut self, mode: DispatchMode) {
    self.assert_ui_thread("invoke");
    let repeated = matches!(
      self.current_kind(),
      PhaseKind::BackgroundCalculation
        | PhaseKind::ItemsCalculated
        | PhaseKind::InsertedSingleItem
        | PhaseKind::NoSuggestionsHint
    );
    let invocation = match self.new_completion_started(1, repeated, None) {
      StartDecision::Proceed { invocation } => invocation,
      StartDecision::Suppressed => return,
    };
    match mode {
      DispatchMode::Sync => {
        let offset = self.editor.primary_caret();
        gather::start_attempt(self, AttemptParams {
          offset,
          invocation,
          explicit: true,
          mode,
          indicator: None,
          popup: None,
        });
      },
      DispatchMode::Background => {
        commit::invoke_async(self, invocation);
      },
    }
  }

  /// Drops whatever is in flight and returns to idle. The host's escape
  /// hatch for focus loss and explicit dismissal.
  pub fn cancel_completion(&mut self) {
    self.assert_ui_thread("cancel_completion");
    if !matches!(self.current, CompletionPhase::NoCompletion) {
      self.set_phase(CompletionPhase::NoCompletion);
    }
  }

  /// Runs `f` with result batching for the active attempt: suggestions
  /// published while `f` runs land as one transactional update when it
  /// returns. Without an active attempt this is just `f`.
  pub fn with_batched_results<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
    let sink = self.current.indicator().and_then(|indicator| indicator.sink());
    match sink {
      Some(sink) => sink.batched(|| f(self)),
      None => f(self),
    }
  }

  fn assert_ui_thread(&self, operation: &str) {
    let current = thread::current().id();
    if current != self.ui_thread {
      log::error!("{operation} called off the ui dispatcher ({current:?}); state may be racing");
    }
  }

  fn notify_observers(&mut self, from: PhaseKind, to: PhaseKind) {
    for observer in &mut self.observers {
      if panic::catch_unwind(AssertUnwindSafe(|| observer(from, to))).is_err() {
        log::error!("phase observer panicked on {from:?} -> {to:?}");
      }
    }
  }
}

fn bumped(invocation: u32, repeated: bool) -> u32 {
  if repeated {
    invocation.saturating_add(1)
  } else {
    invocation
  }
}
