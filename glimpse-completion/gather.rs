//! One gathering attempt, from start to terminal phase.

use std::sync::Arc;

use crate::{
  dispatch::{
    self,
    DispatchMode,
    GatherWork,
  },
  editor::ChangeEvent,
  indicator::{
    CompletionIndicator,
    PopupHandle,
  },
  phase::{
    CompletionPhase,
    CompletionService,
    PhaseId,
    PhaseListeners,
  },
  provider::{
    GatherContext,
    ProviderError,
    SuggestionProvider,
  },
  tracker::ChangeTracker,
};

/// What one finished attempt reports back to the dispatcher.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttemptOutcome {
  pub applied:   usize,
  pub cancelled: bool,
}

pub(crate) struct AttemptParams {
  pub offset:     usize,
  pub invocation: u32,
  pub explicit:   bool,
  pub mode:       DispatchMode,
  /// Reuse this indicator (pre-created during document preparation)
  /// instead of making a fresh one.
  pub indicator:  Option<CompletionIndicator>,
  /// Reuse this popup (restart flow) for the fresh indicator.
  pub popup:      Option<PopupHandle>,
}

/// Starts one gathering attempt: installs the phase that owns it, then
/// hands the provider work to the chosen dispatch strategy.
pub(crate) fn start_attempt(service: &mut CompletionService, params: AttemptParams) {
  let AttemptParams {
    offset,
    invocation,
    explicit,
    mode,
    indicator,
    popup,
  } = params;

  let indicator = indicator.unwrap_or_else(|| {
    CompletionIndicator::new(
      service.editor().clone(),
      popup.unwrap_or_default(),
      invocation,
      explicit,
    )
  });
  let work = build_work(service.providers().to_vec(), &indicator, offset);

  let phase = match mode {
    DispatchMode::Sync => CompletionPhase::Synchronous {
      id: PhaseId::next(),
      indicator: indicator.clone(),
    },
    DispatchMode::Background => CompletionPhase::BackgroundCalculation {
      id: PhaseId::next(),
      indicator: indicator.clone(),
      listeners: install_invalidation_listeners(service, &indicator),
    },
  };
  service.set_phase(phase);

  let poll = service.config().result_poll();
  match dispatch::start_gathering(mode, &indicator, service.handle(), poll, work) {
    Ok(handle) => {
      service.store_gather(handle);
      if mode == DispatchMode::Sync {
        // Inline gathering already ran to completion; wrap up in place.
        let outcome = AttemptOutcome {
          applied:   indicator.popup().item_count(),
          cancelled: indicator.is_cancelled(),
        };
        finish_attempt(service, &indicator, outcome);
      }
    },
    Err(err) => {
      log::error!("could not start completion gathering: {err}");
      indicator.cancel();
      service.set_phase(CompletionPhase::NoCompletion);
    },
  }
}

/// Wires the editor events that invalidate an in-flight background
/// attempt: document edits ask for a restart, caret and selection moves
/// and focus loss cancel outright. The wrap-up grants the restart only
/// when the popup is already showing.
fn install_invalidation_listeners(
  service: &CompletionService,
  indicator: &CompletionIndicator,
) -> PhaseListeners {
  let mut listeners = PhaseListeners::new();
  let target = indicator.clone();
  listeners.push(service.editor().add_listener(move |event| match event {
    ChangeEvent::Document => target.schedule_restart(),
    ChangeEvent::Caret | ChangeEvent::Selection | ChangeEvent::Focus => target.cancel(),
  }));
  listeners
}

/// Zombie-phase hygiene: any further change expires the phase back to
/// idle. The expiry runs as a posted job, so listener callbacks never
/// mutate the machine re-entrantly.
fn install_expiry_listeners(service: &CompletionService, phase_id: PhaseId) -> PhaseListeners {
  let mut listeners = PhaseListeners::new();
  let handle = service.handle();
  listeners.push(service.editor().add_listener(move |event| {
    if matches!(
      event,
      ChangeEvent::Document | ChangeEvent::Caret | ChangeEvent::Selection
    ) {
      handle.post(move |service| {
        if service.current().id() == Some(phase_id) {
          service.set_phase(CompletionPhase::NoCompletion);
        }
      });
    }
  }));
  listeners
}

/// Wraps the registered providers into the closure one attempt runs off
/// the dispatcher. Not-ready providers are skipped; a failing provider
/// abandons the whole attempt; cancellation just stops the walk.
fn build_work(
  providers: Vec<Arc<dyn SuggestionProvider>>,
  indicator: &CompletionIndicator,
  offset: usize,
) -> GatherWork {
  let editor = indicator.editor().clone();
  let invocation = indicator.invocation_count();
  let explicit = indicator.is_explicit();
  let indicator = indicator.clone();
  Box::new(move |sink, handle| {
    let cx = GatherContext::new(editor, offset, invocation, explicit, handle, sink);
    for provider in providers {
      if cx.is_cancelled() {
        break;
      }
      match provider.gather(&cx) {
        Ok(()) => {},
        Err(ProviderError::Cancelled(_)) => break,
        Err(ProviderError::NotReady) => {
          log::debug!("provider {} not ready; skipped", provider.name());
        },
        Err(ProviderError::Other(err)) => {
          log::error!("provider {} failed: {err:#}", provider.name());
          indicator.cancel();
          break;
        },
      }
    }
  })
}

/// Dispatcher-side wrap-up of one attempt. Picks the terminal phase, or
/// restarts when a competing edit asked for one while results were
/// showing.
pub(crate) fn finish_attempt(
  service: &mut CompletionService,
  indicator: &CompletionIndicator,
  outcome: AttemptOutcome,
) {
  let still_current = matches!(
    service.current().indicator(),
    Some(current) if current.id() == indicator.id()
  );
  if !still_current {
    log::debug!("attempt {} finished after being superseded", indicator.id());
    return;
  }

  // The attempt is over; its invalidation listeners must not see the
  // wrap-up edits below.
  service.strip_current_listeners();

  if outcome.cancelled {
    // A restart keeps the session only once results made it to the
    // screen. An edit that lands before the popup shows unwinds the
    // attempt instead of silently re-gathering.
    if indicator.restart_scheduled() && indicator.popup().is_visible() {
      restart_attempt(service, indicator);
    } else {
      indicator.close_and_finish(false);
      service.set_phase(CompletionPhase::NoCompletion);
    }
    return;
  }

  let items = indicator.popup().item_count();
  log::debug!(
    "attempt {} finished with {} items ({} applied this round)",
    indicator.id(),
    items,
    outcome.applied
  );

  if items == 0 {
    indicator.close_and_finish(false);
    if indicator.is_explicit() {
      let id = PhaseId::next();
      let listeners = install_expiry_listeners(service, id);
      service.set_phase(CompletionPhase::NoSuggestionsHint {
        id,
        indicator: indicator.clone(),
        listeners,
      });
    } else {
      service.set_phase(CompletionPhase::EmptyAutoPopup {
        id:      PhaseId::next(),
        tracker: ChangeTracker::capture(service.editor()),
      });
    }
    return;
  }

  if items == 1 && indicator.is_explicit() && service.config().insert_single_item {
    insert_single_item(service, indicator);
    return;
  }

  service.set_phase(CompletionPhase::ItemsCalculated {
    id: PhaseId::next(),
    indicator: indicator.clone(),
  });
}

/// A competing edit asked for a fresh attempt: the popup survives, a new
/// indicator takes it over, and gathering reruns at the current caret.
fn restart_attempt(service: &mut CompletionService, indicator: &CompletionIndicator) {
  log::debug!(
    "restarting completion attempt {} with the popup kept",
    indicator.id()
  );
  let offset = service.editor().primary_caret();
  start_attempt(service, AttemptParams {
    offset,
    invocation: indicator.invocation_count(),
    explicit: indicator.is_explicit(),
    mode: DispatchMode::Background,
    indicator: None,
    popup: Some(indicator.popup().clone()),
  });
}

/// An explicit invocation found exactly one item: insert it outright and
/// remember how to undo the prefix on a repeated invocation.
fn insert_single_item(service: &mut CompletionService, indicator: &CompletionIndicator) {
  let Some(item) = indicator.popup().items().into_iter().next() else {
    indicator.close_and_finish(false);
    service.set_phase(CompletionPhase::NoCompletion);
    return;
  };

  let editor = service.editor().clone();
  indicator.set_savepoint(editor.savepoint());
  editor.insert(editor.primary_caret(), &item.text);

  // Listeners go in only after the insertion, so the phase cannot expire
  // on its own wrap-up edit. Closing does not restore; the save point
  // stays with the indicator for a repeated invocation.
  let id = PhaseId::next();
  let listeners = install_expiry_listeners(service, id);
  indicator.close_and_finish(false);
  service.set_phase(CompletionPhase::InsertedSingleItem {
    id,
    indicator: indicator.clone(),
    listeners,
  });
}
