//! The document-preparation sub-phase: racing "stabilize the document"
//! requests that must produce at most one gathering start.

use std::thread;

use ropey::Rope;

use crate::{
  dispatch::DispatchMode,
  gather::{
    self,
    AttemptParams,
  },
  indicator::{
    CompletionIndicator,
    PopupHandle,
  },
  phase::{
    CompletionPhase,
    CompletionService,
    PhaseId,
  },
  tracker::ChangeTracker,
  trigger::TriggerToken,
};

/// State of the racing requests nested inside one `CommittingDocuments`
/// phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
  /// This many requests are still pending.
  InProgress(u32),
  /// Every request failed its precondition; the phase is unwinding.
  Cancelled,
  /// The owning phase was released.
  Disposed,
  /// One request won; gathering is starting.
  Success,
}

/// Bookkeeping for the requests. `Success` and `Cancelled` are mutually
/// exclusive terminal outcomes; `Disposed` follows either, or an early
/// release of the owning phase.
pub struct PendingCommit {
  state: CommitState,
}

impl PendingCommit {
  pub fn new() -> Self {
    Self {
      state: CommitState::InProgress(1),
    }
  }

  pub fn state(&self) -> CommitState {
    self.state
  }

  pub fn is_in_progress(&self) -> bool {
    matches!(self.state, CommitState::InProgress(_))
  }

  /// Joins another racing request. Legal only while in progress; anything
  /// else is a caller bug that is logged and ignored.
  pub fn add_request(&mut self) {
    match self.state {
      CommitState::InProgress(n) => self.state = CommitState::InProgress(n + 1),
      state => log::error!("add_request on a terminal commit sub-phase ({state:?})"),
    }
  }

  /// One request gave up. The last one to do so cancels the whole
  /// sub-phase. Returns the state afterwards.
  pub fn cancel_request(&mut self) -> CommitState {
    match self.state {
      CommitState::InProgress(1) => self.state = CommitState::Cancelled,
      CommitState::InProgress(n) => self.state = CommitState::InProgress(n - 1),
      state => log::debug!("cancel_request on a terminal commit sub-phase ({state:?})"),
    }
    self.state
  }

  /// One request won the race. Every other pending request becomes
  /// irrelevant. Returns whether the win counted.
  pub fn complete_request(&mut self) -> bool {
    match self.state {
      CommitState::InProgress(_) => {
        self.state = CommitState::Success;
        true
      },
      state => {
        log::debug!("complete_request on a terminal commit sub-phase ({state:?})");
        false
      },
    }
  }

  pub(crate) fn dispose(&mut self) {
    self.state = CommitState::Disposed;
  }
}

impl Default for PendingCommit {
  fn default() -> Self {
    Self::new()
  }
}

/// Whether a `CommittingDocuments` phase can still accept or serve
/// requests.
pub fn is_expired(tracker: &ChangeTracker, commit: &PendingCommit) -> bool {
  !commit.is_in_progress() || tracker.anything_happened()
}

/// Snapshot-consistent check a trigger supplies: given the text snapshot
/// and the caret offset at decision time, produce the definitive target
/// offset, or `None` when there is nothing left to complete.
pub type CommitPrecondition = Box<dyn FnOnce(&Rope, usize) -> Option<usize> + Send>;

/// One request to prepare the document and then start gathering.
pub struct CommitRequest {
  pub explicit:     bool,
  pub invocation:   u32,
  pub precondition: CommitPrecondition,
}

/// Starts or joins the document-preparation step for `token`, then, off
/// the UI dispatcher, re-resolves the caret against a text snapshot, runs
/// the caller's precondition, and pre-warms providers before handing back
/// to the dispatcher to start gathering.
///
/// Requests born from the same input event carry the same token and share
/// one phase; the first continuation to pass its checks wins.
pub fn schedule_async_completion(
  service: &mut CompletionService,
  token: TriggerToken,
  request: CommitRequest,
) {
  let offset = service.editor().primary_caret();

  let phase_id = match service.current_mut() {
    CompletionPhase::CommittingDocuments {
      id,
      token: current_token,
      tracker,
      commit,
      ..
    } if *current_token == token && !is_expired(tracker, commit) => {
      commit.add_request();
      *id
    },
    _ => {
      let id = PhaseId::next();
      let tracker = ChangeTracker::capture(service.editor());
      let indicator = request.explicit.then(|| {
        CompletionIndicator::new(
          service.editor().clone(),
          PopupHandle::new(),
          request.invocation,
          true,
        )
      });
      service.set_phase(CompletionPhase::CommittingDocuments {
        id,
        token,
        tracker,
        commit: PendingCommit::new(),
        indicator,
        replaced: false,
      });
      id
    },
  };

  let editor = service.editor().clone();
  let handle = service.handle();
  let providers = service.providers().to_vec();
  let CommitRequest {
    explicit,
    invocation,
    precondition,
  } = request;

  let spawned = thread::Builder::new()
    .name(format!("glimpse-commit-{}", phase_id.get()))
    .spawn(move || {
      // Snapshot once; everything below resolves against it.
      let text = editor.text();
      let resolved = if offset <= text.len_chars() {
        precondition(&text, offset)
      } else {
        None
      };
      if resolved.is_some() {
        for provider in &providers {
          provider.warm_up(&editor);
        }
      }
      handle.post(move |service| {
        finish_commit(service, phase_id, resolved, explicit, invocation);
      });
    });
  if let Err(err) = spawned {
    log::error!("failed to spawn the commit thread: {err}");
    // Unwind like a failed precondition so the phase ends normally.
    finish_commit(service, phase_id, None, explicit, invocation);
  }
}

/// Explicit background invocation: pre-create the indicator so the attempt
/// identity exists while documents stabilize, then run the normal
/// preparation step. The caret itself is the target.
pub(crate) fn invoke_async(service: &mut CompletionService, invocation: u32) {
  schedule_async_completion(service, TriggerToken::next(), CommitRequest {
    explicit: true,
    invocation,
    precondition: Box::new(|_text, offset| Some(offset)),
  });
}

enum Verdict {
  DropRequest,
  DropPhase(String),
  Won(usize),
}

/// Dispatcher-side continuation of one commit request. Decides against
/// live state; the background snapshot only proved the request plausible.
fn finish_commit(
  service: &mut CompletionService,
  phase_id: PhaseId,
  resolved: Option<usize>,
  explicit: bool,
  invocation: u32,
) {
  let matches_phase = matches!(
    service.current(),
    CompletionPhase::CommittingDocuments { id, .. } if *id == phase_id
  );
  if !matches_phase {
    log::debug!("commit continuation arrived for a superseded phase");
    return;
  }

  let verdict = match service.current_mut() {
    CompletionPhase::CommittingDocuments { tracker, commit, .. } => match resolved {
      None => Verdict::DropRequest,
      Some(_) if !commit.is_in_progress() => Verdict::DropRequest,
      Some(offset) => match tracker.change_reason() {
        Some(reason) => Verdict::DropPhase(reason),
        None => Verdict::Won(offset),
      },
    },
    _ => Verdict::DropRequest,
  };

  match verdict {
    Verdict::DropRequest => {
      let all_cancelled = match service.current_mut() {
        CompletionPhase::CommittingDocuments { commit, .. } => {
          matches!(commit.cancel_request(), CommitState::Cancelled)
        },
        _ => false,
      };
      if all_cancelled {
        service.set_phase(CompletionPhase::NoCompletion);
      }
    },
    Verdict::DropPhase(reason) => {
      log::debug!("completion environment changed while committing: {reason}");
      service.set_phase(CompletionPhase::NoCompletion);
    },
    Verdict::Won(offset) => {
      let won = match service.current_mut() {
        CompletionPhase::CommittingDocuments { commit, .. } => commit.complete_request(),
        _ => false,
      };
      if !won {
        return;
      }
      // Hand the pre-created indicator (explicit path) to the successor
      // before release runs, so it survives the phase swap.
      let taken = match service.current_mut() {
        CompletionPhase::CommittingDocuments {
          indicator,
          replaced,
          ..
        } => {
          *replaced = true;
          indicator.take()
        },
        _ => None,
      };
      gather::start_attempt(service, AttemptParams {
        offset,
        invocation,
        explicit,
        mode: DispatchMode::Background,
        indicator: taken,
        popup: None,
      });
    },
  }
}
