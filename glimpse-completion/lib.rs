//! Control plane for one editor completion interaction.
//!
//! A [`CompletionService`] owns the life cycle of "show completion
//! suggestions": a single current [`CompletionPhase`] mutated only on the
//! UI dispatcher, a document-preparation step for racing triggers, a
//! choice of inline or threaded gathering, and an ordered result queue
//! that applies suggestions transactionally. Hosts plug in
//! [`SuggestionProvider`]s, feed typing through [`AutoPopupHook`], and
//! drain posted work with [`CompletionService::pump`].

mod commit;
mod config;
mod dispatch;
mod editor;
mod gather;
mod indicator;
mod phase;
mod provider;
mod tracker;
mod trigger;
mod worker;

pub use commit::{
  CommitPrecondition,
  CommitRequest,
  CommitState,
  PendingCommit,
  is_expired,
  schedule_async_completion,
};
pub use config::CompletionConfig;
pub use dispatch::{
  DispatchError,
  DispatchMode,
  GatherHandle,
  ResultMessage,
  ResultSink,
};
pub use editor::{
  CaretSet,
  ChangeEvent,
  EditorHandle,
  ExclusiveGuard,
  ListenerToken,
  SavePoint,
  UiTransactionError,
};
pub use indicator::{
  CompletionIndicator,
  PopupEvent,
  PopupHandle,
};
pub use phase::{
  CompletionPhase,
  CompletionService,
  PhaseId,
  PhaseKind,
  ServiceHandle,
  StartDecision,
  UiJob,
};
pub use provider::{
  GatherContext,
  ProviderError,
  Suggestion,
  SuggestionProvider,
};
pub use tracker::ChangeTracker;
pub use trigger::{
  AutoPopupHook,
  TriggerEvent,
  TriggerToken,
  before_char_typed,
  char_typed,
};
