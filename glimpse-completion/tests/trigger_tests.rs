//! The typed-character protocol and the debounced auto-popup hook, driven
//! the way a host input loop would drive them.

use std::{
  sync::{
    Arc,
    Mutex,
  },
  time::{
    Duration,
    Instant,
  },
};

use glimpse_completion::{
  AutoPopupHook,
  CommitRequest,
  CompletionConfig,
  CompletionService,
  EditorHandle,
  GatherContext,
  PhaseKind,
  ProviderError,
  Suggestion,
  SuggestionProvider,
  TriggerEvent,
  TriggerToken,
  before_char_typed,
  char_typed,
  schedule_async_completion,
};

/// Fixed list of suggestions, with a record of every run.
struct ListProvider {
  items:    Vec<Suggestion>,
  triggers: Vec<char>,
  runs:     Arc<Mutex<Vec<u32>>>,
}

impl ListProvider {
  fn new(items: &[&str]) -> Self {
    Self {
      items:    items.iter().copied().map(Suggestion::new).collect(),
      triggers: Vec::new(),
      runs:     Arc::new(Mutex::new(Vec::new())),
    }
  }

  fn with_triggers(mut self, triggers: &[char]) -> Self {
    self.triggers = triggers.to_vec();
    self
  }

  fn runs(&self) -> Arc<Mutex<Vec<u32>>> {
    Arc::clone(&self.runs)
  }
}

impl SuggestionProvider for ListProvider {
  fn name(&self) -> &str {
    "list"
  }

  fn trigger_chars(&self) -> &[char] {
    &self.triggers
  }

  fn gather(&self, cx: &GatherContext) -> Result<(), ProviderError> {
    self.runs.lock().unwrap().push(cx.invocation());
    cx.add_all(self.items.clone());
    Ok(())
  }
}

fn config(auto_delay_ms: u64) -> CompletionConfig {
  CompletionConfig {
    auto_popup_delay_ms: auto_delay_ms,
    result_poll_ms: 5,
    ..CompletionConfig::default()
  }
}

fn service_with(
  text: &str,
  caret: usize,
  config: CompletionConfig,
  provider: ListProvider,
) -> CompletionService {
  let editor = EditorHandle::new(text);
  editor.move_caret(caret);
  let mut service = CompletionService::new(editor, config);
  service.register_provider(Arc::new(provider));
  service
}

async fn pump_until_kind(service: &mut CompletionService, kind: PhaseKind) -> bool {
  let start = Instant::now();
  while start.elapsed() < Duration::from_secs(5) {
    service.pump();
    if service.current_kind() == kind {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(2)).await;
  }
  false
}

fn pump_until_kind_blocking(service: &mut CompletionService, kind: PhaseKind) -> bool {
  let start = Instant::now();
  while start.elapsed() < Duration::from_secs(5) {
    service.pump();
    if service.current_kind() == kind {
      return true;
    }
    std::thread::sleep(Duration::from_millis(2));
  }
  false
}

/// Runs the auto pipeline far enough to park the machine in the
/// empty-auto-popup phase.
fn drive_to_empty_auto_popup(service: &mut CompletionService) {
  schedule_async_completion(service, TriggerToken::next(), CommitRequest {
    explicit:     false,
    invocation:   0,
    precondition: Box::new(|_text, offset| Some(offset)),
  });
  assert!(pump_until_kind_blocking(service, PhaseKind::EmptyAutoPopup));
}

#[tokio::test(flavor = "current_thread")]
async fn auto_trigger_fires_after_the_debounce() {
  let provider = ListProvider::new(&["ab_item"]);
  let runs = provider.runs();
  let mut service = service_with("ab", 2, config(10), provider);
  let tx = AutoPopupHook::new(&service).spawn();

  tx.send(TriggerEvent::Auto {
    offset: 2,
    token:  TriggerToken::next(),
  })
  .await
  .unwrap();

  assert!(pump_until_kind(&mut service, PhaseKind::ItemsCalculated).await);
  assert_eq!(runs.lock().unwrap().as_slice(), &[0]);
}

#[tokio::test(flavor = "current_thread")]
async fn rapid_typing_coalesces_into_one_request() {
  let provider = ListProvider::new(&["abc_item"]);
  let mut service = service_with("abc", 3, config(50), provider);
  let commits = Arc::new(Mutex::new(0usize));
  {
    let commits = Arc::clone(&commits);
    service.add_phase_observer(move |_from, to| {
      if to == PhaseKind::CommittingDocuments {
        *commits.lock().unwrap() += 1;
      }
    });
  }
  let tx = AutoPopupHook::new(&service).spawn();

  for offset in [2, 3] {
    tx.send(TriggerEvent::Auto {
      offset,
      token: TriggerToken::next(),
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(3)).await;
  }

  assert!(pump_until_kind(&mut service, PhaseKind::ItemsCalculated).await);
  tokio::time::sleep(Duration::from_millis(40)).await;
  service.pump();
  assert_eq!(*commits.lock().unwrap(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn deleting_before_the_trigger_point_cancels_the_request() {
  let provider = ListProvider::new(&["item"]);
  let runs = provider.runs();
  let mut service = service_with("ab", 2, config(50), provider);
  let tx = AutoPopupHook::new(&service).spawn();

  tx.send(TriggerEvent::Auto {
    offset: 2,
    token:  TriggerToken::next(),
  })
  .await
  .unwrap();
  tx.send(TriggerEvent::DeleteText { offset: 1 }).await.unwrap();

  tokio::time::sleep(Duration::from_millis(60)).await;
  service.pump();
  assert_eq!(service.current_kind(), PhaseKind::NoCompletion);
  assert!(runs.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn deletion_after_the_debounce_cancels_the_posted_job() {
  let provider = ListProvider::new(&["item"]);
  let runs = provider.runs();
  let mut service = service_with("ab", 2, config(5), provider);
  let tx = AutoPopupHook::new(&service).spawn();

  tx.send(TriggerEvent::Auto {
    offset: 2,
    token:  TriggerToken::next(),
  })
  .await
  .unwrap();
  // The debounce has fired and the job sits unpumped in the queue.
  tokio::time::sleep(Duration::from_millis(40)).await;

  tx.send(TriggerEvent::DeleteText { offset: 0 }).await.unwrap();
  tokio::time::sleep(Duration::from_millis(20)).await;

  service.pump();
  assert_eq!(service.current_kind(), PhaseKind::NoCompletion);
  assert!(runs.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn manual_triggers_skip_the_debounce() {
  let provider = ListProvider::new(&["now-a", "now-b"]);
  let mut service = service_with("ab", 2, config(10_000), provider);
  let tx = AutoPopupHook::new(&service).spawn();

  let sent = Instant::now();
  tx.send(TriggerEvent::Manual {
    offset: 2,
    token:  TriggerToken::next(),
  })
  .await
  .unwrap();

  assert!(pump_until_kind(&mut service, PhaseKind::ItemsCalculated).await);
  // Nowhere near the configured ten-second typing debounce.
  assert!(sent.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "current_thread")]
async fn trigger_chars_supersede_the_typing_debounce() {
  let provider = ListProvider::new(&["member"]).with_triggers(&['.']);
  let mut service = service_with("a.", 2, config(10_000), provider);
  let tx = AutoPopupHook::new(&service).spawn();

  tx.send(TriggerEvent::Auto {
    offset: 1,
    token:  TriggerToken::next(),
  })
  .await
  .unwrap();
  tx.send(TriggerEvent::TriggerChar {
    offset: 2,
    token:  TriggerToken::next(),
  })
  .await
  .unwrap();

  let sent = Instant::now();
  assert!(pump_until_kind(&mut service, PhaseKind::ItemsCalculated).await);
  assert!(sent.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "current_thread")]
async fn cancel_event_drops_everything_pending() {
  let provider = ListProvider::new(&["item"]);
  let runs = provider.runs();
  let mut service = service_with("ab", 2, config(50), provider);
  let tx = AutoPopupHook::new(&service).spawn();

  tx.send(TriggerEvent::Auto {
    offset: 2,
    token:  TriggerToken::next(),
  })
  .await
  .unwrap();
  tx.send(TriggerEvent::Cancel).await.unwrap();

  tokio::time::sleep(Duration::from_millis(60)).await;
  service.pump();
  assert_eq!(service.current_kind(), PhaseKind::NoCompletion);
  assert!(runs.lock().unwrap().is_empty());
}

#[test]
fn typed_chars_emit_the_matching_trigger_event() {
  let provider = ListProvider::new(&["item"]).with_triggers(&['.']);
  let mut service = service_with("ab", 2, config(10), provider);
  let (tx, mut rx) = tokio::sync::mpsc::channel(8);

  // Two word chars precede the caret: plain typing triggers.
  char_typed(&mut service, 'b', false, &tx);
  assert!(matches!(
    rx.try_recv().unwrap(),
    TriggerEvent::Auto { offset: 2, .. }
  ));

  // A provider trigger character wins over the word-run rule.
  service.editor().insert(2, ".");
  char_typed(&mut service, '.', false, &tx);
  assert!(matches!(
    rx.try_recv().unwrap(),
    TriggerEvent::TriggerChar { offset: 3, .. }
  ));
}

#[test]
fn short_word_runs_stay_quiet() {
  let provider = ListProvider::new(&["item"]);
  let mut service = service_with("a", 1, config(10), provider);
  let (tx, mut rx) = tokio::sync::mpsc::channel(8);

  char_typed(&mut service, 'a', false, &tx);
  assert!(rx.try_recv().is_err());
}

#[test]
fn disabled_auto_popup_emits_nothing() {
  let provider = ListProvider::new(&["item"]);
  let mut service = service_with("ab", 2, CompletionConfig {
    auto_popup: false,
    ..config(10)
  }, provider);
  let (tx, mut rx) = tokio::sync::mpsc::channel(8);

  char_typed(&mut service, 'b', false, &tx);
  assert!(rx.try_recv().is_err());
}

#[test]
fn empty_auto_popup_suppresses_quiet_typing_and_reanchors() {
  let provider = ListProvider::new(&[]);
  let mut service = service_with("ab", 2, config(10), provider);
  let (tx, mut rx) = tokio::sync::mpsc::channel(8);

  drive_to_empty_auto_popup(&mut service);

  let suppressed = before_char_typed(&mut service, 'x');
  assert!(suppressed);
  service.editor().insert(2, "x");
  char_typed(&mut service, 'x', suppressed, &tx);
  assert!(rx.try_recv().is_err());
  assert_eq!(service.current_kind(), PhaseKind::EmptyAutoPopup);

  // The snapshot re-anchored on the typed char, so the next quiet char is
  // still suppressed.
  assert!(before_char_typed(&mut service, 'y'));

  // Any real environment change ends the suppression.
  service.editor().set_indexing(true);
  assert!(!before_char_typed(&mut service, 'z'));
}

#[test]
fn restart_chars_break_through_the_empty_popup() {
  let provider = ListProvider::new(&[]).with_triggers(&['(']);
  let mut service = service_with("ab", 2, CompletionConfig {
    popup_restart_chars: vec!['('],
    ..config(10)
  }, provider);
  let (tx, mut rx) = tokio::sync::mpsc::channel(8);

  drive_to_empty_auto_popup(&mut service);

  let suppressed = before_char_typed(&mut service, '(');
  assert!(!suppressed);
  service.editor().insert(2, "(");
  char_typed(&mut service, '(', suppressed, &tx);
  assert!(matches!(
    rx.try_recv().unwrap(),
    TriggerEvent::TriggerChar { offset: 3, .. }
  ));
}

#[test]
fn live_attempts_swallow_further_typed_chars() {
  let provider = ListProvider::new(&["one", "two"]);
  let mut service = service_with("ab", 2, config(10), provider);
  let (tx, mut rx) = tokio::sync::mpsc::channel(8);

  schedule_async_completion(&mut service, TriggerToken::next(), CommitRequest {
    explicit:     false,
    invocation:   0,
    precondition: Box::new(|_text, offset| Some(offset)),
  });
  assert!(pump_until_kind_blocking(&mut service, PhaseKind::ItemsCalculated));

  // The live phase owns the reaction to typing; no new pipeline starts.
  char_typed(&mut service, 'c', false, &tx);
  assert!(rx.try_recv().is_err());
}
