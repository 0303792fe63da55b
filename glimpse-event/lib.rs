//! Event plumbing shared by the completion coordinator: restartable
//! cancellation tokens and debounced async hooks.

mod cancel;
mod debounce;

pub use cancel::{
  Cancelled,
  TaskController,
  TaskHandle,
  cancelable_future,
};
pub use debounce::{
  AsyncHook,
  send_blocking,
  try_send,
};
