//! Request execution.
//!
//! [`RequestExecutor`] drives one request through connection establishment,
//! transmission, header framing and body materialization, recording a
//! [`Timings`] timeline on the way and notifying [`LogHooks`] subscribers
//! before and after.

pub use executor::{failure_response, RequestExecutor};
pub use hooks::{
    ClientInfo, HookFuture, LogHook, LogHooks, RequestSummary, ResponseSummary, TracingLogHook,
};
pub use retry::{backoff, DelayFn, RetryPolicy};
pub use timings::Timings;

mod executor;
mod hooks;
mod retry;
mod timings;
