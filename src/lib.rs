pub mod client;
pub mod codec;
pub mod message;
pub mod network;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{LogHook, LogHooks, RequestExecutor, RetryPolicy, Timings};
pub use message::{Endpoint, InboundResponse, Method, OutboundRequest, ResponseBody};
pub use service::{setup_local_tracing, setup_tracing, AppError, AppResult, TransportConfig};
