use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::Timings;
use crate::message::{Endpoint, HeaderMap, InboundResponse, Method, OutboundRequest};
use crate::AppResult;

/// Identity of the executor a hook is called for.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: Uuid,
    pub endpoint: String,
    pub user_agent: String,
}

impl ClientInfo {
    pub fn new(endpoint: &Endpoint, user_agent: &str) -> Self {
        ClientInfo {
            id: Uuid::new_v4(),
            endpoint: endpoint.to_string(),
            user_agent: user_agent.to_string(),
        }
    }
}

/// What hooks get to see of a request, the body itself stays with the executor.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    pub body_length: u64,
}

impl RequestSummary {
    pub fn new(request: &OutboundRequest, endpoint: &Endpoint) -> Self {
        RequestSummary {
            method: request.method.clone(),
            target: request.target(endpoint),
            headers: request.headers.clone(),
            body_length: request.body_length(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseSummary {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    /// `None` while the body is still streaming.
    pub body_length: Option<usize>,
    pub synthetic: bool,
}

impl ResponseSummary {
    pub fn new(response: &InboundResponse) -> Self {
        ResponseSummary {
            status: response.status(),
            reason: response.reason().to_string(),
            headers: response.headers().clone(),
            body_length: response.body_bytes().map(|b| b.len()),
            synthetic: response.is_synthetic(),
        }
    }
}

pub type HookFuture<'a> = Pin<Box<dyn Future<Output = AppResult<()>> + Send + 'a>>;

/// A subscriber notified before each request and after each response.
pub trait LogHook: Send + Sync {
    fn on_request<'a>(
        &'a self,
        at: DateTime<Utc>,
        client: &'a ClientInfo,
        request: &'a RequestSummary,
    ) -> HookFuture<'a>;

    fn on_response<'a>(
        &'a self,
        at: DateTime<Utc>,
        client: &'a ClientInfo,
        request: &'a RequestSummary,
        response: &'a ResponseSummary,
    ) -> HookFuture<'a>;
}

/// Writes one debug line per request and response.
#[derive(Debug, Default, Clone)]
pub struct TracingLogHook;

impl LogHook for TracingLogHook {
    fn on_request<'a>(
        &'a self,
        at: DateTime<Utc>,
        client: &'a ClientInfo,
        request: &'a RequestSummary,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            debug!(
                "[{}] {} -> {} {} ({} body bytes) at {}",
                client.id,
                client.endpoint,
                request.method,
                request.target,
                request.body_length,
                at.to_rfc3339()
            );
            Ok(())
        })
    }

    fn on_response<'a>(
        &'a self,
        at: DateTime<Utc>,
        client: &'a ClientInfo,
        request: &'a RequestSummary,
        response: &'a ResponseSummary,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            debug!(
                "[{}] {} {} <- {} {}{} at {}",
                client.id,
                request.method,
                request.target,
                response.status,
                response.reason,
                if response.synthetic { " (synthetic)" } else { "" },
                at.to_rfc3339()
            );
            Ok(())
        })
    }
}

/// Ordered subscriber list. Subscribers run one after another, a failing one
/// is recorded and the rest still run.
#[derive(Default)]
pub struct LogHooks {
    subscribers: RwLock<Vec<Arc<dyn LogHook>>>,
}

impl LogHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, hook: Arc<dyn LogHook>) {
        self.subscribers.write().push(hook);
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn LogHook>> {
        self.subscribers.read().clone()
    }

    pub async fn notify_request(
        &self,
        client: &ClientInfo,
        request: &RequestSummary,
        timings: &mut Timings,
    ) {
        let subscribers = self.snapshot();
        if subscribers.is_empty() {
            return;
        }
        let started = timings.elapsed();
        for (index, hook) in subscribers.iter().enumerate() {
            if let Err(e) = hook.on_request(Utc::now(), client, request).await {
                warn!("request log hook {} failed: {}", index, e);
                timings.record_error(format!("request hook {index}: {e}"));
            }
        }
        timings.request_hooks = Some(timings.elapsed() - started);
    }

    pub async fn notify_response(
        &self,
        client: &ClientInfo,
        request: &RequestSummary,
        response: &ResponseSummary,
        timings: &mut Timings,
    ) {
        let subscribers = self.snapshot();
        if subscribers.is_empty() {
            return;
        }
        let started = timings.elapsed();
        for (index, hook) in subscribers.iter().enumerate() {
            if let Err(e) = hook.on_response(Utc::now(), client, request, response).await {
                warn!("response log hook {} failed: {}", index, e);
                timings.record_error(format!("response hook {index}: {e}"));
            }
        }
        timings.response_hooks = Some(timings.elapsed() - started);
    }
}

impl fmt::Debug for LogHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHooks")
            .field("subscribers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppError;
    use parking_lot::Mutex;

    struct FailingHook;

    impl LogHook for FailingHook {
        fn on_request<'a>(
            &'a self,
            _at: DateTime<Utc>,
            _client: &'a ClientInfo,
            _request: &'a RequestSummary,
        ) -> HookFuture<'a> {
            Box::pin(async { Err(AppError::HookFailed("sink unavailable".to_string())) })
        }

        fn on_response<'a>(
            &'a self,
            _at: DateTime<Utc>,
            _client: &'a ClientInfo,
            _request: &'a RequestSummary,
            _response: &'a ResponseSummary,
        ) -> HookFuture<'a> {
            Box::pin(async { Err(AppError::HookFailed("sink unavailable".to_string())) })
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        seen: Mutex<Vec<String>>,
    }

    impl LogHook for RecordingHook {
        fn on_request<'a>(
            &'a self,
            _at: DateTime<Utc>,
            _client: &'a ClientInfo,
            request: &'a RequestSummary,
        ) -> HookFuture<'a> {
            Box::pin(async move {
                self.seen.lock().push(format!("{} {}", request.method, request.target));
                Ok(())
            })
        }

        fn on_response<'a>(
            &'a self,
            _at: DateTime<Utc>,
            _client: &'a ClientInfo,
            _request: &'a RequestSummary,
            response: &'a ResponseSummary,
        ) -> HookFuture<'a> {
            Box::pin(async move {
                self.seen.lock().push(response.status.to_string());
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn failing_hook_does_not_block_others() {
        let endpoint = Endpoint::parse("http://example.com/status").unwrap();
        let client = ClientInfo::new(&endpoint, "h1wire/test");
        let request = RequestSummary::new(&OutboundRequest::get(), &endpoint);
        let response = ResponseSummary::new(&InboundResponse::synthetic(
            408,
            "Request Timeout",
            serde_json::json!({}),
        ));

        let recorder = Arc::new(RecordingHook::default());
        let hooks = LogHooks::new();
        hooks.subscribe(Arc::new(FailingHook));
        hooks.subscribe(recorder.clone());
        hooks.subscribe(Arc::new(TracingLogHook));
        assert_eq!(hooks.len(), 3);

        let mut timings = Timings::start();
        hooks.notify_request(&client, &request, &mut timings).await;
        hooks
            .notify_response(&client, &request, &response, &mut timings)
            .await;

        assert_eq!(*recorder.seen.lock(), vec!["GET /status", "408"]);
        assert_eq!(timings.errors().len(), 2);
        assert!(timings.request_hooks.is_some());
        assert!(timings.response_hooks.is_some());
    }

    #[tokio::test]
    async fn no_subscribers_records_nothing() {
        let endpoint = Endpoint::parse("http://example.com/").unwrap();
        let client = ClientInfo::new(&endpoint, "");
        let request = RequestSummary::new(&OutboundRequest::get(), &endpoint);
        let mut timings = Timings::start();
        LogHooks::new()
            .notify_request(&client, &request, &mut timings)
            .await;
        assert!(timings.request_hooks.is_none());
    }
}
