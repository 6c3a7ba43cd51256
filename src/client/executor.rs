// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::hooks::{ClientInfo, LogHooks, RequestSummary, ResponseSummary};
use super::retry::RetryPolicy;
use super::Timings;
use crate::codec::BodyMaterializer;
use crate::message::{Endpoint, InboundResponse, OutboundRequest, RequestBody};
use crate::network::{
    CertificateValidator, Connection, ConnectionEstablisher, DnsClient, FrameReader,
    HickoryDnsClient, ResponseFrame, TlsHandshaker, WebPkiValidator,
};
use crate::service::TransportConfig;
use crate::{AppError, AppResult};

/// Sends requests to one endpoint over a connection it owns.
///
/// `execute` never fails: transport errors, timeouts and cancellation come
/// back as synthetic responses (see [`InboundResponse::is_synthetic`]). A
/// connection the peer kept alive is reused by the next call.
#[derive(Debug)]
pub struct RequestExecutor {
    endpoint: Endpoint,
    config: TransportConfig,
    retry: RetryPolicy,
    dns: Arc<dyn DnsClient>,
    tls: Arc<TlsHandshaker>,
    hooks: Arc<LogHooks>,
    client: ClientInfo,
    connection: Option<Connection>,
}

impl RequestExecutor {
    pub fn new(endpoint: Endpoint, config: TransportConfig) -> AppResult<Self> {
        config.validate()?;
        let tls = TlsHandshaker::new(&config.tls, Arc::new(WebPkiValidator))?;
        Ok(RequestExecutor {
            client: ClientInfo::new(&endpoint, &config.network.user_agent),
            retry: RetryPolicy::from_config(&config),
            dns: Arc::new(HickoryDnsClient::from_system()),
            tls: Arc::new(tls),
            hooks: Arc::new(LogHooks::new()),
            connection: None,
            endpoint,
            config,
        })
    }

    pub fn with_dns(mut self, dns: Arc<dyn DnsClient>) -> Self {
        self.dns = dns;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn CertificateValidator>) -> AppResult<Self> {
        self.tls = Arc::new(TlsHandshaker::new(&self.config.tls, validator)?);
        Ok(self)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<LogHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn client(&self) -> &ClientInfo {
        &self.client
    }

    pub fn hooks(&self) -> &Arc<LogHooks> {
        &self.hooks
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn establisher(&self) -> ConnectionEstablisher {
        ConnectionEstablisher::new(self.dns.clone(), self.retry.max_restarts)
            .with_tls(self.tls.clone())
            .with_prefer_ipv4(self.config.network.prefer_ipv4)
            .with_no_delay(self.config.network.no_delay)
    }

    /// Runs one request to completion.
    pub async fn execute(&mut self, mut request: OutboundRequest) -> InboundResponse {
        let mut timings = Timings::start();
        let timeout = request.timeout.unwrap_or(self.retry.timeout);
        let cancellation = request.cancellation.clone().unwrap_or_default();
        let summary = RequestSummary::new(&request, &self.endpoint);

        let hooks = self.hooks.clone();
        hooks
            .notify_request(&self.client, &summary, &mut timings)
            .await;

        let outcome = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(AppError::Cancelled),
            result = time::timeout(
                timeout,
                self.transmit(&mut request, timeout, &cancellation, &mut timings),
            ) => result.unwrap_or(Err(AppError::RequestTimeout(timeout))),
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                warn!("{} {} failed: {}", summary.method, summary.target, e);
                timings.record_error(e.to_string());
                self.close().await;
                failure_response(&e, timeout, &timings)
            }
        };

        hooks
            .notify_response(
                &self.client,
                &summary,
                &ResponseSummary::new(&response),
                &mut timings,
            )
            .await;
        debug!(
            "{} {} -> {} in {:?} ({} restarts, {} reads)",
            summary.method,
            summary.target,
            response.status(),
            timings.elapsed(),
            timings.restart_counter,
            timings.read_chunks.len()
        );
        response
    }

    /// Runs `request` up to `max_transmissions` times while it fails with a
    /// non-timeout synthetic response. Stream bodies cannot be replayed and
    /// are sent once.
    pub async fn execute_with_retry(&mut self, request: OutboundRequest) -> InboundResponse {
        let transmissions = self.retry.max_transmissions.max(1);
        let mut pending = request;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let replay = if attempt < transmissions {
                pending.try_clone()
            } else {
                None
            };
            let response = self.execute(pending).await;
            let retryable = response.is_synthetic() && response.status() != REQUEST_TIMEOUT;
            match replay {
                Some(next) if retryable => {
                    let delay = self.retry.delay(attempt - 1);
                    warn!(
                        "transmission {}/{} to {} failed with {}, retrying in {:?}",
                        attempt,
                        transmissions,
                        self.endpoint,
                        response.status(),
                        delay
                    );
                    time::sleep(delay).await;
                    pending = next;
                }
                _ => return response,
            }
        }
    }

    /// Tears down the live connection, if any.
    pub async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }

    async fn transmit(
        &mut self,
        request: &mut OutboundRequest,
        timeout: Duration,
        cancellation: &CancellationToken,
        timings: &mut Timings,
    ) -> AppResult<InboundResponse> {
        let socket_timeout = self.config.socket_timeout(timeout);
        let reused = self.connection.is_some();
        if !reused {
            self.connect(socket_timeout, cancellation, timings).await?;
        }

        let frame = match self.send(request, reused, socket_timeout, timings).await {
            Err(e) if reused && e.is_stale_connection() && request.is_replayable() => {
                warn!("kept-alive connection to {} went stale: {}, reconnecting", self.endpoint, e);
                timings.record_error(format!("stale connection: {e}"));
                self.close().await;
                self.connect(socket_timeout, cancellation, timings).await?;
                self.send(request, false, socket_timeout, timings).await?
            }
            result => result?,
        };
        let mut response = InboundResponse::parse_head(&frame.head)?;
        timings.header_parsed = Some(timings.elapsed());

        BodyMaterializer::from_config(&self.config, socket_timeout)
            .materialize(
                &request.method,
                &mut response,
                frame.leftover,
                &mut self.connection,
                timings,
            )
            .await?;
        Ok(response)
    }

    async fn connect(
        &mut self,
        socket_timeout: Duration,
        cancellation: &CancellationToken,
        timings: &mut Timings,
    ) -> AppResult<()> {
        let connection = self
            .establisher()
            .establish(&self.endpoint, socket_timeout, cancellation, timings)
            .await?;
        self.connection = Some(connection);
        Ok(())
    }

    /// Writes the request and frames the response head. On a `reused`
    /// connection a peer that already hung up surfaces as
    /// [`AppError::ConnectionClosed`] instead of a header timeout.
    async fn send(
        &mut self,
        request: &mut OutboundRequest,
        reused: bool,
        socket_timeout: Duration,
        timings: &mut Timings,
    ) -> AppResult<ResponseFrame> {
        let connection = self.connection.as_mut().ok_or_else(|| {
            AppError::IllegalStateError("connection vanished after establishment".to_string())
        })?;
        connection.mark_request();
        trace!(
            "request {} on connection to {}",
            connection.requests_served(),
            connection.peer()
        );

        let network = &self.config.network;
        let head = request.encode_head(
            &self.endpoint,
            &network.http_version,
            &network.user_agent,
            network.join_repeated_headers,
        );
        let started = timings.elapsed();
        with_socket_timeout(socket_timeout, connection.stream().write_all(&head)).await?;
        timings.write_header = Some(timings.elapsed() - started);

        let body_length = request.body_length();
        if let Some(body) = request.body.as_mut() {
            let started = timings.elapsed();
            match body {
                RequestBody::Bytes(bytes) => {
                    let end = bytes.len().min(body_length as usize);
                    with_socket_timeout(socket_timeout, connection.stream().write_all(&bytes[..end]))
                        .await?;
                }
                RequestBody::Stream(reader) => {
                    let mut limited = AsyncReadExt::take(&mut *reader, body_length);
                    let copied = with_socket_timeout(
                        socket_timeout,
                        tokio::io::copy(&mut limited, connection.stream()),
                    )
                    .await?;
                    if copied < body_length {
                        warn!(
                            "request body stream ended after {} of {} bytes",
                            copied, body_length
                        );
                    }
                }
            }
            timings.write_body = Some(timings.elapsed() - started);
        }
        with_socket_timeout(socket_timeout, connection.stream().flush()).await?;

        FrameReader::new(
            network.receive_buffer_size,
            self.config.read_timeout(),
            network.max_header_bytes,
        )
        .with_zero_read_delay(self.config.zero_read_delay())
        .with_closed_detection(reused)
        .read_frame(connection.stream(), timings)
        .await
    }
}

const REQUEST_TIMEOUT: u16 = 408;
const BAD_REQUEST: u16 = 400;
const UNEXPECTED: u16 = 500;

async fn with_socket_timeout<F, T>(timeout: Duration, operation: F) -> AppResult<T>
where
    F: Future<Output = io::Result<T>>,
{
    match time::timeout(timeout, operation).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(AppError::IoError(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("socket operation timed out after {timeout:?}"),
        ))),
    }
}

/// Synthetic response for a failed call.
///
/// Timeouts and cancellation map to 408, internal invariant violations to a
/// generic 500, everything else to 400 carrying the innermost cause.
pub fn failure_response(error: &AppError, timeout: Duration, timings: &Timings) -> InboundResponse {
    if error.is_request_timeout() {
        return InboundResponse::synthetic(
            REQUEST_TIMEOUT,
            "Request Timeout",
            json!({
                "timeout_ms": timeout.as_millis() as u64,
                "error": error.to_string(),
                "timings": timings.summary(),
            }),
        );
    }
    if let AppError::IllegalStateError(detail) = error {
        return InboundResponse::synthetic(
            UNEXPECTED,
            "Internal Error",
            json!({
                "error": "something unexpected happened",
                "detail": detail,
                "timings": timings.summary(),
            }),
        );
    }
    InboundResponse::synthetic(
        BAD_REQUEST,
        "Bad Request",
        json!({
            "error": error.innermost_message(),
            "timings": timings.summary(),
        }),
    )
}
