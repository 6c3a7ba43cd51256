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

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time;
use tracing::{debug, trace, warn};

use super::chunked::{apply_chunked_body, ChunkDecoder, DecoderState};
use crate::client::Timings;
use crate::message::{
    BodyStream, ConnectionDirective, InboundResponse, Method, ResponseBody,
};
use crate::network::Connection;
use crate::service::{is_receive_timeout_kind, TransportConfig};
use crate::{AppError, AppResult};

/// How the body of a parsed response head is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyStrategy {
    Empty,
    FixedLength(u64),
    Chunked,
    Stream,
}

impl BodyStrategy {
    pub fn select(method: &Method, response: &InboundResponse) -> BodyStrategy {
        if *method == Method::Head || response.status_forbids_body() {
            return BodyStrategy::Empty;
        }
        if response.is_chunked() {
            return BodyStrategy::Chunked;
        }
        match response.content_length() {
            Some(0) => BodyStrategy::Empty,
            Some(length) => BodyStrategy::FixedLength(length),
            None => BodyStrategy::Stream,
        }
    }
}

/// Fills in the body of a response whose head was just framed.
#[derive(Debug, Clone)]
pub struct BodyMaterializer {
    buffer_size: usize,
    zero_read_tolerance: u32,
    zero_read_delay: Duration,
    receive_timeout: Duration,
    chunk_window: Duration,
}

impl BodyMaterializer {
    pub fn new(buffer_size: usize, receive_timeout: Duration, chunk_window: Duration) -> Self {
        BodyMaterializer {
            buffer_size,
            zero_read_tolerance: 5,
            zero_read_delay: Duration::from_millis(20),
            receive_timeout,
            chunk_window,
        }
    }

    pub fn from_config(config: &TransportConfig, receive_timeout: Duration) -> Self {
        BodyMaterializer::new(
            config.network.receive_buffer_size,
            receive_timeout,
            config.read_timeout(),
        )
        .with_zero_reads(config.body.zero_read_tolerance, config.zero_read_delay())
    }

    pub fn with_zero_reads(mut self, tolerance: u32, delay: Duration) -> Self {
        self.zero_read_tolerance = tolerance;
        self.zero_read_delay = delay;
        self
    }

    /// Reads the body with the strategy the head selects, then tears the
    /// connection down unless the peer asked for keep-alive and the body
    /// ended cleanly on a chunked or empty frame. A length-delimited body or
    /// a chunked body that stopped short of its last chunk always closes. A
    /// streamed body takes the connection with it.
    pub async fn materialize(
        &self,
        method: &Method,
        response: &mut InboundResponse,
        leftover: BytesMut,
        connection: &mut Option<Connection>,
        timings: &mut Timings,
    ) -> AppResult<BodyStrategy> {
        let strategy = BodyStrategy::select(method, response);
        trace!("materializing {} response body as {:?}", response.status(), strategy);

        let reusable = match strategy {
            BodyStrategy::Empty => {
                response.set_body(ResponseBody::Empty);
                true
            }
            BodyStrategy::FixedLength(length) => {
                let live = connection.as_mut().ok_or_else(missing_connection)?;
                let body = self
                    .read_fixed(live.stream(), leftover, length, timings)
                    .await?;
                response.set_body(ResponseBody::Bytes(body));
                false
            }
            BodyStrategy::Chunked => {
                let live = connection.as_mut().ok_or_else(missing_connection)?;
                let mut decoder = ChunkDecoder::new();
                decoder.feed(&leftover);
                let decoded = decoder
                    .decode(live.stream(), self.chunk_window, self.buffer_size, timings)
                    .await;
                let state = apply_chunked_body(response, decoded);
                if state != DecoderState::Done {
                    debug!("chunked body ended {:?}, connection will not be reused", state);
                }
                state == DecoderState::Done
            }
            BodyStrategy::Stream => {
                let live = connection.take().ok_or_else(missing_connection)?;
                response.set_body(ResponseBody::Stream(BodyStream::new(
                    leftover,
                    live.into_stream(),
                    self.buffer_size,
                )));
                false
            }
        };
        timings.body_complete = Some(timings.elapsed());

        if !reusable || response.connection() != ConnectionDirective::KeepAlive {
            if let Some(live) = connection.take() {
                live.close().await;
            }
        }
        Ok(strategy)
    }

    /// Reads up to `declared` bytes, seeded with what framing already buffered.
    ///
    /// Zero-byte reads are tolerated `zero_read_tolerance` times in a row, a
    /// receive timeout ends the read. Either way the body is returned short
    /// rather than failed.
    pub async fn read_fixed<R>(
        &self,
        reader: &mut R,
        mut body: BytesMut,
        declared: u64,
        timings: &mut Timings,
    ) -> AppResult<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        let declared = usize::try_from(declared).map_err(|_| {
            AppError::MalformedResponse(format!("content-length {declared} exceeds address space"))
        })?;
        if body.len() >= declared {
            body.truncate(declared);
            return Ok(body.freeze());
        }
        body.reserve(declared - body.len());

        let mut read_buffer = vec![0u8; self.buffer_size.max(1)];
        let mut zero_reads = 0;
        while body.len() < declared {
            let want = (declared - body.len()).min(read_buffer.len());
            match time::timeout(self.receive_timeout, reader.read(&mut read_buffer[..want])).await {
                Ok(Ok(0)) => {
                    zero_reads += 1;
                    if zero_reads > self.zero_read_tolerance {
                        debug!("body read stalled after {} empty reads", zero_reads - 1);
                        break;
                    }
                    time::sleep(self.zero_read_delay).await;
                }
                Ok(Ok(read)) => {
                    zero_reads = 0;
                    timings.record_read_chunk();
                    body.extend_from_slice(&read_buffer[..read]);
                }
                Ok(Err(e)) if is_receive_timeout_kind(e.kind()) => {
                    debug!("receive timeout ends body read: {}", e);
                    break;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    debug!("no body bytes for {:?}, ending read", self.receive_timeout);
                    break;
                }
            }
        }

        if body.len() < declared {
            warn!(
                "body truncated: {} of {} declared bytes received",
                body.len(),
                declared
            );
        }
        Ok(body.freeze())
    }
}

fn missing_connection() -> AppError {
    AppError::IllegalStateError("no live connection to read the body from".to_string())
}
