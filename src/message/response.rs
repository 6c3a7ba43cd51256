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

use std::fmt;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tracing::trace;

use super::headers::{ConnectionOptions, ContentLength, HeaderMap, TransferEncoding, TypedHeader};
use crate::network::TransportStream;
use crate::{AppError, AppResult};

const MAX_HEADERS_COUNT: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirective {
    KeepAlive,
    Close,
    Unspecified,
}

/// Remaining response bytes handed to the caller without buffering.
///
/// Owns the transport together with any body bytes that arrived with the
/// header, so the first call to [`BodyStream::read_more`] returns those.
pub struct BodyStream {
    buffered: BytesMut,
    stream: Option<TransportStream>,
    read_buffer_size: usize,
}

impl BodyStream {
    pub(crate) fn new(buffered: BytesMut, stream: TransportStream, read_buffer_size: usize) -> Self {
        BodyStream {
            buffered,
            stream: Some(stream),
            read_buffer_size,
        }
    }

    /// Next block of body bytes, `None` once the peer closed the stream.
    pub async fn read_more(&mut self) -> AppResult<Option<Bytes>> {
        if !self.buffered.is_empty() {
            return Ok(Some(self.buffered.split().freeze()));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        let mut buffer = BytesMut::with_capacity(self.read_buffer_size);
        let read = stream.read_buf(&mut buffer).await?;
        if read == 0 {
            trace!("body stream reached end of input");
            self.stream = None;
            return Ok(None);
        }
        Ok(Some(buffer.freeze()))
    }

    pub fn is_complete(&self) -> bool {
        self.buffered.is_empty() && self.stream.is_none()
    }

    pub async fn read_to_end(&mut self) -> AppResult<Bytes> {
        let mut body = BytesMut::new();
        while let Some(block) = self.read_more().await? {
            body.extend_from_slice(&block);
        }
        Ok(body.freeze())
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("buffered", &self.buffered.len())
            .field("open", &self.stream.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub enum ResponseBody {
    Empty,
    Bytes(Bytes),
    Stream(BodyStream),
}

/// A response head plus its materialized body.
///
/// Only the crate mutates it, callers receive it frozen.
#[derive(Debug)]
pub struct InboundResponse {
    version: String,
    status: u16,
    reason: String,
    headers: HeaderMap,
    raw_header: String,
    body: ResponseBody,
    content_length: Option<u64>,
    chunked: bool,
    connection: ConnectionDirective,
    trailers: HeaderMap,
    synthetic: bool,
}

impl InboundResponse {
    /// Parses a status line and header block, `head` excludes the blank line.
    pub fn parse_head(head: &[u8]) -> AppResult<InboundResponse> {
        let mut input = Vec::with_capacity(head.len() + 4);
        input.extend_from_slice(head);
        input.extend_from_slice(b"\r\n\r\n");

        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
        let mut parsed = httparse::Response::new(&mut slots);
        match parsed.parse(&input) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(AppError::MalformedResponse(
                    "incomplete response head".to_string(),
                ))
            }
            Err(e) => return Err(AppError::MalformedResponse(e.to_string())),
        }

        let status = parsed
            .code
            .ok_or_else(|| AppError::MalformedResponse("missing status code".to_string()))?;
        let version = format!("HTTP/1.{}", parsed.version.unwrap_or(1));
        let reason = parsed.reason.unwrap_or("").to_string();
        let headers: HeaderMap = parsed
            .headers
            .iter()
            .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
            .collect();

        let chunked = headers
            .get_typed::<TransferEncoding>()
            .map(|te| te.is_chunked())
            .unwrap_or(false);
        // chunked framing wins, Content-Length is ignored alongside it
        let content_length = if chunked {
            None
        } else {
            match headers.get_joined(ContentLength::NAME) {
                None => None,
                Some(raw) => Some(
                    ContentLength::parse(&raw)
                        .ok_or_else(|| {
                            AppError::MalformedResponse(format!("invalid content-length: {raw}"))
                        })?
                        .0,
                ),
            }
        };
        let connection = match headers.get_typed::<ConnectionOptions>() {
            Some(options) if options.has("close") => ConnectionDirective::Close,
            Some(options) if options.has("keep-alive") => ConnectionDirective::KeepAlive,
            _ => ConnectionDirective::Unspecified,
        };

        Ok(InboundResponse {
            version,
            status,
            reason,
            headers,
            raw_header: String::from_utf8_lossy(head).into_owned(),
            body: ResponseBody::Empty,
            content_length,
            chunked,
            connection,
            trailers: HeaderMap::new(),
            synthetic: false,
        })
    }

    /// A response fabricated by the client to report a failure.
    pub fn synthetic(status: u16, reason: &str, payload: serde_json::Value) -> InboundResponse {
        let body = Bytes::from(payload.to_string());
        let mut headers = HeaderMap::with_capacity(2);
        headers.append("Content-Type", "application/json");
        headers.append("Content-Length", body.len().to_string());
        let raw_header = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}",
            body.len()
        );
        InboundResponse {
            version: "HTTP/1.1".to_string(),
            status,
            reason: reason.to_string(),
            headers,
            raw_header,
            content_length: Some(body.len() as u64),
            body: ResponseBody::Bytes(body),
            chunked: false,
            connection: ConnectionDirective::Close,
            trailers: HeaderMap::new(),
            synthetic: true,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Status line and header block as text, including merged trailers.
    pub fn raw_header(&self) -> &str {
        &self.raw_header
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Materialized body bytes, `None` for streamed bodies.
    pub fn body_bytes(&self) -> Option<Bytes> {
        match &self.body {
            ResponseBody::Empty => Some(Bytes::new()),
            ResponseBody::Bytes(bytes) => Some(bytes.clone()),
            ResponseBody::Stream(_) => None,
        }
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn connection(&self) -> ConnectionDirective {
        self.connection
    }

    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    /// 1xx, 204 and 304 never carry a body.
    pub(crate) fn status_forbids_body(&self) -> bool {
        matches!(self.status, 100..=199 | 204 | 304)
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub(crate) fn set_body(&mut self, body: ResponseBody) {
        self.body = body;
    }

    pub(crate) fn set_trailers(&mut self, trailers: HeaderMap) {
        self.trailers = trailers;
    }

    pub(crate) fn append_raw_header_line(&mut self, name: &str, value: &str) {
        self.raw_header.push_str("\r\n");
        self.raw_header.push_str(name);
        self.raw_header.push_str(": ");
        self.raw_header.push_str(value);
    }

    /// Drops the chunked flag once the body has been decoded.
    pub(crate) fn clear_chunked(&mut self) {
        self.chunked = false;
        self.headers.remove(TRANSFER_ENCODING);
        self.raw_header = self
            .raw_header
            .split("\r\n")
            .filter(|line| !is_header_line(line, TRANSFER_ENCODING))
            .collect::<Vec<_>>()
            .join("\r\n");
    }
}

const TRANSFER_ENCODING: &str = "Transfer-Encoding";

fn is_header_line(line: &str, name: &str) -> bool {
    line.split_once(':')
        .map(|(n, _)| n.trim().eq_ignore_ascii_case(name))
        .unwrap_or(false)
}
