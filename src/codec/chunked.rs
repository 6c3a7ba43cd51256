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

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time;
use tracing::{debug, trace, warn};

use crate::client::Timings;
use crate::message::{HeaderMap, InboundResponse, ResponseBody, TrailerFields};
use crate::service::is_receive_timeout_kind;
use crate::{AppError, AppResult};

const CRLF: &[u8; 2] = b"\r\n";

/// Header fields a trailer block may never introduce into the response.
pub const FORBIDDEN_TRAILERS: [&str; 7] = [
    "Transfer-Encoding",
    "Content-Length",
    "Host",
    "Content-Encoding",
    "Content-Type",
    "Content-Range",
    "Trailer",
];

pub fn is_forbidden_trailer(name: &str) -> bool {
    FORBIDDEN_TRAILERS
        .iter()
        .any(|forbidden| forbidden.eq_ignore_ascii_case(name.trim()))
}

/// One parsed `size[;name=value,...]` chunk line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkRecord {
    pub length: u32,
    pub extensions: HashMap<String, Vec<String>>,
}

impl ChunkRecord {
    pub fn parse_line(line: &[u8]) -> AppResult<ChunkRecord> {
        let line = std::str::from_utf8(line)
            .map_err(|e| AppError::ChunkDecode(format!("chunk line is not utf-8: {e}")))?;
        let mut sections = line.split(';');
        let size = sections.next().unwrap_or("").trim();
        if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AppError::ChunkDecode(format!("invalid chunk size: {size:?}")));
        }
        let length = u32::from_str_radix(size, 16)
            .map_err(|_| AppError::ChunkDecode(format!("chunk size overflows: {size}")))?;

        let mut extensions: HashMap<String, Vec<String>> = HashMap::new();
        for section in sections {
            let section = section.trim();
            if section.is_empty() {
                continue;
            }
            let (name, values) = match section.split_once('=') {
                Some((name, values)) => (name.trim(), Some(values)),
                None => (section, None),
            };
            let entry = extensions.entry(name.to_string()).or_default();
            if let Some(values) = values {
                entry.extend(
                    values
                        .split(',')
                        .map(|v| v.trim().trim_matches('"').to_string())
                        .filter(|v| !v.is_empty()),
                );
            }
        }
        Ok(ChunkRecord { length, extensions })
    }

    pub fn is_terminal(&self) -> bool {
        self.length == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    ReadingChunks,
    ReadingTrailers,
    Done,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    Chunk { record: ChunkRecord, data: Bytes },
    LastChunk(ChunkRecord),
    Trailer { name: String, value: String },
    Done,
}

/// Outcome of decoding one chunked body.
#[derive(Debug)]
pub struct ChunkedBody {
    pub body: Bytes,
    pub records: Vec<ChunkRecord>,
    pub trailers: HeaderMap,
    pub state: DecoderState,
    pub errors: Vec<String>,
}

/// Chunked transfer coding state machine.
///
/// Bytes go in through [`feed`](ChunkDecoder::feed), [`advance`](ChunkDecoder::advance)
/// consumes every complete line and chunk currently buffered. A chunk whose
/// data has not fully arrived leaves its size line in place, it is evaluated
/// again after the next feed.
#[derive(Debug)]
pub struct ChunkDecoder {
    buffer: BytesMut,
    // bytes of the current line already known to hold no CRLF
    scanned: usize,
    state: DecoderState,
    body: BytesMut,
    records: Vec<ChunkRecord>,
    trailers: HeaderMap,
    errors: Vec<String>,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        ChunkDecoder {
            buffer: BytesMut::new(),
            scanned: 0,
            state: DecoderState::ReadingChunks,
            body: BytesMut::new(),
            records: Vec::new(),
            trailers: HeaderMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, DecoderState::Done | DecoderState::TimedOut)
    }

    pub fn decoded(&self) -> &[u8] {
        &self.body
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn time_out(&mut self) {
        if !self.is_finished() {
            self.state = DecoderState::TimedOut;
        }
    }

    /// Runs the state machine over the buffered bytes.
    pub fn advance(&mut self) -> Vec<ChunkEvent> {
        let mut events = Vec::new();
        while !self.is_finished() {
            let Some(line_end) = self.find_line_end() else {
                break;
            };
            match self.state {
                DecoderState::ReadingChunks => {
                    if !self.on_chunk_line(line_end, &mut events) {
                        break;
                    }
                }
                DecoderState::ReadingTrailers => self.on_trailer_line(line_end, &mut events),
                DecoderState::Done | DecoderState::TimedOut => break,
            }
        }
        events
    }

    pub fn finish(self) -> ChunkedBody {
        ChunkedBody {
            body: self.body.freeze(),
            records: self.records,
            trailers: self.trailers,
            state: self.state,
            errors: self.errors,
        }
    }

    fn find_line_end(&mut self) -> Option<usize> {
        let from = self.scanned;
        match self.buffer[from..]
            .windows(CRLF.len())
            .position(|window| window == CRLF)
        {
            Some(offset) => Some(from + offset),
            None => {
                self.scanned = self.buffer.len().saturating_sub(CRLF.len() - 1);
                None
            }
        }
    }

    fn consume(&mut self, count: usize) {
        self.buffer.advance(count);
        self.scanned = 0;
    }

    /// Returns false when the chunk data is still incomplete.
    fn on_chunk_line(&mut self, line_end: usize, events: &mut Vec<ChunkEvent>) -> bool {
        let record = match ChunkRecord::parse_line(&self.buffer[..line_end]) {
            Ok(record) => record,
            Err(e) => {
                debug!("skipping chunk line: {}", e);
                self.errors.push(e.to_string());
                self.consume(line_end + CRLF.len());
                return true;
            }
        };

        if record.is_terminal() {
            trace!("terminal chunk received");
            self.consume(line_end + CRLF.len());
            self.records.push(record.clone());
            events.push(ChunkEvent::LastChunk(record));
            self.state = DecoderState::ReadingTrailers;
            return true;
        }

        let data_start = line_end + CRLF.len();
        let size = record.length as usize;
        let needed = match data_start
            .checked_add(size)
            .and_then(|n| n.checked_add(CRLF.len()))
        {
            Some(needed) => needed,
            None => {
                self.errors
                    .push(format!("chunk of {size} bytes does not fit in memory"));
                self.consume(data_start);
                return true;
            }
        };
        if self.buffer.len() < needed {
            // remember the line is complete so the rescan starts past it
            self.scanned = line_end;
            return false;
        }

        self.consume(data_start);
        let data = self.buffer.split_to(size).freeze();
        if &self.buffer[..CRLF.len()] != CRLF {
            self.errors
                .push(format!("chunk of {size} bytes not followed by CRLF"));
        }
        self.consume(CRLF.len());
        self.body.extend_from_slice(&data);
        self.records.push(record.clone());
        events.push(ChunkEvent::Chunk { record, data });
        true
    }

    fn on_trailer_line(&mut self, line_end: usize, events: &mut Vec<ChunkEvent>) {
        let line = String::from_utf8_lossy(&self.buffer[..line_end]).into_owned();
        self.consume(line_end + CRLF.len());
        if line.is_empty() {
            self.state = DecoderState::Done;
            events.push(ChunkEvent::Done);
            return;
        }
        match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                let (name, value) = (name.trim(), value.trim());
                // first occurrence wins
                if !self.trailers.contains(name) {
                    self.trailers.append(name, value);
                }
                events.push(ChunkEvent::Trailer {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
            _ => self.errors.push(format!("malformed trailer line: {line:?}")),
        }
    }

    /// Feeds reads from `reader` until the body is done.
    ///
    /// A read window that passes without new bytes ends decoding in
    /// [`DecoderState::TimedOut`], chunks decoded so far are kept. Transport
    /// errors likewise stop decoding and are recorded, never raised.
    pub async fn decode<R>(
        mut self,
        reader: &mut R,
        window: Duration,
        buffer_size: usize,
        timings: &mut Timings,
    ) -> ChunkedBody
    where
        R: AsyncRead + Unpin,
    {
        let mut read_buffer = vec![0u8; buffer_size.max(CRLF.len())];
        loop {
            self.advance();
            if self.is_finished() {
                break;
            }
            match time::timeout(window, reader.read(&mut read_buffer)).await {
                Ok(Ok(0)) => {
                    warn!("peer closed the stream before the chunked body completed");
                    self.errors
                        .push("connection closed before the last chunk".to_string());
                    break;
                }
                Ok(Ok(read)) => {
                    timings.record_read_chunk();
                    self.feed(&read_buffer[..read]);
                }
                Ok(Err(e)) if is_receive_timeout_kind(e.kind()) => {
                    warn!("chunked body read timed out: {}", e);
                    self.time_out();
                }
                Ok(Err(e)) => {
                    warn!("chunked body read failed: {}", e);
                    self.errors.push(e.to_string());
                    break;
                }
                Err(_) => {
                    warn!(
                        "no chunk data for {:?}, keeping {} decoded bytes",
                        window,
                        self.body.len()
                    );
                    self.time_out();
                }
            }
        }
        for error in &self.errors {
            timings.record_error(format!("chunked: {error}"));
        }
        self.finish()
    }
}

/// Folds a finished chunked body into its response and returns the state
/// decoding ended in.
///
/// Only a body that reached [`DecoderState::Done`] loses its
/// `Transfer-Encoding` header and gets announced trailers merged in.
pub fn apply_chunked_body(response: &mut InboundResponse, decoded: ChunkedBody) -> DecoderState {
    let state = decoded.state;
    if state == DecoderState::Done {
        response.clear_chunked();
        let announced = response
            .headers()
            .get_typed::<TrailerFields>()
            .map(|fields| fields.0)
            .unwrap_or_default();
        let mut copied = HashSet::new();
        for name in announced {
            if is_forbidden_trailer(&name) || !copied.insert(name.to_ascii_lowercase()) {
                continue;
            }
            if let Some(value) = decoded.trailers.get(&name).map(str::to_string) {
                response.headers_mut().set(&name, Some(value.as_str()));
                response.append_raw_header_line(&name, &value);
            }
        }
    }
    response.set_trailers(decoded.trailers);
    response.set_body(ResponseBody::Bytes(decoded.body));
    state
}
