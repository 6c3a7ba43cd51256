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
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use super::headers::{ContentLength, HeaderMap, TypedHeader};
use super::Endpoint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
            Method::Other(m) => m.as_str(),
        }
    }
}

impl From<&str> for Method {
    fn from(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "PATCH" => Method::Patch,
            "OPTIONS" => Method::Options,
            other => Method::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub enum RequestBody {
    Bytes(Bytes),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            RequestBody::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// One request to send over a [`crate::network::Connection`].
#[derive(Debug)]
pub struct OutboundRequest {
    pub method: Method,
    /// Overrides the endpoint path when set.
    pub path: Option<String>,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
    /// Total declared body length, bounds how many body bytes are written.
    pub declared_length: Option<u64>,
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl OutboundRequest {
    pub fn new(method: Method) -> Self {
        OutboundRequest {
            method,
            path: None,
            query: None,
            headers: HeaderMap::new(),
            body: None,
            declared_length: None,
            timeout: None,
            cancellation: None,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::Get)
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.declared_length = Some(body.len() as u64);
        self.body = Some(RequestBody::Bytes(body));
        self
    }

    /// Streams exactly `length` bytes from `reader` as the body.
    pub fn with_body_stream(
        mut self,
        reader: impl AsyncRead + Send + Unpin + 'static,
        length: u64,
    ) -> Self {
        self.declared_length = Some(length);
        self.body = Some(RequestBody::Stream(Box::new(reader)));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Whether the body can be written again, i.e. it is absent or in memory.
    pub fn is_replayable(&self) -> bool {
        !matches!(self.body, Some(RequestBody::Stream(_)))
    }

    /// Copy for another transmission, `None` when the body is a one-shot stream.
    pub fn try_clone(&self) -> Option<OutboundRequest> {
        let body = match &self.body {
            None => None,
            Some(RequestBody::Bytes(bytes)) => Some(RequestBody::Bytes(bytes.clone())),
            Some(RequestBody::Stream(_)) => return None,
        };
        Some(OutboundRequest {
            method: self.method.clone(),
            path: self.path.clone(),
            query: self.query.clone(),
            headers: self.headers.clone(),
            body,
            declared_length: self.declared_length,
            timeout: self.timeout,
            cancellation: self.cancellation.clone(),
        })
    }

    /// Number of body bytes that will go on the wire.
    pub fn body_length(&self) -> u64 {
        match (&self.body, self.declared_length) {
            (None, _) => 0,
            (Some(RequestBody::Bytes(b)), Some(declared)) => declared.min(b.len() as u64),
            (Some(RequestBody::Bytes(b)), None) => b.len() as u64,
            (Some(RequestBody::Stream(_)), declared) => declared.unwrap_or(0),
        }
    }

    pub fn target(&self, endpoint: &Endpoint) -> String {
        let path = self.path.as_deref().unwrap_or(endpoint.path());
        let path = if path.is_empty() { "/" } else { path };
        match self.query.as_deref().or(endpoint.query()) {
            Some(query) if !query.is_empty() => format!("{path}?{query}"),
            _ => path.to_string(),
        }
    }

    /// Request line, header block and the blank line that ends it.
    pub fn encode_head(
        &self,
        endpoint: &Endpoint,
        http_version: &str,
        user_agent: &str,
        join_repeated: bool,
    ) -> BytesMut {
        let mut headers = self.headers.clone();
        if !headers.contains("Host") {
            headers.set("Host", Some(endpoint.authority()));
        }
        if !headers.contains("User-Agent") && !user_agent.is_empty() {
            headers.append("User-Agent", user_agent);
        }
        if self.body.is_some()
            && !headers.contains(ContentLength::NAME)
            && !headers.contains("Transfer-Encoding")
        {
            headers.set_typed(&ContentLength(self.body_length()));
        }

        let target = self.target(endpoint);
        let mut buffer = BytesMut::with_capacity(256);
        buffer.put_slice(self.method.as_str().as_bytes());
        buffer.put_u8(b' ');
        buffer.put_slice(target.as_bytes());
        buffer.put_u8(b' ');
        buffer.put_slice(http_version.as_bytes());
        buffer.put_slice(b"\r\n");
        headers.write_to(&mut buffer, join_repeated);
        buffer.put_slice(b"\r\n");
        buffer
    }
}
