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

use std::error::Error as StdError;
use std::io::ErrorKind;
use std::time::Duration;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// connection establishment errors
    #[error("dns resolution failed for {host}: {reason}")]
    Resolution { host: String, reason: String },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tls handshake with {server} failed: {reason}")]
    TlsHandshake { server: String, reason: String },

    /// response framing errors
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("response header exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("no response header received within {0:?}")]
    HeaderTimeout(Duration),

    #[error("peer closed the connection before sending a response")]
    ConnectionClosed,

    #[error("chunk decode error: {0}")]
    ChunkDecode(String),

    /// request level outcomes
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("log hook failed: {0}")]
    HookFailed(String),
}

impl AppError {
    /// Timeouts and cancellation share the timeout-flavored failure path.
    pub fn is_request_timeout(&self) -> bool {
        matches!(self, AppError::RequestTimeout(_) | AppError::Cancelled)
    }

    /// The peer dropped a kept-alive connection between requests.
    pub fn is_stale_connection(&self) -> bool {
        match self {
            AppError::ConnectionClosed => true,
            AppError::IoError(e) => matches!(
                e.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Message of the innermost error in the `source` chain.
    pub fn innermost_message(&self) -> String {
        let mut current: &dyn StdError = self;
        while let Some(source) = current.source() {
            current = source;
        }
        current.to_string()
    }
}

/// Receive-timeout I/O errors mark the end of a body read, not a failure.
pub fn is_receive_timeout_kind(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TimedOut | ErrorKind::WouldBlock)
}
