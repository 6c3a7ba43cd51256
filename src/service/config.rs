extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub prefer_ipv4: bool,
    pub no_delay: bool,
    /// Size of the fixed read buffer used while framing and reading bodies.
    pub receive_buffer_size: usize,
    pub max_header_bytes: usize,
    /// Hint for callers only, one request is in flight per connection.
    pub use_pipelining: bool,
    pub join_repeated_headers: bool,
    pub http_version: String,
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            prefer_ipv4: true,
            no_delay: true,
            receive_buffer_size: 8 * 1024,
            max_header_bytes: 64 * 1024,
            use_pipelining: false,
            join_repeated_headers: false,
            http_version: "HTTP/1.1".to_string(),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimeoutConfig {
    pub request_timeout_ms: u64,
    /// Budget for header framing and for each chunk-decoder window.
    pub read_timeout_ms: u64,
    /// Per-operation send/receive timeout, 0 falls back to the request timeout.
    pub socket_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            request_timeout_ms: 30_000,
            read_timeout_ms: 10_000,
            socket_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_number_of_retries: u32,
    pub max_transmissions: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_number_of_retries: 3,
            max_transmissions: 1,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BodyConfig {
    /// Consecutive zero-byte reads tolerated before a fixed-length read stalls.
    pub zero_read_tolerance: u32,
    pub zero_read_delay_ms: u64,
}

impl Default for BodyConfig {
    fn default() -> Self {
        BodyConfig {
            zero_read_tolerance: 5,
            zero_read_delay_ms: 20,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TlsConfig {
    pub versions: Vec<String>,
    pub server_name: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            versions: vec!["1.2".to_string(), "1.3".to_string()],
            server_name: None,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub network: NetworkConfig,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub body: BodyConfig,
    pub tls: TlsConfig,
}

impl TransportConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<TransportConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("H1WIRE").separator("__"))
            .build()?;

        let transport_config: TransportConfig = config.try_deserialize()?;
        transport_config.validate()?;
        Ok(transport_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.receive_buffer_size < 4 {
            return Err(AppError::InvalidValue(format!(
                "receive_buffer_size {} is smaller than the header separator",
                self.network.receive_buffer_size
            )));
        }
        if self.timeouts.request_timeout_ms == 0 {
            return Err(AppError::InvalidValue(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.request_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.read_timeout_ms)
    }

    /// Send/receive timeout applied to each socket operation.
    pub fn socket_timeout(&self, request_timeout: Duration) -> Duration {
        match self.timeouts.socket_timeout_ms {
            0 => request_timeout,
            ms => Duration::from_millis(ms),
        }
    }

    pub fn zero_read_delay(&self) -> Duration {
        Duration::from_millis(self.body.zero_read_delay_ms)
    }
}
