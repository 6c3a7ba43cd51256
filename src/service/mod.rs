//! Ambient service layer shared by every other module: the crate-wide error
//! type, the transport configuration and the tracing subscriber setup.

pub use app_error::{is_receive_timeout_kind, AppError, AppResult};
pub use config::{
    BodyConfig, NetworkConfig, RetryConfig, TimeoutConfig, TlsConfig, TransportConfig,
};
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod tracing_config;
