use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::service::TransportConfig;

pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Bounds for one logical request.
///
/// `max_restarts` bounds connection establishment inside a single
/// transmission, `max_transmissions` bounds whole-request retries, and
/// `delay(attempt)` is the pause before transmission `attempt + 1`.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_restarts: u32,
    pub max_transmissions: u32,
    pub timeout: Duration,
    delay: DelayFn,
}

impl RetryPolicy {
    pub fn new(max_restarts: u32, max_transmissions: u32, timeout: Duration) -> Self {
        RetryPolicy {
            max_restarts,
            max_transmissions,
            timeout,
            delay: backoff(Duration::from_millis(100), Duration::from_secs(5)),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        RetryPolicy {
            max_restarts: config.retry.max_number_of_retries,
            max_transmissions: config.retry.max_transmissions,
            timeout: config.request_timeout(),
            delay: backoff(
                Duration::from_millis(config.retry.base_delay_ms),
                Duration::from_millis(config.retry.max_delay_ms),
            ),
        }
    }

    pub fn with_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.delay = Arc::new(delay);
        self
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        (self.delay)(attempt)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_restarts", &self.max_restarts)
            .field("max_transmissions", &self.max_transmissions)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Exponential backoff capped at `max`, with up to 50% random jitter added.
pub fn backoff(base: Duration, max: Duration) -> DelayFn {
    Arc::new(move |attempt| {
        let exponent = attempt.min(16);
        let delay = base.saturating_mul(1u32 << exponent).min(max);
        let jitter_ms = (delay.as_millis() as u64) / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        (delay + Duration::from_millis(jitter)).min(max)
    })
}
