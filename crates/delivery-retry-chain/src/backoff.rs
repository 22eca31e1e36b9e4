//! Exponential backoff retry interceptor.

use std::time::Duration;

use dispatch_config_and_utils::RetryConfig;
use tracing::debug;

use crate::{DeliveryRequest, DeliveryResult, RetryInterceptor, RetryPolicy, TransportResponse};

/// Retries retryable errors after `base * 2^retry_count`, capped at `max`,
/// up to `max_retries` times.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffInterceptor {
    base: Duration,
    max: Duration,
    max_retries: u32,
}

impl ExponentialBackoffInterceptor {
    pub fn new(base: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max,
            max_retries,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.max_retries,
        )
    }

    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for ExponentialBackoffInterceptor {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryInterceptor for ExponentialBackoffInterceptor {
    fn should_retry(
        &self,
        request: &DeliveryRequest,
        result: &DeliveryResult<TransportResponse>,
        retry_count: u32,
    ) -> RetryPolicy {
        let Err(error) = result else {
            return RetryPolicy::DoNotRetry;
        };
        if !error.is_retryable() || retry_count >= self.max_retries {
            return RetryPolicy::DoNotRetry;
        }

        let delay = self.delay_for(retry_count);
        debug!(
            destination = %request.destination,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Scheduling retry"
        );
        RetryPolicy::AfterDelay(delay)
    }
}
