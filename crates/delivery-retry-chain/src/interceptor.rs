//! Retry and completion interceptors.

use std::fmt;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::{DeliveryError, DeliveryRequest, DeliveryResult, TransportResponse};

/// An interceptor's answer after an attempt.
pub enum RetryPolicy {
    DoNotRetry,
    /// Try again once the delay elapsed.
    AfterDelay(Duration),
    /// Try again once the future completes.
    AfterEvent(BoxFuture<'static, ()>),
}

impl RetryPolicy {
    pub fn is_retry(&self) -> bool {
        !matches!(self, RetryPolicy::DoNotRetry)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::DoNotRetry => f.write_str("DoNotRetry"),
            RetryPolicy::AfterDelay(delay) => f.debug_tuple("AfterDelay").field(delay).finish(),
            RetryPolicy::AfterEvent(_) => f.write_str("AfterEvent(..)"),
        }
    }
}

/// Decides whether an attempt should be repeated.
///
/// Interceptors are asked latest-registered first; the first one that asks
/// for a retry decides when.
pub trait RetryInterceptor: Send + Sync {
    /// `retry_count` is 0 after the first attempt.
    fn should_retry(
        &self,
        request: &DeliveryRequest,
        result: &DeliveryResult<TransportResponse>,
        retry_count: u32,
    ) -> RetryPolicy;
}

/// Observes the final outcome of a chain, once.
pub trait CompletionInterceptor: Send + Sync {
    fn on_success(&self, _request: &DeliveryRequest, _response: &TransportResponse) {}

    fn on_failure(&self, _request: &DeliveryRequest, _error: &DeliveryError) {}

    fn on_cancelled(&self, _request: &DeliveryRequest) {}
}
