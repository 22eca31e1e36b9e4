//! Interceptor-driven retry chain.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{
    CancelToken, CompletionInterceptor, DeliveryError, DeliveryOutcome, DeliveryRequest,
    DeliveryResult, RetryInterceptor, RetryPolicy, Transport, TransportResponse,
};

/// Wraps a transport with retry and completion interceptors.
///
/// Cloning is cheap; clones share the transport and interceptors.
#[derive(Clone)]
pub struct RetryChain {
    transport: Arc<dyn Transport>,
    retry_interceptors: Vec<Arc<dyn RetryInterceptor>>,
    completion_interceptors: Vec<Arc<dyn CompletionInterceptor>>,
}

impl RetryChain {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            retry_interceptors: Vec::new(),
            completion_interceptors: Vec::new(),
        }
    }

    /// Adds a retry interceptor. Later registrations are asked first.
    pub fn with_retry_interceptor(mut self, interceptor: Arc<dyn RetryInterceptor>) -> Self {
        self.retry_interceptors.push(interceptor);
        self
    }

    /// Adds a completion interceptor. Notified in registration order.
    pub fn with_completion_interceptor(
        mut self,
        interceptor: Arc<dyn CompletionInterceptor>,
    ) -> Self {
        self.completion_interceptors.push(interceptor);
        self
    }

    /// Starts delivering `request` on a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn send(&self, request: DeliveryRequest) -> PendingDelivery {
        let token = CancelToken::new();
        let chain = self.clone();
        let run_token = token.clone();
        let handle = tokio::spawn(async move { chain.run(request, run_token).await });
        PendingDelivery { token, handle }
    }

    /// Delivers `request` until an interceptor stops retrying or `token` is
    /// cancelled.
    pub async fn run(&self, request: DeliveryRequest, token: CancelToken) -> DeliveryOutcome {
        let mut retry_count: u32 = 0;

        loop {
            if token.is_cancelled() {
                return self.finish_cancelled(&request);
            }

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return self.finish_cancelled(&request),
                result = self.transport.send(&request) => result,
            };

            match self.retry_policy(&request, &result, retry_count) {
                RetryPolicy::DoNotRetry => return self.finish(&request, result),
                RetryPolicy::AfterDelay(delay) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return self.finish_cancelled(&request),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryPolicy::AfterEvent(signal) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return self.finish_cancelled(&request),
                        _ = signal => {}
                    }
                }
            }

            retry_count = retry_count.saturating_add(1);
            debug!(
                destination = %request.destination,
                retry_count,
                "Retrying delivery"
            );
        }
    }

    fn retry_policy(
        &self,
        request: &DeliveryRequest,
        result: &DeliveryResult<TransportResponse>,
        retry_count: u32,
    ) -> RetryPolicy {
        for interceptor in self.retry_interceptors.iter().rev() {
            let policy = interceptor.should_retry(request, result, retry_count);
            if policy.is_retry() {
                return policy;
            }
        }
        RetryPolicy::DoNotRetry
    }

    fn finish(
        &self,
        request: &DeliveryRequest,
        result: DeliveryResult<TransportResponse>,
    ) -> DeliveryOutcome {
        match result {
            Ok(response) => {
                for interceptor in &self.completion_interceptors {
                    interceptor.on_success(request, &response);
                }
                DeliveryOutcome::Delivered(response)
            }
            Err(error) => {
                warn!(
                    destination = %request.destination,
                    events = request.events.len(),
                    error = %error,
                    "Delivery failed"
                );
                for interceptor in &self.completion_interceptors {
                    interceptor.on_failure(request, &error);
                }
                DeliveryOutcome::Failed(error)
            }
        }
    }

    fn finish_cancelled(&self, request: &DeliveryRequest) -> DeliveryOutcome {
        debug!(destination = %request.destination, "Delivery cancelled");
        for interceptor in &self.completion_interceptors {
            interceptor.on_cancelled(request);
        }
        DeliveryOutcome::Cancelled
    }
}

/// Handle to a delivery running on a background task.
pub struct PendingDelivery {
    token: CancelToken,
    handle: JoinHandle<DeliveryOutcome>,
}

impl PendingDelivery {
    /// Stops the delivery during an attempt or while waiting for a retry.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the final outcome.
    pub async fn outcome(self) -> DeliveryOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => DeliveryOutcome::Cancelled,
            Err(err) => {
                error!(error = %err, "Delivery task panicked");
                DeliveryOutcome::Failed(DeliveryError::Transport(err.to_string()))
            }
        }
    }
}
