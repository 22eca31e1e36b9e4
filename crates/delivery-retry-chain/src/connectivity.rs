//! Connectivity-aware retry interceptor.

use flow_control_gates::BarrierState;
use tokio::sync::watch;
use tracing::info;

use crate::{DeliveryRequest, DeliveryResult, RetryInterceptor, RetryPolicy, TransportResponse};

/// On a connectivity error while offline, retries once connectivity returns.
///
/// Fed by the connectivity barrier's state. While online it leaves the
/// decision to other interceptors.
pub struct ConnectivityInterceptor {
    connectivity: watch::Receiver<BarrierState>,
}

impl ConnectivityInterceptor {
    pub fn new(connectivity: watch::Receiver<BarrierState>) -> Self {
        Self { connectivity }
    }
}

impl RetryInterceptor for ConnectivityInterceptor {
    fn should_retry(
        &self,
        request: &DeliveryRequest,
        result: &DeliveryResult<TransportResponse>,
        _retry_count: u32,
    ) -> RetryPolicy {
        let offline_error = matches!(result, Err(error) if error.is_connectivity());
        if !offline_error || self.connectivity.borrow().is_open() {
            return RetryPolicy::DoNotRetry;
        }

        info!(
            destination = %request.destination,
            "Offline, retrying when connectivity returns"
        );
        let mut rx = self.connectivity.clone();
        RetryPolicy::AfterEvent(Box::pin(async move {
            let reopened = rx.wait_for(|state| state.is_open()).await.is_ok();
            if !reopened {
                // Barrier dropped; nothing will reopen it.
                std::future::pending::<()>().await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeliveryError;
    use dispatch_types::DestinationId;
    use flow_control_gates::{Barrier, SwitchBarrier};
    use std::time::Duration;

    fn request() -> DeliveryRequest {
        DeliveryRequest::new(DestinationId::from("x"), Vec::new())
    }

    #[tokio::test]
    async fn test_waits_for_connectivity() {
        let barrier = SwitchBarrier::new("connectivity", BarrierState::Closed);
        let interceptor = ConnectivityInterceptor::new(barrier.subscribe());

        let offline = Err(DeliveryError::Connectivity("no route".into()));
        let RetryPolicy::AfterEvent(signal) = interceptor.should_retry(&request(), &offline, 0)
        else {
            panic!("expected AfterEvent");
        };

        let waiter = tokio::spawn(signal);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        barrier.open();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_ignores_other_errors_and_online_state() {
        let barrier = SwitchBarrier::new("connectivity", BarrierState::Closed);
        let interceptor = ConnectivityInterceptor::new(barrier.subscribe());
        let timeout = Err(DeliveryError::Timeout);
        assert!(!interceptor.should_retry(&request(), &timeout, 0).is_retry());

        barrier.open();
        let offline = Err(DeliveryError::Connectivity("reset".into()));
        assert!(!interceptor.should_retry(&request(), &offline, 0).is_retry());
    }
}
