//! Delivery for the dispatch core.
//!
//! - [`Dispatcher`] and [`DeliveryAcks`]: the contract between the
//!   orchestrator and a destination
//! - [`RetryChain`]: runs a [`Transport`] attempt, asks retry interceptors
//!   whether and when to try again, then notifies completion interceptors
//! - Built-ins: [`ExponentialBackoffInterceptor`],
//!   [`ConnectivityInterceptor`], [`HttpTransport`] and
//!   [`RetryingDispatcher`]

mod backoff;
mod cancel;
mod chain;
mod connectivity;
mod dispatcher;
mod error;
mod interceptor;
mod request;
mod retrying;
mod transport;

pub use backoff::ExponentialBackoffInterceptor;
pub use cancel::CancelToken;
pub use chain::{PendingDelivery, RetryChain};
pub use connectivity::ConnectivityInterceptor;
pub use dispatcher::{AckEnvelope, DeliveryAcks, DeliveryReport, Dispatcher};
pub use error::{DeliveryError, DeliveryResult};
pub use interceptor::{CompletionInterceptor, RetryInterceptor, RetryPolicy};
pub use request::{DeliveryOutcome, DeliveryRequest, TransportResponse};
pub use retrying::RetryingDispatcher;
pub use transport::{HttpTransport, Transport};
