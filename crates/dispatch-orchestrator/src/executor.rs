//! Serial execution context.
//!
//! A dedicated OS thread owns the state and runs submitted closures one at a
//! time in FIFO order. Async callers park on a oneshot reply instead of
//! blocking a runtime thread.
//!
//! Closures must stay short: storage calls and bookkeeping only. Delivery,
//! transformation and anything awaiting happen outside.

use std::sync::mpsc;
use std::thread;

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::{DispatchError, DispatchResult};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Handle to a thread owning `S`. Clones submit to the same thread; the
/// thread exits once every handle is dropped.
pub struct SerialExecutor<S> {
    sender: mpsc::Sender<Job<S>>,
}

impl<S> Clone for SerialExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S: Send + 'static> SerialExecutor<S> {
    /// Starts the executor thread with `state`.
    pub fn spawn(name: &str, state: S) -> DispatchResult<Self> {
        let (sender, receiver) = mpsc::channel::<Job<S>>();
        let thread_name = name.to_string();

        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut state = state;
                while let Ok(job) = receiver.recv() {
                    job(&mut state);
                }
                debug!(thread = %thread_name, "Serial executor stopped");
            })?;

        info!(thread = %name, "Serial executor started");
        Ok(Self { sender })
    }

    /// Runs `f` on the executor thread and waits for its result.
    pub async fn call<F, T>(&self, f: F) -> DispatchResult<T>
    where
        F: FnOnce(&mut S) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Box::new(move |state: &mut S| {
                let _ = reply_tx.send(f(state));
            }))
            .map_err(|_| DispatchError::ExecutorClosed)?;
        reply_rx.await.map_err(|_| DispatchError::ExecutorClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let executor = SerialExecutor::spawn("test-serial", Vec::<u32>::new()).unwrap();

        let calls: Vec<_> = (0..20)
            .map(|i| executor.call(move |log| log.push(i)))
            .collect();
        for result in join_all(calls).await {
            result.unwrap();
        }
        let log = executor.call(|log| log.clone()).await.unwrap();

        assert_eq!(log, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_call_returns_value() {
        let executor = SerialExecutor::spawn("test-serial", 41u64).unwrap();
        let value = executor
            .call(|n| {
                *n += 1;
                *n
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_panicking_job_closes_executor() {
        let executor = SerialExecutor::spawn("test-serial", ()).unwrap();
        let result = executor
            .call(|_| -> u32 { panic!("boom") })
            .await;
        assert!(matches!(result, Err(DispatchError::ExecutorClosed)));
    }
}
