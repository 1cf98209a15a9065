//! Single-worker FIFO queue for operations that must never overlap

use crate::error::{RelayerError, RelayerResult};

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Runs pushed operations one at a time, in the order they were pushed.
///
/// Each operation runs to completion on the worker task even if the caller
/// stops waiting for it. A failing or panicking operation only affects its
/// own caller.
pub struct SequentialQueue {
    name: String,
    jobs: mpsc::UnboundedSender<Job>,
}

impl SequentialQueue {
    /// Create a queue and spawn its worker. `delay` is slept after every
    /// operation, before the next one starts.
    pub fn new(name: impl Into<String>, delay: Option<Duration>) -> Self {
        let name = name.into();
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();

        let worker_name = name.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job()).catch_unwind().await.is_err() {
                    error!("Operation on queue {} panicked", worker_name);
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
            }
            debug!("Queue {} closed", worker_name);
        });

        Self { name, jobs }
    }

    /// Enqueue `op` and wait for its result
    pub async fn push<F, Fut, T>(&self, op: F) -> RelayerResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = RelayerResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            async move {
                let result = op().await;
                // Caller may have gone away, the result is simply dropped then
                let _ = result_tx.send(result);
            }
            .boxed()
        });

        self.jobs
            .send(job)
            .map_err(|_| RelayerError::Internal(format!("queue {} is closed", self.name)))?;

        result_rx.await.map_err(|_| {
            RelayerError::Internal(format!("operation on queue {} did not complete", self.name))
        })?
    }
}
