//! Serial operation queue.
//!
//! Operations are futures executed one at a time, in submission order, by a
//! single runner task. The next operation starts only once the previous one
//! has resolved, so an operation that awaits storage or another collaborator
//! keeps every later operation parked until it is done.
//!
//! An operation must never await [`OperationQueue::run`] on its own queue:
//! the inner operation is queued behind the caller and would never start.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::{Result, RustKitError};

type Operation = BoxFuture<'static, ()>;

/// FIFO of deferred operations with exactly one running at a time.
pub struct OperationQueue {
    sender: mpsc::UnboundedSender<Operation>,
    runner: JoinHandle<()>,
    /// Queued plus running operations.
    outstanding: Arc<AtomicUsize>,
}

impl OperationQueue {
    /// Create a queue and spawn its runner on the current tokio runtime.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Operation>();
        let outstanding = Arc::new(AtomicUsize::new(0));

        let counter = outstanding.clone();
        let runner = tokio::spawn(async move {
            while let Some(operation) = receiver.recv().await {
                operation.await;
                counter.fetch_sub(1, Ordering::AcqRel);
                trace!("Operation complete");
            }
        });

        Self {
            sender,
            runner,
            outstanding,
        }
    }

    /// Append an operation. Returns false once the queue has shut down.
    pub fn schedule<F>(&self, operation: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(Box::pin(operation)).is_err() {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            warn!("Operation dropped: queue is shut down");
            return false;
        }
        true
    }

    /// Append an operation and wait for its output.
    ///
    /// Fails with [`RustKitError::Cancelled`] if the queue shuts down before
    /// the operation resolves.
    pub async fn run<F, T>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.schedule(async move {
            let _ = tx.send(operation.await);
        });
        rx.await.map_err(|_| RustKitError::Cancelled)
    }

    /// Number of queued plus running operations.
    pub fn len(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Whether nothing is queued or running.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the runner. Queued and running operations are dropped.
    pub fn shutdown(&self) {
        self.runner.abort();
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.runner.abort();
    }
}
