use std::future::IntoFuture;
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::converter::{self, CallbackContext};
use crate::queue::OperationQueue;
use crate::{Error, Operation, OperationResult, Result};

/// A device operation that hasn't been enqueued yet
///
/// Every [`GattSession`](crate::GattSession) method returns one of these and
/// the caller picks how to receive the result:
///
/// * [`wait`](Self::wait) blocks the calling thread,
/// * [`then`](Self::then) hands the result to a callback and returns at once,
/// * `.await` suspends the calling task.
///
/// Blocking and awaiting both give up after the session's request timeout
/// (see [`timeout`](Self::timeout) to override it). Giving up doesn't abort
/// the operation: once it has reached the native stack it runs to
/// completion and its result is discarded.
#[must_use = "a request does nothing until it's waited on, awaited or given a callback"]
pub struct GattRequest<T> {
    operation: Operation<T>,
    queue: Arc<OperationQueue>,
    context: Arc<dyn CallbackContext>,
    timeout: Duration,
}

impl<T: Send + 'static> GattRequest<T> {
    pub(crate) fn new(operation: Operation<T>, queue: Arc<OperationQueue>,
                      context: Arc<dyn CallbackContext>, timeout: Duration) -> Self {
        GattRequest { operation, queue, context, timeout }
    }

    pub fn name(&self) -> &str {
        self.operation.name()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn timed_out(name: &str, timeout: Duration) -> Error {
        Error::OperationTimedOut(format!("{} returned no result in {:?}", name, timeout))
    }

    /// Enqueues the operation and blocks until its result arrives
    ///
    /// Must not be called from a callback running on the shared BLE worker.
    pub fn wait(self) -> Result<T> {
        let GattRequest { operation, queue, timeout, .. } = self;
        let name = operation.name().to_string();

        let (tx, rx) = sync_channel(1);
        queue.enqueue_tail(operation.on_complete(move |result| {
            // The caller may have timed out already
            let _ = tx.send(result);
        }));

        match rx.recv_timeout(timeout) {
            Ok(result) => result.get(),
            Err(RecvTimeoutError::Timeout) => Err(Self::timed_out(&name, timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Other(anyhow!("{} was dropped without a result", name)))
            }
        }
    }

    /// Enqueues the operation; `callback` gets the result through the
    /// session's callback context
    pub fn then<F>(self, callback: F)
        where F: FnOnce(OperationResult<T>) + Send + 'static
    {
        let GattRequest { operation, queue, context, .. } = self;
        queue.enqueue_tail(operation.on_complete(converter::convert(&context, callback)));
    }

    /// Enqueues the operation and ignores its result
    pub fn detach(self) {
        self.queue.enqueue_tail(self.operation);
    }

    async fn wait_async(self) -> Result<T> {
        let GattRequest { operation, queue, timeout, .. } = self;
        let name = operation.name().to_string();

        let (tx, rx) = oneshot::channel();
        queue.enqueue_tail(operation.on_complete(move |result| {
            let _ = tx.send(result);
        }));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.get(),
            Ok(Err(err)) => Err(err.into()),
            Err(_elapsed) => Err(Self::timed_out(&name, timeout)),
        }
    }
}

impl<T: Send + 'static> IntoFuture for GattRequest<T> {
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait_async().boxed()
    }
}
