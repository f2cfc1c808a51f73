use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, trace};

use crate::queue::OperationQueue;
use crate::{Error, OperationResult, Result};

type Body<T> = Box<dyn FnOnce(OpContext) -> BoxFuture<'static, Result<T>> + Send>;
type Completion<T> = Box<dyn FnOnce(OperationResult<T>) + Send>;

/// What an operation body is given when it runs
///
/// A body that finds a cancellation reason is being discarded rather than
/// executed and mustn't touch the native stack.
#[derive(Clone)]
pub struct OpContext {
    queue: Arc<OperationQueue>,
    reason: Option<String>,
}

impl OpContext {
    /// The queue that owns the operation
    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason.is_some()
    }
}

/// A deferred unit of work for an [`OperationQueue`]
///
/// Bound arguments are whatever the body closure captures. Each operation
/// is consumed by exactly one of [`run`](Operation::run) or
/// [`cancel`](Operation::cancel).
pub struct Operation<T> {
    name: Cow<'static, str>,
    body: Body<T>,
    completion: Option<Completion<T>>,
}

impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}

impl<T: Send + 'static> Operation<T> {
    pub fn new<F, Fut>(name: impl Into<Cow<'static, str>>, body: F) -> Self
        where F: FnOnce(OpContext) -> Fut + Send + 'static,
              Fut: Future<Output = Result<T>> + Send + 'static
    {
        Operation {
            name: name.into(),
            body: Box::new(move |ctx| body(ctx).boxed()),
            completion: None,
        }
    }

    /// Sets the callback that receives the operation's result
    pub fn on_complete<C>(mut self, completion: C) -> Self
        where C: FnOnce(OperationResult<T>) + Send + 'static
    {
        self.completion = Some(Box::new(completion));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Executes the body with `owner` as context
    ///
    /// The owner's ready signal is re-set before the completion callback is
    /// invoked, even if the body fails or panics.
    pub async fn run(self, owner: Arc<OperationQueue>) {
        self.execute(owner, None).await
    }

    /// Executes the body with a cancellation reason so that it can skip any
    /// native work and report that it was discarded
    pub async fn cancel(self, owner: Arc<OperationQueue>, reason: String) {
        self.execute(owner, Some(reason)).await
    }

    async fn execute(self, owner: Arc<OperationQueue>, reason: Option<String>) {
        let Operation { name, body, completion } = self;

        // A cancelled operation was never dequeued so it doesn't own the
        // queue's ready signal
        let holds_slot = reason.is_none();
        let ctx = OpContext { queue: owner.clone(), reason };

        trace!("{}: {} ({})", owner.label(), name, if holds_slot { "run" } else { "cancel" });
        let outcome = match AssertUnwindSafe(async move { body(ctx).await }).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!("{}: {} panicked: {}", owner.label(), name, panic_message(&panic));
                Err(Error::Other(anyhow!("{} panicked: {}", name, panic_message(&panic))))
            }
        };
        if let Err(err) = &outcome {
            debug!("{}: {} failed: {}", owner.label(), name, err);
        }

        if holds_slot {
            owner.signal_op_done();
        }

        if let Some(completion) = completion {
            let result = OperationResult::from(outcome);
            if std::panic::catch_unwind(AssertUnwindSafe(move || completion(result))).is_err() {
                error!("{}: completion callback for {} panicked", owner.label(), name);
            }
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Type erased [`Operation`] so that one queue can hold operations with
/// different result types
pub(crate) trait QueuedOperation: Send {
    fn name(&self) -> &str;
    fn run(self: Box<Self>, owner: Arc<OperationQueue>) -> BoxFuture<'static, ()>;
    fn cancel(self: Box<Self>, owner: Arc<OperationQueue>, reason: String) -> BoxFuture<'static, ()>;
}

impl<T: Send + 'static> QueuedOperation for Operation<T> {
    fn name(&self) -> &str {
        Operation::name(self)
    }

    fn run(self: Box<Self>, owner: Arc<OperationQueue>) -> BoxFuture<'static, ()> {
        (*self).run(owner).boxed()
    }

    fn cancel(self: Box<Self>, owner: Arc<OperationQueue>, reason: String) -> BoxFuture<'static, ()> {
        (*self).cancel(owner, reason).boxed()
    }
}
