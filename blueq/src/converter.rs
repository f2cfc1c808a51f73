use std::sync::Arc;

use tokio::runtime::Handle;

/// Decides where completion and notification callbacks execute
///
/// Operations complete on the shared BLE worker thread. A context moves the
/// callback somewhere more convenient for the caller, such as their own
/// runtime, so that slow callbacks don't stall every device's BLE traffic.
pub trait CallbackContext: Send + Sync {
    fn dispatch(&self, callback: Box<dyn FnOnce() + Send>);
}

/// Wraps `callback` so that invoking it dispatches through `context`
pub fn convert<T, F>(context: &Arc<dyn CallbackContext>, callback: F) -> impl FnOnce(T) + Send + 'static
    where T: Send + 'static,
          F: FnOnce(T) + Send + 'static
{
    let context = context.clone();
    move |value| context.dispatch(Box::new(move || callback(value)))
}

/// Runs callbacks immediately on whichever thread completed the operation
///
/// Callbacks mustn't block, and in particular mustn't wait on a blocking
/// request, since that thread is the shared BLE worker.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inline;

impl CallbackContext for Inline {
    fn dispatch(&self, callback: Box<dyn FnOnce() + Send>) {
        callback();
    }
}

/// Runs callbacks on a tokio runtime's blocking pool
#[derive(Clone, Debug)]
pub struct TokioContext {
    handle: Handle,
}

impl TokioContext {
    pub fn new(handle: Handle) -> Self {
        TokioContext { handle }
    }

    /// Uses the runtime the caller is running on
    ///
    /// # Panics
    ///
    /// If called outside of a tokio runtime
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl CallbackContext for TokioContext {
    fn dispatch(&self, callback: Box<dyn FnOnce() + Send>) {
        self.handle.spawn_blocking(callback);
    }
}
