use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, trace};

use crate::operation::QueuedOperation;
use crate::Operation;

struct QueueState {
    // Front is the head end: head insertions push to the front and
    // dequeue always pops from the front.
    pending: VecDeque<Box<dyn QueuedOperation>>,

    // Set while no dequeued operation is running
    ready: bool,

    closed: bool,

    // Bumped by wake() so blocked dequeuers return early
    generation: u64,
}

/// The ordered set of pending operations for one device
///
/// Tail-enqueued operations run in FIFO order. Head-enqueued operations run
/// before anything still pending, the most recently head-enqueued first.
/// At most one dequeued operation is outstanding at a time: dequeuing waits
/// until the previous operation has signalled that it's done.
pub struct OperationQueue {
    label: String,
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl OperationQueue {
    pub fn new(label: impl Into<String>) -> Self {
        OperationQueue {
            label: label.into(),
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                ready: true,
                closed: false,
                generation: 0,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    // A panicking completion callback must not wedge the queue so we don't
    // care about poisoning here; the state is always left consistent.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue_tail<T: Send + 'static>(self: &Arc<Self>, op: Operation<T>) {
        self.enqueue(Box::new(op), false);
    }

    /// Enqueues an operation that must run before everything still pending
    pub fn enqueue_head<T: Send + 'static>(self: &Arc<Self>, op: Operation<T>) {
        self.enqueue(Box::new(op), true);
    }

    fn enqueue(self: &Arc<Self>, op: Box<dyn QueuedOperation>, head: bool) {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            debug!("{}: {} enqueued after the queue was closed", self.label, op.name());
            futures::executor::block_on(op.cancel(self.clone(), "operation queue closed".to_string()));
            return;
        }
        trace!("{}: enqueue {} at {}", self.label, op.name(), if head { "head" } else { "tail" });
        if head {
            state.pending.push_front(op);
        } else {
            state.pending.push_back(op);
        }
        self.changed.notify_all();
    }

    /// Diverts every pending operation to its cancel path
    ///
    /// The pending sequence is swapped out under the lock and the operations
    /// are cancelled outside of it, so anything enqueued while cancelling
    /// lands in the fresh sequence and is left to run normally. Returns the
    /// number of cancelled operations.
    pub async fn cancel_all(self: &Arc<Self>, reason: &str) -> usize {
        let cancelled = std::mem::take(&mut self.lock().pending);
        let count = cancelled.len();
        if count > 0 {
            debug!("{}: cancelling {} pending operation(s): {}", self.label, count, reason);
        }
        for op in cancelled {
            op.cancel(self.clone(), reason.to_string()).await;
        }
        count
    }

    /// [`cancel_all`](Self::cancel_all) for callers outside of any event loop
    pub fn cancel_all_blocking(self: &Arc<Self>, reason: &str) -> usize {
        futures::executor::block_on(self.cancel_all(reason))
    }

    /// Waits until no operation is running and one is pending, then takes it
    ///
    /// Returns `None` if nothing became available within `timeout` or the
    /// queue was closed. Taking an operation clears the ready signal until
    /// that operation completes.
    pub(crate) fn dequeue_timeout(&self, timeout: Duration) -> Option<Box<dyn QueuedOperation>> {
        let state = self.lock();
        let generation = state.generation;
        let (mut state, _) = self.changed
            .wait_timeout_while(state, timeout, |s| {
                !s.closed && s.generation == generation && !(s.ready && !s.pending.is_empty())
            })
            .unwrap_or_else(PoisonError::into_inner);
        if state.closed || !state.ready {
            return None;
        }
        let op = state.pending.pop_front()?;
        state.ready = false;
        trace!("{}: dequeued {}", self.label, op.name());
        Some(op)
    }

    pub(crate) fn signal_op_done(&self) {
        let mut state = self.lock();
        state.ready = true;
        self.changed.notify_all();
    }

    /// Waits for the ready signal without consuming it
    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self.changed
            .wait_timeout_while(state, timeout, |s| !s.ready)
            .unwrap_or_else(PoisonError::into_inner);
        state.ready
    }

    /// Waits until nothing is running and nothing is pending
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self.changed
            .wait_timeout_while(state, timeout, |s| !(s.ready && s.pending.is_empty()))
            .unwrap_or_else(PoisonError::into_inner);
        state.ready && state.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out operations; later enqueues are cancelled immediately
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Wakes any thread blocked in a dequeue so it can re-check its own state
    pub(crate) fn wake(&self) {
        let mut state = self.lock();
        state.generation = state.generation.wrapping_add(1);
        self.changed.notify_all();
    }
}
