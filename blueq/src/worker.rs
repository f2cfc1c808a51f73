use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use anyhow::anyhow;
use futures::future::BoxFuture;
use log::{debug, error, trace};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::queue::OperationQueue;
use crate::{Error, Result};

type Job = BoxFuture<'static, ()>;

struct SharedWorkerInner {
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    handle: Handle,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

/// The one executor that every native BLE call is funnelled through
///
/// Runs a single-threaded event loop on a dedicated thread and completes
/// submitted jobs strictly one after the other, so at most one native call
/// is in flight across all devices. Build one at startup and hand clones
/// to each session.
#[derive(Clone)]
pub struct SharedWorker {
    inner: Arc<SharedWorkerInner>,
}

impl SharedWorker {
    pub fn start() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| Error::Other(anyhow!("Failed to build BLE worker runtime: {}", err)))?;
        let handle = runtime.handle().clone();
        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<Job>();

        let thread = thread::Builder::new()
            .name("blueq-shared-worker".to_string())
            .spawn(move || {
                trace!("Shared BLE worker started");
                runtime.block_on(async move {
                    // Tasks spawned on this runtime (monitors, async stack
                    // calls) make progress whenever the current job awaits
                    while let Some(job) = jobs_rx.recv().await {
                        job.await;
                    }
                });
                trace!("Shared BLE worker exiting");
            })
            .map_err(|err| Error::Other(anyhow!("Failed to spawn BLE worker thread: {}", err)))?;
        let thread_id = thread.thread().id();

        Ok(SharedWorker {
            inner: Arc::new(SharedWorkerInner {
                jobs: Mutex::new(Some(jobs_tx)),
                handle,
                thread: Mutex::new(Some(thread)),
                thread_id,
            }),
        })
    }

    pub fn submit<F>(&self, job: F) -> Result<()>
        where F: Future<Output = ()> + Send + 'static
    {
        let jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.as_ref() {
            Some(jobs) => jobs.send(Box::pin(job))
                .map_err(|_| Error::Other(anyhow!("BLE worker has exited"))),
            None => Err(Error::Other(anyhow!("BLE worker has been shut down"))),
        }
    }

    /// Handle for spawning background tasks onto the worker's event loop
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Stops accepting jobs, lets queued jobs finish and joins the thread
    ///
    /// Any tasks still spawned on the event loop are dropped.
    pub fn shutdown(&self) {
        let jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner()).take();
        if jobs.is_none() {
            return;
        }
        drop(jobs);
        debug!("Shutting down shared BLE worker");

        if self.is_current_thread() {
            // Can't join ourselves; the loop exits once this job returns
            return;
        }
        let thread = self.inner.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("Shared BLE worker thread panicked");
            }
        }
    }
}

/// Drains one device's [`OperationQueue`] onto the [`SharedWorker`]
///
/// Each device gets its own thread so that a device waiting for its
/// previous operation doesn't hold up anyone else's queue.
pub struct OperationWorker {
    queue: Arc<OperationQueue>,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl OperationWorker {
    pub fn start(queue: Arc<OperationQueue>, shared: SharedWorker, idle_poll: Duration) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(format!("blueq-{}", queue.label()))
                .spawn(move || Self::run(queue, shared, shutdown, idle_poll))
                .map_err(|err| Error::Other(anyhow!("Failed to spawn operation worker: {}", err)))?
        };

        Ok(OperationWorker {
            queue,
            shutdown,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn run(queue: Arc<OperationQueue>, shared: SharedWorker, shutdown: Arc<AtomicBool>, idle_poll: Duration) {
        trace!("{}: operation worker started", queue.label());
        while !shutdown.load(Ordering::SeqCst) {
            let op = match queue.dequeue_timeout(idle_poll) {
                Some(op) => op,
                None if queue.is_closed() => break,
                None => continue,
            };
            let name = op.name().to_string();
            if let Err(err) = shared.submit(op.run(queue.clone())) {
                // The op went down with the job so its waiter sees a closed channel
                error!("{}: failed to submit {}: {}", queue.label(), name, err);
                queue.signal_op_done();
                break;
            }
        }
        trace!("{}: operation worker exiting", queue.label());
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
    }

    /// Stops taking new operations; an operation already handed to the
    /// shared worker still runs to completion
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.wake();
        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(thread) = thread {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("{}: operation worker panicked", self.queue.label());
            }
        }
    }
}

impl Drop for OperationWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;

    use super::*;
    use crate::{OpContext, Operation};

    #[test]
    fn shared_worker_runs_one_job_at_a_time() {
        let shared = SharedWorker::start().unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = std_mpsc::channel();

        for i in 0..4 {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            let tx = tx.clone();
            shared.submit(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                tx.send(i).unwrap();
            }).unwrap();
        }

        let order: Vec<_> = (0..4).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);

        shared.shutdown();
        assert!(shared.submit(async {}).is_err());
    }

    #[test]
    fn operation_worker_drains_queue_in_order() {
        let shared = SharedWorker::start().unwrap();
        let queue = Arc::new(OperationQueue::new("worker-test"));
        let worker = OperationWorker::start(queue.clone(), shared.clone(), Duration::from_millis(20)).unwrap();
        let (tx, rx) = std_mpsc::channel();

        for i in 0..5u32 {
            let tx = tx.clone();
            queue.enqueue_tail(Operation::new(format!("op{}", i), move |_ctx: OpContext| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(i)
            }).on_complete(move |result| tx.send(result.get().unwrap()).unwrap()));
        }

        let order: Vec<_> = (0..5).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(queue.wait_until_idle(Duration::from_secs(1)));

        worker.shutdown();
        assert!(!worker.is_running());

        // Nothing picks this up any more
        queue.enqueue_tail(Operation::new("late", |_ctx: OpContext| async { Ok(()) }));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 1);

        shared.shutdown();
    }
}
