//! The handler execution context.
//!
//! Socket I/O happens on tokio tasks. Application callbacks never run there:
//! they are queued on an [`Executor`] so slow handler code cannot stall the
//! I/O multiplexer. The default [`HandlerExecutor`] is one dedicated thread
//! draining a FIFO queue, which gives per-connection callbacks the same order
//! the I/O task queued them in.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

use crate::error::panic_message;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub type SharedExecutor = Arc<dyn Executor>;

/// Where application callbacks run.
///
/// Implementations must run jobs one at a time, in submission order.
pub trait Executor: Send + Sync + 'static {
    /// Queues `job`. Never runs it inline.
    fn spawn(&self, job: Job);

    /// True when the calling thread is this executor's thread.
    fn in_context(&self) -> bool;

    /// Runs `job` inline when already on this executor, otherwise queues it.
    fn execute(&self, job: Job) {
        if self.in_context() {
            job();
        } else {
            self.spawn(job);
        }
    }
}

static NEXT_EXECUTOR_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT_EXECUTOR: Cell<usize> = const { Cell::new(0) };
}

/// Single-threaded FIFO executor backed by a named OS thread.
pub struct HandlerExecutor {
    id: usize,
    queue: Mutex<Option<UnboundedSender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HandlerExecutor {
    pub fn new(thread_name: impl Into<String>) -> std::io::Result<Arc<Self>> {
        let id = NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = unbounded_channel::<Job>();

        let thread = thread::Builder::new()
            .name(thread_name.into())
            .spawn(move || {
                CURRENT_EXECUTOR.with(|current| current.set(id));
                while let Some(job) = rx.blocking_recv() {
                    // jobs are expected to route their own failures; this only
                    // keeps the thread alive when one does not
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                        tracing::error!(
                            panic = %panic_message(payload.as_ref()),
                            "Job panicked on handler executor"
                        );
                    }
                }
                tracing::debug!("Handler executor drained");
            })?;

        Ok(Arc::new(Self {
            id,
            queue: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    ///
    /// Must not be called from the executor thread itself.
    pub fn shutdown(&self) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if self.in_context() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Handler executor thread panicked");
            }
        }
    }
}

impl Executor for HandlerExecutor {
    fn spawn(&self, job: Job) {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        match queue.as_ref() {
            Some(tx) => {
                if tx.send(job).is_err() {
                    tracing::warn!("Handler executor stopped, job dropped");
                }
            }
            None => tracing::warn!("Handler executor shut down, job dropped"),
        }
    }

    fn in_context(&self) -> bool {
        CURRENT_EXECUTOR.with(|current| current.get() == self.id)
    }
}

impl Drop for HandlerExecutor {
    fn drop(&mut self) {
        self.queue.get_mut().unwrap_or_else(|e| e.into_inner()).take();
    }
}
