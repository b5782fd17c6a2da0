//! FIFO task queues.
//!
//! A queue accepts boxed closures and runs them off the caller's context.
//! The two flavors differ only in how much they run at once:
//!
//! ```text
//! SerialQueue      enqueue(a) enqueue(b) enqueue(c)  →  a, then b, then c
//! ConcurrentQueue  enqueue(a) enqueue(b) enqueue(c)  →  a | b | c (any order)
//! ```
//!
//! Serial queues are the "execution contexts" of the rest of the crate
//! graph: one per actor delivery path, one per connection's delegate path.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace};

/// A unit of work submitted to a [`Queue`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A FIFO task queue.
pub trait Queue: Send + Sync + 'static {
    /// Submits a task. Never blocks and never runs the task inline.
    fn enqueue(&self, task: Task);
}

/// Unboxed convenience over [`Queue::enqueue`].
pub trait QueueExt: Queue {
    /// Boxes `f` and enqueues it.
    fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(f));
    }
}

impl<Q: Queue + ?Sized> QueueExt for Q {}

// ---------------------------------------------------------------------------
// SerialQueue
// ---------------------------------------------------------------------------

/// Runs tasks one at a time, in the order they were enqueued.
///
/// Backed by an unbounded mpsc channel drained by a single Tokio task. The
/// worker stops once every clone of the queue is dropped and the backlog is
/// empty.
#[derive(Clone)]
pub struct SerialQueue {
    label: Arc<str>,
    sender: mpsc::UnboundedSender<Task>,
}

impl SerialQueue {
    /// Creates a queue and spawns its worker task.
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        let label = label.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();

        let worker_label = Arc::clone(&label);
        tokio::spawn(async move {
            debug!(queue = %worker_label, "serial queue started");
            while let Some(task) = receiver.recv().await {
                task();
            }
            debug!(queue = %worker_label, "serial queue stopped");
        });

        Self { label, sender }
    }

    /// The label given at construction, used in log fields.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Queue for SerialQueue {
    fn enqueue(&self, task: Task) {
        if self.sender.send(task).is_err() {
            trace!(queue = %self.label, "serial queue closed, task dropped");
        }
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("label", &self.label)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ConcurrentQueue
// ---------------------------------------------------------------------------

/// Hands every task to the runtime as its own Tokio task.
///
/// With [`bounded`](Self::bounded), at most `n` tasks run at the same time;
/// the rest wait for a permit.
#[derive(Clone, Debug)]
pub struct ConcurrentQueue {
    handle: Handle,
    limit: Option<Arc<Semaphore>>,
}

impl ConcurrentQueue {
    /// An unbounded pool on the current runtime.
    pub fn new() -> Self {
        Self {
            handle: Handle::current(),
            limit: None,
        }
    }

    /// A pool that runs at most `max_in_flight` tasks at once (minimum 1).
    pub fn bounded(max_in_flight: usize) -> Self {
        Self {
            handle: Handle::current(),
            limit: Some(Arc::new(Semaphore::new(max_in_flight.max(1)))),
        }
    }
}

impl Default for ConcurrentQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue for ConcurrentQueue {
    fn enqueue(&self, task: Task) {
        match &self.limit {
            None => {
                self.handle.spawn(async move { task() });
            }
            Some(limit) => {
                let limit = Arc::clone(limit);
                self.handle.spawn(async move {
                    let Ok(_permit) = limit.acquire_owned().await else {
                        return;
                    };
                    task();
                });
            }
        }
    }
}
