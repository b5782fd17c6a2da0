//! Actor: an isolated Tokio task that owns one piece of state.
//!
//! The outside world talks to the actor through an [`Actor`] handle, which
//! wraps the sending half of an unbounded mailbox. The task drains the
//! mailbox one command at a time, so no one ever observes a half-applied
//! reducer.
//!
//! ```text
//! send(m) ──► mailbox ──► middleware[0] ──► ... ──► reducer ──► state
//!                                                         │
//!                              delivery queue ◄───────────┘
//!                         (completions, observers)
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use padlink_exec::{Queue, QueueExt, SerialQueue};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::middleware::{Middleware, Next, Slot, lock};
use crate::ActorError;

/// Callback run on the delivery queue with the state after a message.
pub(crate) type Completion<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Pure state transition: `(state, message) -> state`.
pub(crate) type Reducer<T, M> = Box<dyn Fn(&T, &M) -> T + Send + 'static>;

/// Invoked after every reducer run with the old and new state.
pub(crate) type ChangeHook<T> = Box<dyn Fn(&T, &T) + Send + 'static>;

/// Commands sent to an actor task through its mailbox.
pub(crate) enum Command<T, M> {
    /// Run `message` through the pipeline starting at `stage`.
    ///
    /// `stage == 0` is a fresh message from [`Actor::send`]; higher stages
    /// are messages a middleware forwarded after its `process` returned.
    Stage {
        stage: usize,
        message: M,
        completion: Option<Completion<T>>,
    },

    /// Reply with a copy of the current state.
    Snapshot(oneshot::Sender<T>),
}

// ---------------------------------------------------------------------------
// Actor handle
// ---------------------------------------------------------------------------

/// Handle to a running actor. Cheap to clone.
///
/// The task stops once every handle is dropped. [`Next`] continuations hold
/// only a weak reference, so a throttling stage cannot keep an actor alive.
pub struct Actor<T, M> {
    label: Arc<str>,
    sender: mpsc::UnboundedSender<Command<T, M>>,
}

impl<T, M> Clone for Actor<T, M> {
    fn clone(&self) -> Self {
        Self {
            label: Arc::clone(&self.label),
            sender: self.sender.clone(),
        }
    }
}

impl<T, M> fmt::Debug for Actor<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor").field("label", &self.label).finish()
    }
}

impl<T, M> Actor<T, M>
where
    T: Clone + Send + 'static,
    M: Send + 'static,
{
    /// Starts configuring an actor with its initial state and reducer.
    pub fn builder<R>(initial: T, reducer: R) -> ActorBuilder<T, M>
    where
        R: Fn(&T, &M) -> T + Send + 'static,
    {
        ActorBuilder {
            label: Arc::from("actor"),
            initial,
            reducer: Box::new(reducer),
            middleware: Vec::new(),
            delivery: None,
        }
    }

    /// Spawns an actor with no middleware and a private delivery queue.
    pub fn new<R>(initial: T, reducer: R) -> Self
    where
        R: Fn(&T, &M) -> T + Send + 'static,
    {
        Self::builder(initial, reducer).spawn()
    }

    /// The label given at construction, used in log fields.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Enqueues a message. Returns immediately.
    pub fn send(&self, message: M) -> Result<(), ActorError> {
        self.enqueue(message, None)
    }

    /// Enqueues a message and runs `completion` on the delivery queue with
    /// the resulting state once the reducer has applied it.
    ///
    /// If a middleware drops the message, `completion` never runs.
    pub fn send_with<F>(&self, message: M, completion: F) -> Result<(), ActorError>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.enqueue(message, Some(Box::new(completion)))
    }

    /// Returns a copy of the state once every previously sent message has
    /// left the mailbox.
    pub async fn state(&self) -> Result<T, ActorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Command::Snapshot(reply_tx))
            .map_err(|_| self.stopped())?;
        reply_rx.await.map_err(|_| self.stopped())
    }

    /// Whether the actor task is still running.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    fn enqueue(&self, message: M, completion: Option<Completion<T>>) -> Result<(), ActorError> {
        self.sender
            .send(Command::Stage {
                stage: 0,
                message,
                completion,
            })
            .map_err(|_| self.stopped())
    }

    fn stopped(&self) -> ActorError {
        ActorError::Stopped(self.label.to_string())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and spawns an [`Actor`].
pub struct ActorBuilder<T, M> {
    label: Arc<str>,
    initial: T,
    reducer: Reducer<T, M>,
    middleware: Vec<Box<dyn Middleware<T, M>>>,
    delivery: Option<Arc<dyn Queue>>,
}

impl<T, M> ActorBuilder<T, M>
where
    T: Clone + Send + 'static,
    M: Send + 'static,
{
    /// Sets the label used in log fields and errors.
    pub fn label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = label.into();
        self
    }

    /// Appends a stage to the middleware chain. Stages run in the order
    /// they are added.
    pub fn middleware(mut self, middleware: impl Middleware<T, M>) -> Self {
        self.middleware.push(Box::new(middleware));
        self
    }

    /// Sets the queue completions and observers run on. Defaults to a new
    /// [`SerialQueue`] per actor.
    pub fn delivery(mut self, queue: Arc<dyn Queue>) -> Self {
        self.delivery = Some(queue);
        self
    }

    /// Spawns the actor task. Must be called inside a Tokio runtime.
    pub fn spawn(self) -> Actor<T, M> {
        self.spawn_with_hook(None)
    }

    pub(crate) fn delivery_queue(&mut self) -> Arc<dyn Queue> {
        let label = &self.label;
        Arc::clone(
            self.delivery
                .get_or_insert_with(|| Arc::new(SerialQueue::new(format!("{label}.delivery")))),
        )
    }

    pub(crate) fn spawn_with_hook(mut self, on_change: Option<ChangeHook<T>>) -> Actor<T, M> {
        let delivery = self.delivery_queue();
        let (sender, receiver) = mpsc::unbounded_channel();

        let task = ActorTask {
            label: Arc::clone(&self.label),
            state: self.initial,
            reducer: self.reducer,
            middleware: self.middleware,
            delivery,
            on_change,
            mailbox: sender.downgrade(),
            receiver,
        };
        tokio::spawn(task.run());

        Actor {
            label: self.label,
            sender,
        }
    }
}

// ---------------------------------------------------------------------------
// Actor task
// ---------------------------------------------------------------------------

/// The internal actor state. Runs inside a Tokio task.
struct ActorTask<T, M> {
    label: Arc<str>,
    state: T,
    reducer: Reducer<T, M>,
    middleware: Vec<Box<dyn Middleware<T, M>>>,
    delivery: Arc<dyn Queue>,
    on_change: Option<ChangeHook<T>>,
    mailbox: mpsc::WeakUnboundedSender<Command<T, M>>,
    receiver: mpsc::UnboundedReceiver<Command<T, M>>,
}

impl<T, M> ActorTask<T, M>
where
    T: Clone + Send + 'static,
    M: Send + 'static,
{
    async fn run(mut self) {
        debug!(actor = %self.label, stages = self.middleware.len(), "actor started");

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                Command::Stage {
                    stage,
                    message,
                    completion,
                } => self.pipeline(stage, message, completion),
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.state.clone());
                }
            }
        }

        debug!(actor = %self.label, "actor stopped");
    }

    /// Threads `message` through the chain from `stage` onward. Stages that
    /// forward synchronously are followed inline; a stage that holds on to
    /// its `Next` ends this run.
    fn pipeline(&mut self, mut stage: usize, mut message: M, mut completion: Option<Completion<T>>) {
        while stage < self.middleware.len() {
            let slot = Arc::new(Mutex::new(Slot::Open));
            let next = Next::new(stage + 1, Arc::clone(&slot), self.mailbox.clone(), completion);

            self.middleware[stage].process(&self.state, message, next);

            match std::mem::replace(&mut *lock(&slot), Slot::Closed) {
                Slot::Filled(forwarded, forwarded_completion) => {
                    message = forwarded;
                    completion = forwarded_completion;
                    stage += 1;
                }
                Slot::Open | Slot::Closed => {
                    trace!(actor = %self.label, stage, "message held or dropped by middleware");
                    return;
                }
            }
        }

        self.reduce(message, completion);
    }

    fn reduce(&mut self, message: M, completion: Option<Completion<T>>) {
        let new_state = (self.reducer)(&self.state, &message);
        let old_state = std::mem::replace(&mut self.state, new_state);

        if let Some(on_change) = &self.on_change {
            on_change(&old_state, &self.state);
        }

        if let Some(completion) = completion {
            let snapshot = self.state.clone();
            self.delivery.dispatch(move || completion(snapshot));
        }
    }
}
