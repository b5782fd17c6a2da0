//! The middleware chain that sits in front of an actor's reducer.
//!
//! Each stage receives the current state, the message, and a [`Next`]
//! continuation. The stage decides what happens to the message:
//!
//! ```text
//! next.forward(msg)        pass it on unchanged
//! next.forward(other)      pass on a transformed message
//! drop(next)               swallow it; the reducer never sees it
//! keep `next`, forward later   defer it (throttling, buffering)
//! ```
//!
//! `forward` takes `self`, so a stage can forward at most once.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::actor::{Command, Completion};

/// One stage of an actor's pipeline.
///
/// Implemented for any `FnMut(&T, M, Next<T, M>)` closure, so simple stages
/// can be written inline. Stages should not panic; anything a stage does not
/// understand should be forwarded untouched.
pub trait Middleware<T, M>: Send + 'static {
    /// Handles one message. `state` is the state before this message.
    fn process(&mut self, state: &T, message: M, next: Next<T, M>);
}

impl<T, M, F> Middleware<T, M> for F
where
    F: FnMut(&T, M, Next<T, M>) + Send + 'static,
{
    fn process(&mut self, state: &T, message: M, next: Next<T, M>) {
        self(state, message, next)
    }
}

// ---------------------------------------------------------------------------
// Next
// ---------------------------------------------------------------------------

/// Where a forwarded message goes.
///
/// While the stage's `process` call is still on the stack the slot is
/// `Open`, and forwarding fills it so the actor continues the pipeline
/// inline. Once `process` returns the slot is `Closed`, and a late forward
/// re-enters the actor through its mailbox instead.
pub(crate) enum Slot<T, M> {
    Open,
    Filled(M, Option<Completion<T>>),
    Closed,
}

pub(crate) fn lock<S>(slot: &Mutex<S>) -> MutexGuard<'_, S> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Continuation handed to a [`Middleware`] stage.
///
/// Dropping it without forwarding drops the message, along with any
/// completion the sender attached.
pub struct Next<T, M> {
    stage: usize,
    slot: Arc<Mutex<Slot<T, M>>>,
    mailbox: mpsc::WeakUnboundedSender<Command<T, M>>,
    completion: Option<Completion<T>>,
}

impl<T, M> Next<T, M> {
    pub(crate) fn new(
        stage: usize,
        slot: Arc<Mutex<Slot<T, M>>>,
        mailbox: mpsc::WeakUnboundedSender<Command<T, M>>,
        completion: Option<Completion<T>>,
    ) -> Self {
        Self {
            stage,
            slot,
            mailbox,
            completion,
        }
    }

    /// Hands `message` to the next stage, or to the reducer after the last.
    ///
    /// Forwarding after the actor has stopped is a no-op.
    pub fn forward(mut self, message: M) {
        let completion = self.completion.take();
        let mut slot = lock(&self.slot);
        if matches!(*slot, Slot::Open) {
            *slot = Slot::Filled(message, completion);
            return;
        }
        drop(slot);

        if let Some(mailbox) = self.mailbox.upgrade() {
            let _ = mailbox.send(Command::Stage {
                stage: self.stage,
                message,
                completion,
            });
        } else {
            tracing::trace!(stage = self.stage, "actor stopped, deferred message dropped");
        }
    }

    /// Index of the stage this continuation leads to.
    pub fn stage(&self) -> usize {
        self.stage
    }
}

impl<T, M> fmt::Debug for Next<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("stage", &self.stage)
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}
