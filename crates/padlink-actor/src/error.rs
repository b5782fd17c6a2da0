//! Error types for the actor layer.

/// Errors that can occur when talking to an actor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActorError {
    /// The actor's task has exited; its mailbox no longer accepts messages.
    #[error("actor {0} has stopped")]
    Stopped(String),
}
