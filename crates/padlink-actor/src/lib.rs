//! Sequential state actors for Padlink.
//!
//! An actor owns one value and changes it only by running messages through
//! an ordered middleware chain and then a pure reducer, inside its own
//! Tokio task.
//!
//! # Key types
//!
//! - [`Actor`]: handle to a running actor; `send`, `send_with`, `state`
//! - [`ActorBuilder`]: label, middleware stages, delivery queue
//! - [`Middleware`] / [`Next`]: one pipeline stage and its continuation
//! - [`ObservableActor`] / [`Subscription`]: change notification
//!
//! # Ordering
//!
//! Messages from one sender are reduced in send order. Completions and
//! observer calls run on a delivery queue (a [`padlink_exec::SerialQueue`]
//! unless one is supplied), never on the sender's context and never on the
//! actor's own task.

mod actor;
mod error;
mod middleware;
mod observable;

pub use actor::{Actor, ActorBuilder};
pub use error::ActorError;
pub use middleware::{Middleware, Next};
pub use observable::{ObservableActor, Subscription};
