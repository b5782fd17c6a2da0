//! Execution primitives for Padlink.
//!
//! Everything in Padlink that must not run on the caller's context goes
//! through one of the types here:
//!
//! - [`Queue`]: a FIFO task queue. [`SerialQueue`] runs tasks one at a
//!   time in enqueue order; [`ConcurrentQueue`] lets the runtime run them in
//!   parallel (optionally capped).
//! - [`ThrottledBuffer`]: a trailing-edge rate limiter that owns its own
//!   serial task and always delivers the freshest value.
//!
//! All constructors spawn onto the current Tokio runtime and must be called
//! from inside one.

mod queue;
mod throttle;

pub use queue::{ConcurrentQueue, Queue, QueueExt, SerialQueue, Task};
pub use throttle::{ThrottleConfig, ThrottledBuffer};
