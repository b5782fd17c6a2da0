//! Controllers and peer sessions for Padlink.
//!
//! This crate sits between the transport and the application:
//!
//! 1. **Controllers**: a [`Controller`] wraps an observable gamepad actor
//!    driven by [`gamepad_reducer`], optionally rate-limited by
//!    [`ThrottlingMiddleware`].
//! 2. **Local devices**: a [`DeviceRegistry`] routes normalized device
//!    input to the right controller by [`DeviceId`].
//! 3. **Remote peers**: a [`PeerManager`] groups remote controllers by host
//!    and absorbs short link drops with a grace period.
//! 4. **Discovery**: the [`Discovery`] trait is the seam to DNS-SD or any
//!    other service directory; [`MemoryDiscovery`] works in-process.
//!
//! # How it fits in the stack
//!
//! ```text
//! padlink (above)          ← browser and client drive sessions over sockets
//!     ↕
//! padlink-session (here)   ← controllers, devices, peers, discovery
//!     ↕
//! padlink-actor / padlink-protocol (below)
//! ```

mod config;
mod controller;
mod discovery;
mod error;
mod manager;
mod registry;
mod throttling;

pub use config::SessionConfig;
pub use controller::{
    ConnectionStatus, Controller, ControllerBuilder, ControllerType, InputActor, gamepad_reducer,
    next_free_index,
};
pub use discovery::{
    Discovery, DiscoveryEvent, MemoryDiscovery, ResolvedService, ServiceInfo, service_type,
};
pub use error::SessionError;
pub use manager::{Expired, GraceTimer, PeerManager, RemotePeer};
pub use registry::{DeviceId, DeviceRegistry};
pub use throttling::ThrottlingMiddleware;
