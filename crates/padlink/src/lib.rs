//! # Padlink
//!
//! Stream game controller state from one device to another over a local
//! network.
//!
//! A [`ControllerBrowser`] runs on the device that consumes input. It
//! publishes a service, accepts links, and reports every controller that
//! shows up, whether remote or attached locally. A [`Client`] runs on the
//! device that has the controllers: it finds browsers, links to one and
//! streams each controller's state to it.
//!
//! ```text
//! Client ──TCP (announce, names)──→ ControllerBrowser ──→ BrowserEvent
//!        ──UDP (gamepad state)────→
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use padlink::prelude::*;
//!
//! # async fn run() -> Result<(), PadlinkError> {
//! let network = MemoryDiscovery::new();
//! let (browser, mut browser_events) = ControllerBrowser::builder()
//!     .name("Living Room")
//!     .start(network.peer())
//!     .await?;
//!
//! let (client, mut client_events) = Client::new(ClientConfig::default(), network.peer());
//! client.add_controller(Controller::new(0, ControllerType::Native, GamepadLayout::Extended));
//! client.start()?;
//! if let Some(ClientEvent::ServiceFound(service)) = client_events.recv().await {
//!     client.connect(&service).await?;
//! }
//! if let Some(BrowserEvent::ControllerConnected(remote)) = browser_events.recv().await {
//!     let _watch = remote.observe(|state| println!("A = {}", state.button_a));
//! }
//! # browser.stop();
//! # Ok(())
//! # }
//! ```
//!
//! Logging goes through `tracing`; install a subscriber such as
//! `tracing_subscriber::fmt().with_env_filter(..)` to see it.

use std::sync::{Mutex, MutexGuard, PoisonError};

mod client;
mod config;
mod error;
mod handler;
mod server;

pub use client::{Client, ClientEvent};
pub use config::{BrowserConfig, ClientConfig, DEFAULT_SERVICE_IDENTIFIER};
pub use error::PadlinkError;
pub use server::{BrowserEvent, ControllerBrowser, ControllerBrowserBuilder};

pub use padlink_exec::ThrottleConfig;
pub use padlink_protocol::{
    ButtonMessage, ButtonType, GamepadLayout, GamepadState, InputMessage, JoystickMessage,
    JoystickState, JoystickType,
};
pub use padlink_session::{
    ConnectionStatus, Controller, ControllerType, DeviceId, Discovery, MemoryDiscovery,
    ServiceInfo, SessionConfig,
};

/// Common imports for applications.
pub mod prelude {
    pub use crate::{
        BrowserConfig, BrowserEvent, ButtonMessage, ButtonType, Client, ClientConfig, ClientEvent,
        ConnectionStatus, Controller, ControllerBrowser, ControllerType, DeviceId, Discovery,
        GamepadLayout, GamepadState, InputMessage, JoystickMessage, JoystickType,
        MemoryDiscovery, PadlinkError, ServiceInfo, SessionConfig, ThrottleConfig,
    };
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
