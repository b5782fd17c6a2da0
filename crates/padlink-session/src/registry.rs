//! Routing for local input devices.
//!
//! Device frameworks report input against their own handles. Instead of
//! smuggling a controller pointer through those callbacks, a collaborator
//! keeps an opaque [`DeviceId`] and the registry maps it to the
//! [`Controller`] that owns the device.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use padlink_protocol::InputMessage;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{Controller, SessionError};

/// Opaque key a device collaborator uses for one physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev-{}", self.0)
    }
}

/// Maps device ids to controllers. Safe to share between threads.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<BTreeMap<DeviceId, Controller>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn devices(&self) -> MutexGuard<'_, BTreeMap<DeviceId, Controller>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches `controller` under `id`.
    ///
    /// # Errors
    /// [`SessionError::DeviceInUse`] if `id` is already attached.
    pub fn attach(&self, id: DeviceId, controller: Controller) -> Result<(), SessionError> {
        let mut devices = self.devices();
        if devices.contains_key(&id) {
            return Err(SessionError::DeviceInUse(id));
        }
        debug!(device = %id, index = controller.index(), "device attached");
        devices.insert(id, controller);
        Ok(())
    }

    /// Detaches and returns the controller for `id`.
    pub fn detach(&self, id: DeviceId) -> Option<Controller> {
        let removed = self.devices().remove(&id);
        if removed.is_some() {
            debug!(device = %id, "device detached");
        }
        removed
    }

    pub fn get(&self, id: DeviceId) -> Option<Controller> {
        self.devices().get(&id).cloned()
    }

    /// Routes one normalized input message to the device's controller.
    ///
    /// # Errors
    /// [`SessionError::UnknownDevice`] if nothing is attached under `id`,
    /// or [`SessionError::Actor`] if the controller's actor has stopped.
    pub fn dispatch(&self, id: DeviceId, message: impl Into<InputMessage>) -> Result<(), SessionError> {
        let Some(controller) = self.get(id) else {
            trace!(device = %id, "input for unknown device");
            return Err(SessionError::UnknownDevice(id));
        };
        controller.send(message)
    }

    /// Every attached controller, ordered by device id.
    pub fn controllers(&self) -> Vec<Controller> {
        self.devices().values().cloned().collect()
    }

    /// Indexes of every attached controller.
    pub fn indexes(&self) -> Vec<u16> {
        self.devices().values().map(Controller::index).collect()
    }

    pub fn len(&self) -> usize {
        self.devices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use padlink_protocol::{ButtonMessage, ButtonType, GamepadLayout};

    use super::*;
    use crate::ControllerType;

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId(7).to_string(), "dev-7");
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_attached_controller() {
        let registry = DeviceRegistry::new();
        let controller = Controller::new(0, ControllerType::Hid, GamepadLayout::Regular);
        registry.attach(DeviceId(1), controller.clone()).unwrap();

        registry
            .dispatch(DeviceId(1), ButtonMessage::new(ButtonType::Y, 1.0))
            .unwrap();
        assert_eq!(controller.state().await.unwrap().button_y, 1.0);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_device_returns_error() {
        let registry = DeviceRegistry::new();
        let result = registry.dispatch(DeviceId(9), ButtonMessage::new(ButtonType::A, 1.0));
        assert_eq!(result, Err(SessionError::UnknownDevice(DeviceId(9))));
    }

    #[tokio::test]
    async fn test_attach_twice_returns_device_in_use() {
        let registry = DeviceRegistry::new();
        let first = Controller::new(0, ControllerType::Hid, GamepadLayout::Micro);
        let second = Controller::new(1, ControllerType::Hid, GamepadLayout::Micro);

        registry.attach(DeviceId(3), first.clone()).unwrap();
        assert_eq!(
            registry.attach(DeviceId(3), second),
            Err(SessionError::DeviceInUse(DeviceId(3)))
        );
        assert!(registry.get(DeviceId(3)).unwrap().same(&first));
    }

    #[tokio::test]
    async fn test_detach_removes_device() {
        let registry = DeviceRegistry::new();
        registry
            .attach(DeviceId(1), Controller::new(2, ControllerType::Native, GamepadLayout::Regular))
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.indexes(), vec![2]);

        let removed = registry.detach(DeviceId(1)).unwrap();
        assert_eq!(removed.index(), 2);
        assert!(registry.is_empty());
        assert!(registry.detach(DeviceId(1)).is_none());
    }
}
