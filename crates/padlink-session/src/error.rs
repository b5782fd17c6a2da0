//! Error types for the session layer.

use padlink_actor::ActorError;

use crate::DeviceId;

/// Errors from controller, device and discovery operations.
///
/// Peer churn is not an error: disconnects and reconnects are handled by
/// [`PeerManager`](crate::PeerManager) and surface only as events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No controller is attached under this device id.
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    /// A device id is already attached to another controller.
    #[error("device {0} is already attached")]
    DeviceInUse(DeviceId),

    /// The discovery collaborator failed to publish, search or resolve.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// The controller's input actor is gone.
    #[error(transparent)]
    Actor(#[from] ActorError),
}
