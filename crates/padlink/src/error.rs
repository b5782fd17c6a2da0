//! Unified error type for Padlink.

use padlink_actor::ActorError;
use padlink_protocol::ProtocolError;
use padlink_session::SessionError;
use padlink_transport::TransportError;

/// Top-level error that wraps every crate-specific error.
///
/// The `#[from]` attribute on each variant generates the `From` impl, so
/// `?` converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum PadlinkError {
    /// A socket error (connect, bind, send, receive).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Bytes that do not decode, e.g. a malformed TXT record.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A controller's input actor is gone.
    #[error(transparent)]
    Actor(#[from] ActorError),

    /// Device routing or discovery failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A service resolved without any address to connect to.
    #[error("{0} resolved to no address")]
    NoAddress(String),
}
