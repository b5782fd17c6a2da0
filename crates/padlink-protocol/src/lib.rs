//! Wire protocol for Padlink.
//!
//! - **Codec** ([`Marshal`], [`Frame`], [`Datagram`], [`FrameCodec`]):
//!   `[u16 channel][u32 length][payload]` framing, little-endian throughout.
//! - **Gamepad** ([`GamepadState`], [`GamepadLayout`], ...): the controller
//!   model, with a layout-conditional encoding.
//! - **Messages** ([`ControllerConnectedMessage`], [`RemoteMessage`], ...):
//!   payloads that travel inside frames and into controller actors.
//! - **TXT** ([`ServiceTxtRecord`]): the service advertisement record.
//!
//! Nothing here knows about sockets. Transport hands this crate byte
//! buffers; this crate hands back typed values or a [`ProtocolError`].

mod codec;
mod error;
mod gamepad;
mod messages;
mod txt;

pub use codec::{
    ChannelId, Datagram, FRAME_HEADER_LEN, Frame, FrameCodec, MAX_FRAME_PAYLOAD, Marshal,
};
pub use error::ProtocolError;
pub use gamepad::{ButtonType, GamepadLayout, GamepadState, JoystickState, JoystickType};
pub use messages::{
    ButtonMessage, ControllerConnectedMessage, ControllerNameMessage, GamepadLayoutMessage,
    GamepadMessage, InputMessage, JoystickMessage, RemoteMessage,
};
pub use txt::{INPUT_PORT_KEY, ServiceTxtRecord};
