//! Controller messages and their byte layouts.
//!
//! These are the values that flow into a controller's actor (from device
//! input collaborators or the network) and, for the subset that crosses the
//! wire, the payloads inside frames.
//!
//! | Message                      | Layout                                   |
//! |------------------------------|------------------------------------------|
//! | [`ButtonMessage`]            | `u16 button, f32 value`                  |
//! | [`JoystickMessage`]          | `u16 joystick, f32 x, f32 y`             |
//! | [`GamepadLayoutMessage`]     | `u16 layout`                             |
//! | [`ControllerNameMessage`]    | UTF-8 bytes, empty means no name         |
//! | [`GamepadMessage`]           | a [`GamepadState`]                       |
//! | [`ControllerConnectedMessage`] | `u16 index, u16 layout, [UTF-8 name]`  |
//! | [`RemoteMessage<T>`]         | `u16 controller index, T`                |

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::{Marshal, ensure_remaining};
use crate::gamepad::{ButtonType, GamepadLayout, GamepadState, JoystickState, JoystickType};
use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Device input messages
// ---------------------------------------------------------------------------

/// A button changed value. Digital buttons send `0.0` or `1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ButtonMessage {
    pub button: ButtonType,
    pub value: f32,
}

impl ButtonMessage {
    pub fn new(button: ButtonType, value: f32) -> Self {
        Self { button, value }
    }
}

impl Marshal for ButtonMessage {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.button.into());
        buf.put_f32_le(self.value);
    }

    fn unmarshal(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        ensure_remaining(&buf, 6, "button message")?;
        let button = ButtonType::try_from(buf.get_u16_le())?;
        let value = buf.get_f32_le();
        Ok(Self { button, value })
    }
}

/// A joystick moved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JoystickMessage {
    pub joystick: JoystickType,
    pub state: JoystickState,
}

impl JoystickMessage {
    pub fn new(joystick: JoystickType, x_axis: f32, y_axis: f32) -> Self {
        Self {
            joystick,
            state: JoystickState::new(x_axis, y_axis),
        }
    }
}

impl Marshal for JoystickMessage {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.joystick.into());
        buf.put_f32_le(self.state.x_axis);
        buf.put_f32_le(self.state.y_axis);
    }

    fn unmarshal(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        ensure_remaining(&buf, 10, "joystick message")?;
        let joystick = JoystickType::try_from(buf.get_u16_le())?;
        let x_axis = buf.get_f32_le();
        let y_axis = buf.get_f32_le();
        Ok(Self::new(joystick, x_axis, y_axis))
    }
}

/// The controller switched layouts; its state resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GamepadLayoutMessage {
    pub layout: GamepadLayout,
}

impl Marshal for GamepadLayoutMessage {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.layout.into());
    }

    fn unmarshal(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        ensure_remaining(&buf, 2, "layout message")?;
        let layout = GamepadLayout::try_from(buf.get_u16_le())?;
        Ok(Self { layout })
    }
}

/// An empty name is no name; both encode to zero bytes.
fn non_empty(name: Option<String>) -> Option<String> {
    name.filter(|name| !name.is_empty())
}

fn deserialize_name<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(non_empty)
}

/// The controller's display name changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerNameMessage {
    #[serde(default, deserialize_with = "deserialize_name")]
    name: Option<String>,
}

impl ControllerNameMessage {
    /// `Some("")` is stored as `None`.
    pub fn new(name: Option<String>) -> Self {
        Self {
            name: non_empty(name),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn into_name(self) -> Option<String> {
        self.name
    }
}

impl Marshal for ControllerNameMessage {
    fn marshal(&self, buf: &mut BytesMut) {
        if let Some(name) = &self.name {
            buf.put_slice(name.as_bytes());
        }
    }

    fn unmarshal(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Ok(Self { name: None });
        }
        let name = std::str::from_utf8(data)
            .map_err(|_| ProtocolError::InvalidUtf8("controller name"))?;
        Ok(Self {
            name: Some(name.to_owned()),
        })
    }
}

/// A full state snapshot, as streamed from client to browser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GamepadMessage {
    pub state: GamepadState,
}

impl GamepadMessage {
    pub fn new(state: GamepadState) -> Self {
        Self { state }
    }
}

impl Marshal for GamepadMessage {
    fn marshal(&self, buf: &mut BytesMut) {
        self.state.marshal(buf);
    }

    fn unmarshal(data: &[u8]) -> Result<Self, ProtocolError> {
        GamepadState::unmarshal(data).map(Self::new)
    }
}

// ---------------------------------------------------------------------------
// Session messages
// ---------------------------------------------------------------------------

/// Announces a controller on a peer. Sent on channel 1 of the reliable link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConnectedMessage {
    /// Index of the controller on the sending peer.
    pub index: u16,
    pub layout: GamepadLayout,
    #[serde(default, deserialize_with = "deserialize_name")]
    name: Option<String>,
}

impl ControllerConnectedMessage {
    /// `Some("")` is stored as `None`.
    pub fn new(index: u16, layout: GamepadLayout, name: Option<String>) -> Self {
        Self {
            index,
            layout,
            name: non_empty(name),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl Marshal for ControllerConnectedMessage {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.index);
        buf.put_u16_le(self.layout.into());
        if let Some(name) = &self.name {
            buf.put_slice(name.as_bytes());
        }
    }

    /// Trailing bytes that are not UTF-8 decode as "no name" rather than
    /// failing the whole announcement.
    fn unmarshal(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        ensure_remaining(&buf, 4, "controller connected message")?;
        let index = buf.get_u16_le();
        let layout = GamepadLayout::try_from(buf.get_u16_le())?;
        let name = match buf {
            [] => None,
            rest => std::str::from_utf8(rest).ok().map(str::to_owned),
        };
        Ok(Self {
            index,
            layout,
            name,
        })
    }
}

/// Routes a per-controller message through a channel shared by every
/// controller of a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage<T> {
    pub controller_index: u16,
    pub message: T,
}

impl<T> RemoteMessage<T> {
    pub fn new(controller_index: u16, message: T) -> Self {
        Self {
            controller_index,
            message,
        }
    }
}

impl<T: Marshal> Marshal for RemoteMessage<T> {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.controller_index);
        self.message.marshal(buf);
    }

    fn unmarshal(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        ensure_remaining(&buf, 2, "remote message index")?;
        let controller_index = buf.get_u16_le();
        let message = T::unmarshal(buf)?;
        Ok(Self {
            controller_index,
            message,
        })
    }
}

// ---------------------------------------------------------------------------
// InputMessage
// ---------------------------------------------------------------------------

/// Everything a controller's input actor accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputMessage {
    Button(ButtonMessage),
    Joystick(JoystickMessage),
    Layout(GamepadLayoutMessage),
    Gamepad(GamepadMessage),
    Name(ControllerNameMessage),
}

impl InputMessage {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InputMessage::Button(_) => "button",
            InputMessage::Joystick(_) => "joystick",
            InputMessage::Layout(_) => "layout",
            InputMessage::Gamepad(_) => "gamepad",
            InputMessage::Name(_) => "name",
        }
    }
}

impl From<ButtonMessage> for InputMessage {
    fn from(msg: ButtonMessage) -> Self {
        InputMessage::Button(msg)
    }
}

impl From<JoystickMessage> for InputMessage {
    fn from(msg: JoystickMessage) -> Self {
        InputMessage::Joystick(msg)
    }
}

impl From<GamepadLayoutMessage> for InputMessage {
    fn from(msg: GamepadLayoutMessage) -> Self {
        InputMessage::Layout(msg)
    }
}

impl From<GamepadMessage> for InputMessage {
    fn from(msg: GamepadMessage) -> Self {
        InputMessage::Gamepad(msg)
    }
}

impl From<ControllerNameMessage> for InputMessage {
    fn from(msg: ControllerNameMessage) -> Self {
        InputMessage::Name(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_button_message_layout() {
        let bytes = ButtonMessage::new(ButtonType::B, 1.0).to_bytes();
        assert_eq!(bytes.as_ref(), &[2, 0, 0x00, 0x00, 0x80, 0x3F]);
        assert_eq!(
            ButtonMessage::unmarshal(&bytes).unwrap(),
            ButtonMessage::new(ButtonType::B, 1.0)
        );
    }

    #[test]
    fn test_button_message_unknown_button() {
        assert!(matches!(
            ButtonMessage::unmarshal(&[42, 0, 0, 0, 0, 0]),
            Err(ProtocolError::UnknownDiscriminant { kind: "button", value: 42 })
        ));
    }

    #[test]
    fn test_joystick_message_roundtrip_and_truncation() {
        let msg = JoystickMessage::new(JoystickType::RightThumbstick, 0.5, -0.25);
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), 10);
        assert_eq!(JoystickMessage::unmarshal(&bytes).unwrap(), msg);
        assert!(JoystickMessage::unmarshal(&bytes[..9]).is_err());
    }

    #[test]
    fn test_layout_message_rejects_empty_payload() {
        assert!(GamepadLayoutMessage::unmarshal(&[]).is_err());
        assert_eq!(
            GamepadLayoutMessage::unmarshal(&[1, 0]).unwrap().layout,
            GamepadLayout::Micro
        );
    }

    #[test]
    fn test_name_message_empty_means_none() {
        let none = ControllerNameMessage::new(None);
        assert!(none.to_bytes().is_empty());
        assert_eq!(ControllerNameMessage::unmarshal(&[]).unwrap(), none);

        let named = ControllerNameMessage::new(Some("Pad ✓".into()));
        assert_eq!(ControllerNameMessage::unmarshal(&named.to_bytes()).unwrap(), named);
    }

    #[test]
    fn test_name_message_normalizes_empty_name() {
        assert_eq!(ControllerNameMessage::new(Some(String::new())).name(), None);
        let back: ControllerNameMessage = serde_json::from_str(r#"{"name":""}"#).unwrap();
        assert_eq!(back, ControllerNameMessage::default());
    }

    #[test]
    fn test_name_message_rejects_invalid_utf8() {
        assert!(matches!(
            ControllerNameMessage::unmarshal(&[0xFF, 0xFE]),
            Err(ProtocolError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn test_connected_message_with_and_without_name() {
        let bare = ControllerConnectedMessage::new(3, GamepadLayout::Extended, None);
        let bytes = bare.to_bytes();
        assert_eq!(bytes.as_ref(), &[3, 0, 3, 0]);
        assert_eq!(ControllerConnectedMessage::unmarshal(&bytes).unwrap(), bare);

        let named = ControllerConnectedMessage::new(0, GamepadLayout::Micro, Some("Left".into()));
        assert_eq!(
            ControllerConnectedMessage::unmarshal(&named.to_bytes()).unwrap(),
            named
        );
    }

    #[test]
    fn test_connected_message_tolerates_bad_name_bytes() {
        let decoded = ControllerConnectedMessage::unmarshal(&[1, 0, 2, 0, 0xC3]).unwrap();
        assert_eq!(decoded.index, 1);
        assert_eq!(decoded.layout, GamepadLayout::Regular);
        assert_eq!(decoded.name(), None);
    }

    #[test]
    fn test_connected_message_rejects_bad_layout() {
        assert!(ControllerConnectedMessage::unmarshal(&[1, 0, 7, 0]).is_err());
        assert!(ControllerConnectedMessage::unmarshal(&[1, 0, 2]).is_err());
    }

    #[test]
    fn test_remote_message_prefixes_index() {
        let msg = RemoteMessage::new(0x0201, GamepadLayoutMessage { layout: GamepadLayout::Regular });
        let bytes = msg.to_bytes();
        assert_eq!(bytes.as_ref(), &[0x01, 0x02, 2, 0]);
        assert_eq!(RemoteMessage::<GamepadLayoutMessage>::unmarshal(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_remote_message_propagates_inner_failure() {
        // Valid index, inner gamepad payload cut short.
        assert!(RemoteMessage::<GamepadMessage>::unmarshal(&[0, 0, 2, 0, 0]).is_err());
        assert!(RemoteMessage::<GamepadMessage>::unmarshal(&[0]).is_err());
    }

    #[test]
    fn test_input_message_conversions() {
        let msg: InputMessage = ButtonMessage::new(ButtonType::A, 1.0).into();
        assert_eq!(msg.kind(), "button");
        let msg: InputMessage = ControllerNameMessage::default().into();
        assert_eq!(msg.kind(), "name");
    }
}
