//! Gamepad model: button and joystick identifiers, layouts, and the full
//! [`GamepadState`] with its layout-conditional wire encoding.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::ProtocolError;
use crate::codec::{Marshal, ensure_remaining};

// ---------------------------------------------------------------------------
// Discriminants
// ---------------------------------------------------------------------------

/// Implements `TryFrom<u16>` and `From<T> for u16` for a `#[repr(u16)]`
/// enum whose variants are listed with their wire values.
macro_rules! wire_enum {
    ($name:ident, $kind:literal, { $($variant:ident = $value:literal),+ $(,)? }) => {
        impl TryFrom<u16> for $name {
            type Error = ProtocolError;

            fn try_from(value: u16) -> Result<Self, ProtocolError> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err(ProtocolError::UnknownDiscriminant {
                        kind: $kind,
                        value: other,
                    }),
                }
            }
        }

        impl From<$name> for u16 {
            fn from(value: $name) -> u16 {
                value as u16
            }
        }
    };
}

/// A digital or analog button on a gamepad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum ButtonType {
    A = 1,
    B = 2,
    X = 3,
    Y = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftTrigger = 7,
    RightTrigger = 8,
    Pause = 9,
}

wire_enum!(ButtonType, "button", {
    A = 1, B = 2, X = 3, Y = 4,
    LeftShoulder = 5, RightShoulder = 6, LeftTrigger = 7, RightTrigger = 8,
    Pause = 9,
});

/// A two-axis input: the directional pad or one of the thumbsticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum JoystickType {
    Dpad = 1,
    LeftThumbstick = 2,
    RightThumbstick = 3,
}

wire_enum!(JoystickType, "joystick", {
    Dpad = 1, LeftThumbstick = 2, RightThumbstick = 3,
});

/// Which physical controls a gamepad has.
///
/// Each tier is a strict superset of the previous one, and the tier decides
/// how many fields [`GamepadState`] puts on the wire.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(u16)]
pub enum GamepadLayout {
    /// A, X and the directional pad.
    Micro = 1,
    /// Adds B, Y and both shoulder buttons.
    #[default]
    Regular = 2,
    /// Adds both triggers and both thumbsticks.
    Extended = 3,
}

wire_enum!(GamepadLayout, "layout", {
    Micro = 1, Regular = 2, Extended = 3,
});

impl GamepadLayout {
    /// Whether the B/Y/shoulder block is present.
    pub fn has_regular_controls(self) -> bool {
        self >= GamepadLayout::Regular
    }

    /// Whether the trigger/thumbstick block is present.
    pub fn has_extended_controls(self) -> bool {
        self == GamepadLayout::Extended
    }

    /// Encoded size of a [`GamepadState`] in this layout.
    pub fn encoded_len(self) -> usize {
        2 + MICRO_BLOCK
            + if self.has_regular_controls() { REGULAR_BLOCK } else { 0 }
            + if self.has_extended_controls() { EXTENDED_BLOCK } else { 0 }
    }
}

impl fmt::Display for GamepadLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GamepadLayout::Micro => "micro",
            GamepadLayout::Regular => "regular",
            GamepadLayout::Extended => "extended",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// JoystickState
// ---------------------------------------------------------------------------

/// Position of a two-axis input. Axes are nominally in `-1.0..=1.0`.
///
/// The y axis grows downward, so a negative `y_axis` means "up".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JoystickState {
    pub x_axis: f32,
    pub y_axis: f32,
}

impl JoystickState {
    pub const CENTERED: JoystickState = JoystickState::new(0.0, 0.0);

    pub const fn new(x_axis: f32, y_axis: f32) -> Self {
        Self { x_axis, y_axis }
    }

    pub fn up(&self) -> bool {
        self.y_axis < 0.0
    }

    pub fn down(&self) -> bool {
        self.y_axis > 0.0
    }

    pub fn left(&self) -> bool {
        self.x_axis < 0.0
    }

    pub fn right(&self) -> bool {
        self.x_axis > 0.0
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_f32_le(self.x_axis);
        buf.put_f32_le(self.y_axis);
    }

    fn get(buf: &mut &[u8]) -> Self {
        let x_axis = buf.get_f32_le();
        let y_axis = buf.get_f32_le();
        Self { x_axis, y_axis }
    }
}

// ---------------------------------------------------------------------------
// GamepadState
// ---------------------------------------------------------------------------

/// Bytes in the always-present block: A, X, dpad.x, dpad.y.
const MICRO_BLOCK: usize = 4 * 4;
/// Bytes in the Regular block: B, Y, left shoulder, right shoulder.
const REGULAR_BLOCK: usize = 4 * 4;
/// Bytes in the Extended block: two triggers and two thumbsticks.
const EXTENDED_BLOCK: usize = 6 * 4;

/// The complete state of one gamepad.
///
/// Equality is plain field-wise comparison, layout included. Fields that
/// the layout does not carry stay at `0.0` and are not encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GamepadState {
    pub layout: GamepadLayout,

    pub button_a: f32,
    pub button_b: f32,
    pub button_x: f32,
    pub button_y: f32,

    pub left_shoulder: f32,
    pub right_shoulder: f32,
    pub left_trigger: f32,
    pub right_trigger: f32,

    pub dpad: JoystickState,
    pub left_thumbstick: JoystickState,
    pub right_thumbstick: JoystickState,
}

impl GamepadState {
    /// A state with every control released.
    pub fn new(layout: GamepadLayout) -> Self {
        Self {
            layout,
            ..Self::default()
        }
    }

    /// Current value of a button. `Pause` has no analog value and reads `0.0`.
    pub fn button(&self, button: ButtonType) -> f32 {
        match button {
            ButtonType::A => self.button_a,
            ButtonType::B => self.button_b,
            ButtonType::X => self.button_x,
            ButtonType::Y => self.button_y,
            ButtonType::LeftShoulder => self.left_shoulder,
            ButtonType::RightShoulder => self.right_shoulder,
            ButtonType::LeftTrigger => self.left_trigger,
            ButtonType::RightTrigger => self.right_trigger,
            ButtonType::Pause => 0.0,
        }
    }

    /// Mutable slot for a button, or `None` for `Pause`.
    pub fn button_mut(&mut self, button: ButtonType) -> Option<&mut f32> {
        match button {
            ButtonType::A => Some(&mut self.button_a),
            ButtonType::B => Some(&mut self.button_b),
            ButtonType::X => Some(&mut self.button_x),
            ButtonType::Y => Some(&mut self.button_y),
            ButtonType::LeftShoulder => Some(&mut self.left_shoulder),
            ButtonType::RightShoulder => Some(&mut self.right_shoulder),
            ButtonType::LeftTrigger => Some(&mut self.left_trigger),
            ButtonType::RightTrigger => Some(&mut self.right_trigger),
            ButtonType::Pause => None,
        }
    }

    pub fn joystick(&self, joystick: JoystickType) -> JoystickState {
        match joystick {
            JoystickType::Dpad => self.dpad,
            JoystickType::LeftThumbstick => self.left_thumbstick,
            JoystickType::RightThumbstick => self.right_thumbstick,
        }
    }

    pub fn joystick_mut(&mut self, joystick: JoystickType) -> &mut JoystickState {
        match joystick {
            JoystickType::Dpad => &mut self.dpad,
            JoystickType::LeftThumbstick => &mut self.left_thumbstick,
            JoystickType::RightThumbstick => &mut self.right_thumbstick,
        }
    }
}

impl Marshal for GamepadState {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.reserve(self.layout.encoded_len());
        buf.put_u16_le(self.layout.into());

        buf.put_f32_le(self.button_a);
        buf.put_f32_le(self.button_x);
        self.dpad.put(buf);

        if self.layout.has_regular_controls() {
            buf.put_f32_le(self.button_b);
            buf.put_f32_le(self.button_y);
            buf.put_f32_le(self.left_shoulder);
            buf.put_f32_le(self.right_shoulder);
        }

        if self.layout.has_extended_controls() {
            buf.put_f32_le(self.left_trigger);
            buf.put_f32_le(self.right_trigger);
            self.left_thumbstick.put(buf);
            self.right_thumbstick.put(buf);
        }
    }

    fn unmarshal(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;

        ensure_remaining(&buf, 2, "gamepad layout")?;
        let layout = GamepadLayout::try_from(buf.get_u16_le())?;
        let mut state = GamepadState::new(layout);

        ensure_remaining(&buf, MICRO_BLOCK, "gamepad micro block")?;
        state.button_a = buf.get_f32_le();
        state.button_x = buf.get_f32_le();
        state.dpad = JoystickState::get(&mut buf);

        if layout.has_regular_controls() {
            ensure_remaining(&buf, REGULAR_BLOCK, "gamepad regular block")?;
            state.button_b = buf.get_f32_le();
            state.button_y = buf.get_f32_le();
            state.left_shoulder = buf.get_f32_le();
            state.right_shoulder = buf.get_f32_le();
        }

        if layout.has_extended_controls() {
            ensure_remaining(&buf, EXTENDED_BLOCK, "gamepad extended block")?;
            state.left_trigger = buf.get_f32_le();
            state.right_trigger = buf.get_f32_le();
            state.left_thumbstick = JoystickState::get(&mut buf);
            state.right_thumbstick = JoystickState::get(&mut buf);
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extended_sample() -> GamepadState {
        GamepadState {
            layout: GamepadLayout::Extended,
            button_a: 1.0,
            button_b: 0.25,
            button_x: 0.5,
            button_y: 0.75,
            left_shoulder: 0.1,
            right_shoulder: 0.2,
            left_trigger: 0.3,
            right_trigger: 0.4,
            dpad: JoystickState::new(-1.0, 1.0),
            left_thumbstick: JoystickState::new(0.6, -0.6),
            right_thumbstick: JoystickState::new(-0.9, 0.9),
        }
    }

    #[test]
    fn test_button_type_discriminants() {
        assert_eq!(ButtonType::try_from(1).unwrap(), ButtonType::A);
        assert_eq!(ButtonType::try_from(9).unwrap(), ButtonType::Pause);
        assert_eq!(u16::from(ButtonType::RightTrigger), 8);
        assert!(matches!(
            ButtonType::try_from(10),
            Err(ProtocolError::UnknownDiscriminant { kind: "button", value: 10 })
        ));
        assert!(ButtonType::try_from(0).is_err());
    }

    #[test]
    fn test_joystick_and_layout_discriminants() {
        assert_eq!(JoystickType::try_from(2).unwrap(), JoystickType::LeftThumbstick);
        assert!(JoystickType::try_from(4).is_err());
        assert_eq!(GamepadLayout::try_from(3).unwrap(), GamepadLayout::Extended);
        assert!(GamepadLayout::try_from(0).is_err());
    }

    #[test]
    fn test_joystick_directions() {
        let up_left = JoystickState::new(-0.5, -0.5);
        assert!(up_left.up() && up_left.left());
        assert!(!up_left.down() && !up_left.right());

        let centered = JoystickState::CENTERED;
        assert!(!centered.up() && !centered.down() && !centered.left() && !centered.right());
    }

    #[test]
    fn test_encoded_len_per_layout() {
        assert_eq!(GamepadLayout::Micro.encoded_len(), 18);
        assert_eq!(GamepadLayout::Regular.encoded_len(), 34);
        assert_eq!(GamepadLayout::Extended.encoded_len(), 58);
        for layout in [GamepadLayout::Micro, GamepadLayout::Regular, GamepadLayout::Extended] {
            assert_eq!(GamepadState::new(layout).to_bytes().len(), layout.encoded_len());
        }
    }

    #[test]
    fn test_extended_state_roundtrip() {
        let state = extended_sample();
        assert_eq!(GamepadState::unmarshal(&state.to_bytes()).unwrap(), state);
    }

    #[test]
    fn test_micro_encoding_drops_higher_tiers() {
        let mut state = extended_sample();
        state.layout = GamepadLayout::Micro;
        let decoded = GamepadState::unmarshal(&state.to_bytes()).unwrap();

        assert_eq!(decoded.button_a, 1.0);
        assert_eq!(decoded.button_x, 0.5);
        assert_eq!(decoded.dpad, JoystickState::new(-1.0, 1.0));
        assert_eq!(decoded.button_b, 0.0);
        assert_eq!(decoded.left_trigger, 0.0);
        assert_eq!(decoded.left_thumbstick, JoystickState::CENTERED);
    }

    #[test]
    fn test_truncated_block_is_rejected() {
        let bytes = extended_sample().to_bytes();
        // Drop the last float of the extended block.
        let err = GamepadState::unmarshal(&bytes[..bytes.len() - 4]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Truncated { what: "gamepad extended block", .. }
        ));

        // Regular layout, but the regular block is missing entirely.
        let micro_sized = &GamepadState::new(GamepadLayout::Regular).to_bytes()[..18];
        assert!(GamepadState::unmarshal(micro_sized).is_err());
    }

    #[test]
    fn test_equality_covers_triggers_independently() {
        let mut a = GamepadState::new(GamepadLayout::Extended);
        let mut b = a;
        a.left_trigger = 0.5;
        b.right_trigger = 0.5;
        assert_ne!(a, b);
    }

    #[test]
    fn test_button_accessors() {
        let mut state = GamepadState::default();
        *state.button_mut(ButtonType::Y).unwrap() = 0.8;
        assert_eq!(state.button(ButtonType::Y), 0.8);
        assert!(state.button_mut(ButtonType::Pause).is_none());

        *state.joystick_mut(JoystickType::Dpad) = JoystickState::new(1.0, 0.0);
        assert!(state.joystick(JoystickType::Dpad).right());
    }

    #[test]
    fn test_state_snapshot_as_json() {
        let mut state = GamepadState::new(GamepadLayout::Micro);
        state.button_a = 1.0;
        state.dpad = JoystickState::new(0.0, -1.0);

        let json = serde_json::to_value(state).unwrap();
        assert_eq!(json["layout"], "Micro");
        assert_eq!(json["button_a"], 1.0);
        assert_eq!(json["dpad"]["y_axis"], -1.0);

        let back: GamepadState = serde_json::from_value(json).unwrap();
        assert!(back.dpad.up());
    }
}
