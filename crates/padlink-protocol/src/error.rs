//! Error types for the protocol layer.
//!
//! Every decode failure lands here. Callers on the receive path log these
//! at `trace` and drop the frame; nothing in this enum is ever fatal to a
//! connection except [`ProtocolError::FrameTooLarge`] on a byte stream,
//! where the framing itself can no longer be trusted.

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Fewer bytes were available than the field or frame requires.
    #[error("truncated {what}: needed {needed} bytes, {available} available")]
    Truncated {
        /// Which field or block was being read.
        what: &'static str,
        /// Bytes required to continue.
        needed: usize,
        /// Bytes actually left in the input.
        available: usize,
    },

    /// A discriminant (button, joystick, layout) had no known mapping.
    #[error("unknown {kind} discriminant {value}")]
    UnknownDiscriminant {
        /// The enum being decoded.
        kind: &'static str,
        /// The raw value found on the wire.
        value: u16,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// A stream frame declared a payload longer than the codec accepts.
    #[error("frame payload of {length} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Declared payload length.
        length: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The bytes decoded but violate a protocol rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The underlying byte stream failed while framing.
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
}
