//! DNS-SD TXT record carried by a browser's service advertisement.
//!
//! A TXT record is a sequence of `[len u8][key=value]` strings. We publish a
//! single entry, `INPUT_PORT`, whose value is the browser's UDP input port as
//! two little-endian bytes. Other entries are skipped on decode.

use bytes::{BufMut, Bytes, BytesMut};

use crate::ProtocolError;

/// Key of the input port entry.
pub const INPUT_PORT_KEY: &str = "INPUT_PORT";

/// Decoded TXT record of a controller browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceTxtRecord {
    /// UDP port the browser receives gamepad state on.
    pub input_port: u16,
}

impl ServiceTxtRecord {
    pub fn new(input_port: u16) -> Self {
        Self { input_port }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + INPUT_PORT_KEY.len() + 3);
        buf.put_u8((INPUT_PORT_KEY.len() + 1 + 2) as u8);
        buf.put_slice(INPUT_PORT_KEY.as_bytes());
        buf.put_u8(b'=');
        buf.put_u16_le(self.input_port);
        buf.freeze()
    }

    /// Parses a TXT record.
    ///
    /// # Errors
    /// [`ProtocolError::Truncated`] if an entry overruns the buffer, and
    /// [`ProtocolError::InvalidMessage`] if the input port is missing,
    /// malformed, or zero.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut rest = data;
        while let Some((&len, tail)) = rest.split_first() {
            let len = len as usize;
            if tail.len() < len {
                return Err(ProtocolError::Truncated {
                    what: "txt entry",
                    needed: len,
                    available: tail.len(),
                });
            }
            let (entry, next) = tail.split_at(len);
            rest = next;

            let Some(eq) = entry.iter().position(|&b| b == b'=') else {
                continue;
            };
            let (key, value) = (&entry[..eq], &entry[eq + 1..]);
            if !key.eq_ignore_ascii_case(INPUT_PORT_KEY.as_bytes()) {
                continue;
            }

            let port = match value {
                [lo, hi] => u16::from_le_bytes([*lo, *hi]),
                _ => {
                    return Err(ProtocolError::InvalidMessage(format!(
                        "{INPUT_PORT_KEY} must be 2 bytes, got {}",
                        value.len()
                    )));
                }
            };
            if port == 0 {
                return Err(ProtocolError::InvalidMessage(format!(
                    "{INPUT_PORT_KEY} is zero"
                )));
            }
            return Ok(Self::new(port));
        }

        Err(ProtocolError::InvalidMessage(format!(
            "txt record has no {INPUT_PORT_KEY} entry"
        )))
    }
}
