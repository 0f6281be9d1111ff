// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire protocol: message kinds, envelopes, and the framing error taxonomy.
//!
//! Every message on the transport is one [`Envelope`]: a fixed 3-element
//! tuple of message kind, method name, and opaque payload, framed with a
//! narrow subset of the msgpack binary family (see [`codec`]). Request and
//! Response (or Error) form the top-level exchange; Call and CallResponse
//! (or CallError) form a nested exchange the server initiates while it is
//! still handling a Request.

pub mod codec;

use std::fmt;

use thiserror::Error;

/// Marker byte for a fixed 3-element msgpack array.
pub const FIXED_ARRAY3: u8 = 0x93;
/// Marker byte for an unsigned 8-bit integer.
pub const U8_MARKER: u8 = 0xCC;
/// Marker byte for a binary string with a 1-byte length.
pub const BIN8: u8 = 0xC4;
/// Marker byte for a binary string with a 2-byte big-endian length.
pub const BIN16: u8 = 0xC5;
/// Marker byte for a binary string with a 4-byte big-endian length.
pub const BIN32: u8 = 0xC6;

/// The kind of a protocol message. Kind 0 is reserved and invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// A top-level request from the client.
    Request = 1,
    /// The client's successful answer to a nested [`MessageKind::Call`].
    CallResponse = 2,
    /// The client's error answer to a nested [`MessageKind::Call`].
    CallError = 3,
    /// The server's successful answer to a [`MessageKind::Request`].
    Response = 4,
    /// The server's error answer to a [`MessageKind::Request`].
    Error = 5,
    /// A nested call from the server to the client, issued mid-request.
    Call = 6,
}

impl MessageKind {
    /// Decodes a kind byte, rejecting values outside the known range.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Request),
            2 => Some(Self::CallResponse),
            3 => Some(Self::CallError),
            4 => Some(Self::Response),
            5 => Some(Self::Error),
            6 => Some(Self::Call),
            _ => None,
        }
    }

    /// The wire-facing name of this kind, used in protocol error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::CallResponse => "call-response",
            Self::CallError => "call-error",
            Self::Response => "response",
            Self::Error => "error",
            Self::Call => "call",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message kind.
    pub kind: MessageKind,
    /// Method name. Correlates nested replies with the call that caused them.
    pub method: String,
    /// Opaque payload bytes. Interpretation belongs to the method.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Creates an envelope from its three fields.
    #[must_use]
    pub fn new(kind: MessageKind, method: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            method: method.into(),
            payload: payload.into(),
        }
    }
}

/// A violation of the wire format. Always fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The first byte of a message was not the fixed 3-element array marker.
    #[error(
        "expected message to be encoded as a fixed 3-element array (0x93), received: 0x{0:02x}"
    )]
    BadArrayMarker(u8),

    /// The first tuple element was not tagged as an unsigned 8-bit int.
    #[error(
        "expected first element of message tuple to be encoded as an unsigned 8-bit int (0xcc), received: 0x{0:02x}"
    )]
    BadKindMarker(u8),

    /// The declared message kind is outside the known range.
    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    /// A binary string did not start with one of the three length tags.
    #[error("expected binary data length (0xc4-0xc6), received: 0x{0:02x}")]
    BadBinTag(u8),

    /// The method field was not valid UTF-8.
    #[error("method name is not valid UTF-8")]
    InvalidMethod(#[source] std::string::FromUtf8Error),

    /// A reply arrived for a different method than the one awaited.
    #[error("expected method {expected:?}, received {actual:?}")]
    MethodMismatch {
        /// The method the caller was awaiting a reply for.
        expected: String,
        /// The method the peer actually sent.
        actual: String,
    },

    /// An envelope of the wrong kind arrived at this point in the exchange.
    #[error("expected {expected}, received: {actual}")]
    UnexpectedKind {
        /// Description of the acceptable kinds.
        expected: &'static str,
        /// The kind the peer actually sent.
        actual: MessageKind,
    },

    /// The stream ended while a reply was still outstanding.
    #[error("connection closed while awaiting a reply")]
    UnexpectedEof,

    /// The underlying transport failed (including short reads mid-envelope).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_byte() {
        for kind in [
            MessageKind::Request,
            MessageKind::CallResponse,
            MessageKind::CallError,
            MessageKind::Response,
            MessageKind::Error,
            MessageKind::Call,
        ] {
            assert_eq!(MessageKind::from_u8(kind as u8), Some(kind));
        }
    }

    #[test]
    fn kind_zero_is_reserved() {
        assert_eq!(MessageKind::from_u8(0), None);
    }

    #[test]
    fn kind_out_of_range_is_rejected() {
        assert_eq!(MessageKind::from_u8(7), None);
        assert_eq!(MessageKind::from_u8(255), None);
    }
}
