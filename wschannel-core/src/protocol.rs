//! WebSocket protocol constants and opcodes
//!
//! This module contains the protocol definitions from RFC 6455 that the channel
//! relies on: opcodes, frame header bits, and the size limits for control
//! frames and close reasons.

use std::fmt;

/// WebSocket opcodes as defined in RFC 6455 Section 5.2
///
/// Opcodes the RFC reserves are kept as [`Opcode::Unknown`] so a received
/// frame can always be represented and rejected by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Continuation frame
    Continuation,
    /// Text frame
    Text,
    /// Binary frame
    Binary,
    /// Close frame
    Close,
    /// Ping frame
    Ping,
    /// Pong frame
    Pong,
    /// Reserved opcode (0x3-0x7, 0xB-0xF)
    Unknown(u8),
}

impl Opcode {
    /// Decode the low nibble of the first header byte
    pub fn from_u8(value: u8) -> Self {
        match value & frame::OPCODE_MASK {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Unknown(other),
        }
    }

    /// Get the numeric value of the opcode
    pub fn value(&self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Unknown(value) => *value & frame::OPCODE_MASK,
        }
    }

    /// Check if this is a control opcode
    pub fn is_control(&self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    /// Check if this is a data opcode
    pub fn is_data(&self) -> bool {
        matches!(self, Opcode::Text | Opcode::Binary | Opcode::Continuation)
    }

    /// Human-readable frame type used in failure messages. All data opcodes
    /// share the name "Data frame".
    pub fn frame_type_name(&self) -> &'static str {
        match self {
            Opcode::Text | Opcode::Binary | Opcode::Continuation => "Data frame",
            Opcode::Ping => "Ping",
            Opcode::Pong => "Pong",
            Opcode::Close => "Close",
            Opcode::Unknown(_) => "Unknown frame type",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Unknown(value) => write!(f, "Unknown({value:#x})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Protocol constants
pub mod constants {
    use std::time::Duration;

    /// Size of the status code at the start of a Close payload
    pub const CLOSE_CODE_LENGTH: usize = 2;

    /// Largest payload a control frame may carry
    pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

    /// Largest close reason that fits next to the status code
    pub const MAX_CLOSE_REASON_LENGTH: usize = MAX_CONTROL_FRAME_PAYLOAD - CLOSE_CODE_LENGTH;

    /// Default upper bound for a single received payload (64 MiB)
    pub const DEFAULT_MAX_PAYLOAD_LEN: u64 = 64 * 1024 * 1024;

    /// Send quota below which the channel grants more
    pub const DEFAULT_SEND_QUOTA_LOW_WATER_MARK: usize = 1 << 16;

    /// Send quota the channel refills to
    pub const DEFAULT_SEND_QUOTA_HIGH_WATER_MARK: usize = 1 << 17;

    /// Time the peer has to answer a Close we started
    pub const DEFAULT_CLOSING_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Time the peer has to drop the connection once both Close frames were
    /// exchanged. Deliberately shorter than 2MSL: some servers wait for the
    /// client to close first.
    pub const DEFAULT_UNDERLYING_CONNECTION_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
}

/// Frame header bit positions and masks
pub mod frame {
    /// FIN bit position
    pub const FIN_BIT: u8 = 0x80;

    /// RSV1 bit position
    pub const RSV1_BIT: u8 = 0x40;

    /// RSV2 bit position
    pub const RSV2_BIT: u8 = 0x20;

    /// RSV3 bit position
    pub const RSV3_BIT: u8 = 0x10;

    /// Opcode mask
    pub const OPCODE_MASK: u8 = 0x0F;

    /// MASK bit position
    pub const MASK_BIT: u8 = 0x80;

    /// Payload length mask for 7-bit length
    pub const PAYLOAD_LEN_MASK: u8 = 0x7F;

    /// Extended payload length (16-bit) marker
    pub const PAYLOAD_LEN_16: u8 = 126;

    /// Extended payload length (64-bit) marker
    pub const PAYLOAD_LEN_64: u8 = 127;

    /// Masking key length
    pub const MASKING_KEY_LEN: usize = 4;
}
