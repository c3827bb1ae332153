//! Error types for wschannel
//!
//! Configuration and transport problems surface as [`Error`]. Conditions that
//! terminate a channel are described by [`ChannelError`], which knows the
//! message reported to the event sink as well as the close code and reason
//! sent to the peer.

use std::fmt;
use thiserror::Error;

/// Result type alias for wschannel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport errors
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Malformed Close frame payloads
    #[error("Close frame error: {0}")]
    CloseFrame(#[from] CloseFrameError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue {
        /// Name of the offending field
        field: String,
        /// Rejected value, rendered for display
        value: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Completion status reported by a transport for a failed read or write.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The peer closed the underlying connection cleanly.
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport could not deframe the incoming bytes.
    #[error("WebSocket protocol error: {0}")]
    Protocol(String),

    /// Any other I/O failure (reset, timeout, ...).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a received Close frame payload is rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseFrameError {
    /// Payload of exactly one byte
    #[error("Received a broken close frame containing an invalid size body.")]
    InvalidSize,

    /// Status code that must never appear on the wire
    #[error("Received a broken close frame containing a reserved status code.")]
    ReservedStatusCode(u16),

    /// Reason text is not UTF-8
    #[error("Received a broken close frame containing invalid UTF-8.")]
    InvalidUtf8,
}

impl CloseFrameError {
    /// Reason string echoed in the Close frame sent in response.
    pub fn close_reason(&self) -> &'static str {
        match self {
            CloseFrameError::InvalidSize | CloseFrameError::ReservedStatusCode(_) => "",
            CloseFrameError::InvalidUtf8 => "Invalid UTF-8 in Close frame",
        }
    }
}

/// Fatal conditions detected by the channel itself.
///
/// The `Display` output is the message passed to
/// [`EventSink::on_channel_failed`](crate::event::EventSink::on_channel_failed).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The application sent more payload than it had quota for
    #[error("Send quota exceeded")]
    SendQuotaExceeded,

    /// The application supplied a text chunk that is not UTF-8
    #[error("Application sent a text frame containing invalid UTF-8")]
    InvalidOutgoingUtf8,

    /// The peer masked a frame
    #[error("A server must not mask any frames that it sends to the client.")]
    MaskedFrame,

    /// The peer set RSV bits without a negotiated extension
    #[error(
        "One or more reserved bits are on: reserved1 = {rsv1}, reserved2 = {rsv2}, reserved3 = {rsv3}"
    )]
    ReservedBits {
        /// RSV1 as 0 or 1
        rsv1: u8,
        /// RSV2 as 0 or 1
        rsv2: u8,
        /// RSV3 as 0 or 1
        rsv3: u8,
    },

    /// Opcode outside the RFC 6455 set
    #[error("Unrecognized frame opcode: {0}")]
    UnknownOpcode(u8),

    /// Continuation frame with no message in progress
    #[error("Received unexpected continuation frame.")]
    UnexpectedContinuation,

    /// New message started before the previous one finished
    #[error("Received start of new message but previous message is unfinished.")]
    PreviousMessageUnfinished,

    /// Text message from the peer is not UTF-8
    #[error("Could not decode a text frame as UTF-8.")]
    InvalidIncomingUtf8,

    /// Close frame from the peer could not be parsed
    #[error("{0}")]
    BrokenClose(#[from] CloseFrameError),

    /// Any frame after both Close frames were exchanged
    #[error("{0} received after close")]
    FrameAfterClose(&'static str),

    /// The transport could not deframe the incoming bytes
    #[error("Invalid frame header")]
    InvalidFrameHeader,
}

impl ChannelError {
    /// Close code sent to the peer when failing with this error.
    pub fn close_code(&self) -> u16 {
        match self {
            ChannelError::SendQuotaExceeded | ChannelError::InvalidOutgoingUtf8 => {
                CloseCode::GoingAway.code()
            }
            _ => CloseCode::ProtocolError.code(),
        }
    }

    /// Close reason sent to the peer when failing with this error.
    pub fn close_reason(&self) -> &'static str {
        match self {
            ChannelError::MaskedFrame => "Masked frame from server",
            ChannelError::ReservedBits { .. } => "Invalid reserved bit",
            ChannelError::UnknownOpcode(_) => "Unknown opcode",
            ChannelError::UnexpectedContinuation => "Unexpected continuation",
            ChannelError::PreviousMessageUnfinished => "Previous data frame unfinished",
            ChannelError::InvalidIncomingUtf8 => "Invalid UTF-8 in text frame",
            ChannelError::BrokenClose(err) => err.close_reason(),
            ChannelError::InvalidFrameHeader => "WebSocket Protocol Error",
            ChannelError::SendQuotaExceeded
            | ChannelError::InvalidOutgoingUtf8
            | ChannelError::FrameAfterClose(_) => "",
        }
    }
}

/// WebSocket close codes as defined in RFC 6455
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// Normal closure
    Normal,

    /// Going away
    GoingAway,

    /// Protocol error
    ProtocolError,

    /// Unsupported data
    Unsupported,

    /// No status received; never sent on the wire
    NoStatusReceived,

    /// Abnormal closure; never sent on the wire
    Abnormal,

    /// Invalid frame payload data
    InvalidPayload,

    /// Policy violation
    PolicyViolation,

    /// Message too big
    TooBig,

    /// Mandatory extension
    MandatoryExtension,

    /// Internal error (used for errors from either endpoint, RFC 6455 errata 3227)
    InternalError,

    /// TLS handshake failure; never sent on the wire
    TlsHandshake,

    /// Any other code, including application codes in 3000-4999
    Other(u16),
}

impl CloseCode {
    /// Get the numeric value of the close code
    pub fn code(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatusReceived => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::TooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::InternalError => 1011,
            CloseCode::TlsHandshake => 1015,
            CloseCode::Other(code) => *code,
        }
    }

    /// Codes an endpoint must never put in a Close frame.
    pub fn is_reserved(&self) -> bool {
        matches!(
            self,
            CloseCode::NoStatusReceived | CloseCode::Abnormal | CloseCode::TlsHandshake
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::NoStatusReceived,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::TooBig,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::InternalError,
            1015 => CloseCode::TlsHandshake,
            code => CloseCode::Other(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.code()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseCode::Normal => "Normal",
            CloseCode::GoingAway => "GoingAway",
            CloseCode::ProtocolError => "ProtocolError",
            CloseCode::Unsupported => "Unsupported",
            CloseCode::NoStatusReceived => "NoStatusReceived",
            CloseCode::Abnormal => "AbnormalClosure",
            CloseCode::InvalidPayload => "InvalidPayload",
            CloseCode::PolicyViolation => "PolicyViolation",
            CloseCode::TooBig => "TooBig",
            CloseCode::MandatoryExtension => "MandatoryExtension",
            CloseCode::InternalError => "InternalError",
            CloseCode::TlsHandshake => "TlsHandshake",
            CloseCode::Other(_) => "Other",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_conversion() {
        assert_eq!(CloseCode::from(1000), CloseCode::Normal);
        assert_eq!(CloseCode::from(3000), CloseCode::Other(3000));
        assert_eq!(u16::from(CloseCode::InternalError), 1011);
        assert!(CloseCode::from(1015).is_reserved());
        assert!(!CloseCode::from(1001).is_reserved());
    }

    #[test]
    fn test_close_code_display() {
        assert_eq!(CloseCode::ProtocolError.to_string(), "ProtocolError (1002)");
        assert_eq!(CloseCode::Other(4001).to_string(), "Other (4001)");
    }

    #[test]
    fn test_channel_error_wire_mapping() {
        assert_eq!(ChannelError::SendQuotaExceeded.close_code(), 1001);
        assert_eq!(ChannelError::SendQuotaExceeded.close_reason(), "");
        assert_eq!(ChannelError::MaskedFrame.close_code(), 1002);
        assert_eq!(
            ChannelError::MaskedFrame.close_reason(),
            "Masked frame from server"
        );

        let err = ChannelError::from(CloseFrameError::InvalidUtf8);
        assert_eq!(err.close_code(), 1002);
        assert_eq!(err.close_reason(), "Invalid UTF-8 in Close frame");
        assert_eq!(
            err.to_string(),
            "Received a broken close frame containing invalid UTF-8."
        );
    }

    #[test]
    fn test_reserved_bits_message() {
        let err = ChannelError::ReservedBits {
            rsv1: 1,
            rsv2: 0,
            rsv3: 1,
        };
        assert_eq!(
            err.to_string(),
            "One or more reserved bits are on: reserved1 = 1, reserved2 = 0, reserved3 = 1"
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::Config(ConfigError::Validation("bad".to_string()));
        assert_eq!(
            err.to_string(),
            "Configuration error: Configuration validation failed: bad"
        );
    }
}
