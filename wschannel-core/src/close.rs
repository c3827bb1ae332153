//! Close frame payloads (RFC 6455 Section 5.5.1)
//!
//! A Close payload is either empty or a big-endian status code followed by an
//! optional UTF-8 reason, 125 bytes at most.

use crate::{
    error::{CloseCode, CloseFrameError},
    protocol::constants::CLOSE_CODE_LENGTH,
};
use bytes::{BufMut, Bytes, BytesMut};

/// Half-open `[start, end)` ranges of codes an application may not send.
const INVALID_RANGES: [(u32, u32); 4] = [
    // 1000 is the first valid code
    (0, 1000),
    // 1006 MUST NOT be set
    (1006, 1007),
    // 1014 unassigned; 1015 up to 2999 are reserved
    (1014, 3000),
    (5000, 65536),
];

/// Check an outgoing status code for strict RFC 6455 compliance.
///
/// Only used for codes the application asks us to send; incoming codes are
/// checked by [`parse_close`], which forbids a narrower set.
pub fn is_strictly_valid_close_status_code(code: u16) -> bool {
    let code = u32::from(code);
    !INVALID_RANGES
        .iter()
        .any(|&(start, end)| (start..end).contains(&code))
}

/// Build the payload of an outgoing Close frame.
///
/// `NoStatusReceived` (1005) is translated into an empty payload, since it
/// must never appear on the wire; its reason is dropped.
pub fn build_close_payload(code: u16, reason: &str) -> Bytes {
    if code == CloseCode::NoStatusReceived.code() {
        return Bytes::new();
    }

    let mut payload = BytesMut::with_capacity(CLOSE_CODE_LENGTH + reason.len());
    payload.put_u16(code);
    payload.put_slice(reason.as_bytes());
    payload.freeze()
}

/// Parse the payload of a received Close frame into `(code, reason)`.
pub fn parse_close(payload: &[u8]) -> Result<(u16, String), CloseFrameError> {
    if payload.is_empty() {
        return Ok((CloseCode::NoStatusReceived.code(), String::new()));
    }
    if payload.len() < CLOSE_CODE_LENGTH {
        tracing::debug!(
            size = payload.len(),
            first_byte = payload[0],
            "close frame with truncated status code"
        );
        return Err(CloseFrameError::InvalidSize);
    }

    let code = u16::from_be_bytes([payload[0], payload[1]]);
    if CloseCode::from(code).is_reserved() {
        return Err(CloseFrameError::ReservedStatusCode(code));
    }

    let reason = std::str::from_utf8(&payload[CLOSE_CODE_LENGTH..])
        .map_err(|_| CloseFrameError::InvalidUtf8)?;
    Ok((code, reason.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_strict_validity_boundaries() {
        for code in [0, 999, 1006, 1014, 1015, 2999, 5000, 65535] {
            assert!(!is_strictly_valid_close_status_code(code), "{code}");
        }
        for code in [1000, 1005, 1007, 1013, 3000, 4999] {
            assert!(is_strictly_valid_close_status_code(code), "{code}");
        }
    }

    #[test]
    fn test_build_close_payload() {
        assert_eq!(&build_close_payload(1000, "bye")[..], b"\x03\xe8bye");
        assert_eq!(&build_close_payload(4000, "")[..], b"\x0f\xa0");
        assert!(build_close_payload(1005, "").is_empty());
    }

    #[test]
    fn test_parse_close() {
        assert_eq!(parse_close(b""), Ok((1005, String::new())));
        assert_eq!(parse_close(b"\x03\xe8"), Ok((1000, String::new())));
        assert_eq!(parse_close(b"\x03\xe8bye"), Ok((1000, "bye".to_string())));
        assert_eq!(parse_close(b"\x03"), Err(CloseFrameError::InvalidSize));
        assert_eq!(
            parse_close(b"\x03\xee"),
            Err(CloseFrameError::ReservedStatusCode(1006))
        );
        assert_eq!(
            parse_close(b"\x03\xe8\xff"),
            Err(CloseFrameError::InvalidUtf8)
        );
    }

    #[test]
    fn test_parse_accepts_codes_the_sender_may_not_use() {
        // Incoming validation is narrower than outgoing validation.
        assert_eq!(parse_close(b"\x00\x01"), Ok((1, String::new())));
        assert_eq!(parse_close(b"\x07\xd0"), Ok((2000, String::new())));
    }

    proptest! {
        #[test]
        fn prop_strict_validity_matches_ranges(code in any::<u16>()) {
            let forbidden = code < 1000
                || code == 1006
                || (1014..3000).contains(&code)
                || code >= 5000;
            prop_assert_eq!(is_strictly_valid_close_status_code(code), !forbidden);
        }
    }
}
