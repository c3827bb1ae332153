//! Incremental UTF-8 validation
//!
//! Text messages may be split across any number of frames, and a frame
//! boundary can fall in the middle of a code point. [`StreamingUtf8Validator`]
//! carries the partial sequence between calls so each chunk can be checked as
//! it arrives.

/// Result of feeding bytes to a [`StreamingUtf8Validator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utf8State {
    /// Everything seen so far is valid and ends on a code point boundary
    ValidEndpoint,
    /// Everything seen so far is valid but ends inside a code point
    ValidMidpoint,
    /// An invalid sequence was seen; sticky until [`StreamingUtf8Validator::reset`]
    Invalid,
}

/// Streaming UTF-8 validator per RFC 3629
///
/// Rejects overlong encodings, surrogates and code points above U+10FFFF
/// as soon as the offending byte is seen.
#[derive(Debug, Clone, Default)]
pub struct StreamingUtf8Validator {
    /// Continuation bytes still owed by the current sequence
    remaining: u8,
    /// Inclusive bounds for the next continuation byte
    lower: u8,
    upper: u8,
    invalid: bool,
}

impl StreamingUtf8Validator {
    /// Create a validator positioned at a code point boundary
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all state
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Validate a complete byte string in one go
    pub fn validate(data: &[u8]) -> bool {
        std::str::from_utf8(data).is_ok()
    }

    /// Feed the next chunk and report the state after it
    pub fn add_bytes(&mut self, mut data: &[u8]) -> Utf8State {
        if self.invalid {
            return Utf8State::Invalid;
        }

        // Finish a sequence left open by the previous chunk.
        while self.remaining > 0 {
            let Some((&byte, rest)) = data.split_first() else {
                return Utf8State::ValidMidpoint;
            };
            if !self.continue_sequence(byte) {
                return self.fail();
            }
            data = rest;
        }

        match std::str::from_utf8(data) {
            Ok(_) => Utf8State::ValidEndpoint,
            Err(err) if err.error_len().is_some() => self.fail(),
            Err(err) => {
                // Truncated sequence at the end of the chunk; remember it.
                for &byte in &data[err.valid_up_to()..] {
                    let accepted = if self.remaining == 0 {
                        self.start_sequence(byte)
                    } else {
                        self.continue_sequence(byte)
                    };
                    if !accepted {
                        return self.fail();
                    }
                }
                self.state()
            }
        }
    }

    /// State after the bytes seen so far
    pub fn state(&self) -> Utf8State {
        if self.invalid {
            Utf8State::Invalid
        } else if self.remaining > 0 {
            Utf8State::ValidMidpoint
        } else {
            Utf8State::ValidEndpoint
        }
    }

    fn start_sequence(&mut self, lead: u8) -> bool {
        let (remaining, lower, upper) = match lead {
            0x00..=0x7F => return true,
            0xC2..=0xDF => (1, 0x80, 0xBF),
            0xE0 => (2, 0xA0, 0xBF),
            0xE1..=0xEC | 0xEE..=0xEF => (2, 0x80, 0xBF),
            0xED => (2, 0x80, 0x9F),
            0xF0 => (3, 0x90, 0xBF),
            0xF1..=0xF3 => (3, 0x80, 0xBF),
            0xF4 => (3, 0x80, 0x8F),
            _ => return false,
        };
        self.remaining = remaining;
        self.lower = lower;
        self.upper = upper;
        true
    }

    fn continue_sequence(&mut self, byte: u8) -> bool {
        if byte < self.lower || byte > self.upper {
            return false;
        }
        self.remaining -= 1;
        self.lower = 0x80;
        self.upper = 0xBF;
        true
    }

    fn fail(&mut self) -> Utf8State {
        self.invalid = true;
        Utf8State::Invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn feed_all(chunks: &[&[u8]]) -> Utf8State {
        let mut validator = StreamingUtf8Validator::new();
        let mut state = validator.state();
        for chunk in chunks {
            state = validator.add_bytes(chunk);
        }
        state
    }

    #[test]
    fn test_ascii_and_empty() {
        assert_eq!(feed_all(&[b""]), Utf8State::ValidEndpoint);
        assert_eq!(feed_all(&[b"hello"]), Utf8State::ValidEndpoint);
    }

    #[test]
    fn test_split_two_byte_sequence() {
        assert_eq!(feed_all(&[b"\xc2"]), Utf8State::ValidMidpoint);
        assert_eq!(feed_all(&[b"\xc2", b"\x80"]), Utf8State::ValidEndpoint);
        assert_eq!(feed_all(&[b"\xc2", b"", b"\x80"]), Utf8State::ValidEndpoint);
    }

    #[test]
    fn test_split_four_byte_sequence_byte_by_byte() {
        let crab = "\u{1F980}".as_bytes();
        assert_eq!(
            feed_all(&[&crab[..1], &crab[1..2], &crab[2..3]]),
            Utf8State::ValidMidpoint
        );
        assert_eq!(
            feed_all(&[&crab[..1], &crab[1..2], &crab[2..3], &crab[3..]]),
            Utf8State::ValidEndpoint
        );
    }

    #[test]
    fn test_rejects_early() {
        // Overlong two-byte lead
        assert_eq!(feed_all(&[b"\xc0"]), Utf8State::Invalid);
        // Surrogate half, rejected on the second byte
        assert_eq!(feed_all(&[b"\xed\xa0"]), Utf8State::Invalid);
        // Above U+10FFFF
        assert_eq!(feed_all(&[b"\xf4\x90"]), Utf8State::Invalid);
        // Missing continuation
        assert_eq!(feed_all(&[b"\xc2", b"a"]), Utf8State::Invalid);
    }

    #[test]
    fn test_invalid_is_sticky_until_reset() {
        let mut validator = StreamingUtf8Validator::new();
        assert_eq!(validator.add_bytes(b"\xff"), Utf8State::Invalid);
        assert_eq!(validator.add_bytes(b"ok"), Utf8State::Invalid);
        validator.reset();
        assert_eq!(validator.add_bytes(b"ok"), Utf8State::ValidEndpoint);
    }

    proptest! {
        #[test]
        fn prop_split_invariant(data in proptest::collection::vec(any::<u8>(), 0..64), split in any::<prop::sample::Index>()) {
            let at = split.index(data.len() + 1);
            let whole = feed_all(&[&data[..]]);
            let parts = feed_all(&[&data[..at], &data[at..]]);
            prop_assert_eq!(whole, parts);
        }

        #[test]
        fn prop_split_invariant_on_valid_text(text in "\\PC{0,24}", split in any::<prop::sample::Index>()) {
            let data = text.as_bytes();
            let at = split.index(data.len() + 1);
            prop_assert_eq!(feed_all(&[&data[..at], &data[at..]]), Utf8State::ValidEndpoint);
        }

        #[test]
        fn prop_matches_std(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let complete = std::str::from_utf8(&data).is_ok();
            prop_assert_eq!(feed_all(&[&data[..]]) == Utf8State::ValidEndpoint, complete);
        }
    }
}
