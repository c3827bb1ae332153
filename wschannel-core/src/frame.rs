//! WebSocket frame model and wire codec
//!
//! [`Frame`] is the record exchanged between the channel and its transport.
//! The channel never touches bytes on the wire; transports that speak raw
//! sockets use [`Frame::write_to`] and [`FrameDecoder`] to convert between the
//! two.

use crate::{
    error::StreamError,
    protocol::{
        constants::{DEFAULT_MAX_PAYLOAD_LEN, MAX_CONTROL_FRAME_PAYLOAD},
        frame::*,
        Opcode,
    },
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Most the decoder reserves ahead of a partially received payload
const MAX_RESERVE_AHEAD: usize = 64 * 1024;

/// Represents a WebSocket frame according to RFC 6455
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame in a message
    pub fin: bool,
    /// Reserved bits (RSV1, RSV2, RSV3)
    pub rsv: [bool; 3],
    /// Frame opcode
    pub opcode: Opcode,
    /// Indicates if the payload is masked on the wire
    pub masked: bool,
    /// Masking key. Outgoing frames leave this unset and get a fresh random
    /// key at encode time; decoded frames record the key they arrived with.
    pub mask: Option<[u8; 4]>,
    /// Unmasked payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a new final, unmasked frame with the given opcode and payload
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv: [false; 3],
            opcode,
            masked: false,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Create a continuation frame
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Continuation, payload)
    }

    /// Create a text frame
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, payload)
    }

    /// Create a binary frame
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    /// Create a ping frame
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    /// Create a pong frame
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Set the FIN bit
    pub fn fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Set reserved bits
    pub fn rsv(mut self, rsv1: bool, rsv2: bool, rsv3: bool) -> Self {
        self.rsv = [rsv1, rsv2, rsv3];
        self
    }

    /// Mark the frame as masked. The key itself is chosen by [`Frame::write_to`].
    pub fn masked(mut self, masked: bool) -> Self {
        self.masked = masked;
        if !masked {
            self.mask = None;
        }
        self
    }

    /// Payload length as carried in the header
    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Check if this is a control frame
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Check if this is a data frame
    pub fn is_data(&self) -> bool {
        self.opcode.is_data()
    }

    /// Check if any reserved bit is set
    pub fn has_reserved_bits(&self) -> bool {
        self.rsv.iter().any(|bit| *bit)
    }

    /// Number of bytes [`Frame::write_to`] will produce
    pub fn encoded_len(&self) -> usize {
        let payload_len = self.payload.len();
        let length_field = if payload_len < PAYLOAD_LEN_16 as usize {
            0
        } else if payload_len <= u16::MAX as usize {
            2
        } else {
            8
        };
        let mask_field = if self.masked { MASKING_KEY_LEN } else { 0 };
        2 + length_field + mask_field + payload_len
    }

    /// Serialize the frame to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Write the frame to a buffer, masking the payload if `masked` is set
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());

        let first_byte = ((self.fin as u8) << 7)
            | ((self.rsv[0] as u8) << 6)
            | ((self.rsv[1] as u8) << 5)
            | ((self.rsv[2] as u8) << 4)
            | self.opcode.value();
        buf.put_u8(first_byte);

        let payload_len = self.payload.len();
        let mask_bit = if self.masked { MASK_BIT } else { 0 };

        if payload_len < PAYLOAD_LEN_16 as usize {
            buf.put_u8(mask_bit | payload_len as u8);
        } else if payload_len <= u16::MAX as usize {
            buf.put_u8(mask_bit | PAYLOAD_LEN_16);
            buf.put_u16(payload_len as u16);
        } else {
            buf.put_u8(mask_bit | PAYLOAD_LEN_64);
            buf.put_u64(payload_len as u64);
        }

        if self.masked {
            let key = self.mask.unwrap_or_else(rand::random::<[u8; 4]>);
            buf.put_slice(&key);
            let start = buf.len();
            buf.put_slice(&self.payload);
            apply_mask(&mut buf[start..], key);
        } else {
            buf.put_slice(&self.payload);
        }
    }
}

/// XOR `data` in place with the masking key
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % MASKING_KEY_LEN];
    }
}

/// Incremental frame decoder
///
/// Bytes are fed in as they arrive; complete frames are returned once their
/// whole payload is buffered. Only wire-level rules are enforced here
/// (length encoding, control frame limits); reserved bits, masking from the
/// peer and opcode validity are left for the channel to judge.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_payload_len: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_LEN)
    }
}

impl FrameDecoder {
    /// Create a decoder that rejects payloads longer than `max_payload_len`
    pub fn new(max_payload_len: u64) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_payload_len,
        }
    }

    /// Append received bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Mutable access to the receive buffer, for reading straight into it
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Get the number of bytes currently buffered
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Decode every complete frame currently buffered
    pub fn decode_all(&mut self) -> Result<Vec<Frame>, StreamError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Decode one frame, or `Ok(None)` if more bytes are needed
    pub fn decode(&mut self) -> Result<Option<Frame>, StreamError> {
        let Some(header) = self.parse_header()? else {
            return Ok(None);
        };

        let total = header.header_len + header.payload_len as usize;
        if self.buffer.len() < total {
            // Grow with the bytes that arrive, not with the declared length.
            self.buffer
                .reserve((total - self.buffer.len()).min(MAX_RESERVE_AHEAD));
            return Ok(None);
        }

        self.buffer.advance(header.header_len);
        let mut payload = self.buffer.split_to(header.payload_len as usize);
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin: header.fin,
            rsv: header.rsv,
            opcode: header.opcode,
            masked: header.mask.is_some(),
            mask: header.mask,
            payload: payload.freeze(),
        }))
    }

    fn parse_header(&self) -> Result<Option<Header>, StreamError> {
        let buf = &self.buffer[..];
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let second_byte = buf[1];
        let fin = first_byte & FIN_BIT != 0;
        let rsv = [
            first_byte & RSV1_BIT != 0,
            first_byte & RSV2_BIT != 0,
            first_byte & RSV3_BIT != 0,
        ];
        let opcode = Opcode::from_u8(first_byte);
        let masked = second_byte & MASK_BIT != 0;

        let mut cursor = &buf[2..];
        let payload_len = match second_byte & PAYLOAD_LEN_MASK {
            PAYLOAD_LEN_16 => {
                if cursor.len() < 2 {
                    return Ok(None);
                }
                let len = cursor.get_u16() as u64;
                if len < PAYLOAD_LEN_16 as u64 {
                    return Err(protocol_error("non-minimal 16-bit payload length"));
                }
                len
            }
            PAYLOAD_LEN_64 => {
                if cursor.len() < 8 {
                    return Ok(None);
                }
                let len = cursor.get_u64();
                if len >> 63 != 0 {
                    return Err(protocol_error("most significant bit of payload length set"));
                }
                if len <= u16::MAX as u64 {
                    return Err(protocol_error("non-minimal 64-bit payload length"));
                }
                len
            }
            len => len as u64,
        };

        if opcode.is_control() {
            if !fin {
                return Err(protocol_error("fragmented control frame"));
            }
            if payload_len > MAX_CONTROL_FRAME_PAYLOAD as u64 {
                return Err(protocol_error("control frame payload too large"));
            }
        }
        if payload_len > self.max_payload_len || payload_len > usize::MAX as u64 {
            return Err(protocol_error("frame payload too large"));
        }

        let mask = if masked {
            if cursor.len() < MASKING_KEY_LEN {
                return Ok(None);
            }
            let mut key = [0u8; 4];
            cursor.copy_to_slice(&mut key);
            Some(key)
        } else {
            None
        };

        Ok(Some(Header {
            fin,
            rsv,
            opcode,
            mask,
            payload_len,
            header_len: buf.len() - cursor.len(),
        }))
    }
}

struct Header {
    fin: bool,
    rsv: [bool; 3],
    opcode: Opcode,
    mask: Option<[u8; 4]>,
    payload_len: u64,
    header_len: usize,
}

fn protocol_error(detail: &str) -> StreamError {
    StreamError::Protocol(detail.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_frame_serialization() {
        let bytes = Frame::text("hello").to_bytes();

        assert_eq!(bytes[0], 0x81); // FIN=1, RSV=000, Opcode=0001
        assert_eq!(bytes[1], 0x05); // MASK=0, Length=5
        assert_eq!(&bytes[2..], b"hello");
    }

    #[test]
    fn test_masked_frame_uses_given_key() {
        let mut frame = Frame::text("hello").masked(true);
        frame.mask = Some([1, 2, 3, 4]);
        let bytes = frame.to_bytes();

        assert_eq!(bytes[1] & 0x80, 0x80);
        assert_eq!(bytes.len(), 2 + 4 + 5);
        assert_eq!(&bytes[2..6], &[1, 2, 3, 4]);
        assert_eq!(bytes[6], b'h' ^ 1);
        assert_eq!(bytes[10], b'o' ^ 1);
    }

    #[test]
    fn test_large_frame_length_encoding() {
        let frame = Frame::binary(vec![0u8; 65536]);
        let bytes = frame.to_bytes();

        assert_eq!(bytes[1], 127);
        assert_eq!(bytes[2..10], (65536u64).to_be_bytes());
        assert_eq!(bytes.len(), frame.encoded_len());
    }

    #[test]
    fn test_decoder_handles_partial_input() {
        let mut decoder = FrameDecoder::default();
        let first = Frame::text("frame1").to_bytes();
        let second = Frame::ping("ping").to_bytes();

        decoder.feed(&first[..5]);
        assert!(decoder.decode().unwrap().is_none());

        decoder.feed(&first[5..]);
        decoder.feed(&second);
        let frames = decoder.decode_all().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, "frame1");
        assert_eq!(frames[1].opcode, Opcode::Ping);
        assert_eq!(decoder.buffered_bytes(), 0);
    }

    #[test]
    fn test_decoder_unmasks_and_keeps_flag() {
        let mut decoder = FrameDecoder::default();
        decoder.feed(&Frame::binary("abc").masked(true).to_bytes());

        let frame = decoder.decode().unwrap().unwrap();
        assert!(frame.masked);
        assert_eq!(frame.payload, "abc");
    }

    #[test]
    fn test_decoder_keeps_reserved_bits_and_unknown_opcodes() {
        let mut decoder = FrameDecoder::default();
        decoder.feed(&[0xC3, 0x00]);

        let frame = decoder.decode().unwrap().unwrap();
        assert!(frame.has_reserved_bits());
        assert_eq!(frame.opcode, Opcode::Unknown(3));
    }

    #[test]
    fn test_decoder_rejects_fragmented_control_frame() {
        let mut decoder = FrameDecoder::default();
        decoder.feed(&[0x09, 0x00]);
        assert!(matches!(decoder.decode(), Err(StreamError::Protocol(_))));
    }

    #[test]
    fn test_decoder_rejects_non_minimal_length() {
        let mut decoder = FrameDecoder::default();
        decoder.feed(&[0x82, 126, 0x00, 0x05]);
        assert!(matches!(decoder.decode(), Err(StreamError::Protocol(_))));
    }

    #[test]
    fn test_decoder_enforces_payload_limit() {
        let mut decoder = FrameDecoder::new(4);
        decoder.feed(&Frame::binary("too long").to_bytes());
        assert!(matches!(decoder.decode(), Err(StreamError::Protocol(_))));
    }

    #[test]
    fn test_default_decoder_rejects_huge_declared_length() {
        let mut decoder = FrameDecoder::default();
        decoder.feed(&[0x82, 127, 0x40, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(decoder.decode(), Err(StreamError::Protocol(_))));
    }

    #[test]
    fn test_decoder_does_not_reserve_declared_length_up_front() {
        let mut decoder = FrameDecoder::new(u64::MAX);
        decoder.feed(&[0x82, 127, 0x40, 0, 0, 0, 0, 0, 0, 0]);

        assert!(decoder.decode().unwrap().is_none());
        assert!(decoder.buffer_mut().capacity() <= 2 * MAX_RESERVE_AHEAD);
    }
}
