//! # Frame
//!
//! Frame-level primitives used by the built-in server codec: the opcode space and
//! the frame header described in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |   Masking-key, if MASK set    |          Payload Data         |
//! +-------------------------------+-------------------------------+
//! ```
//!
//! The engine itself never frames anything; only codecs do. Payload bytes are not
//! part of [`FrameHeader`]: the server codec streams them separately so that a
//! large frame never has to be held in memory at once.
use crate::WebSocketError;

/// Largest possible frame header: 2 fixed bytes, 8 bytes of extended length and a 4-byte mask.
pub const MAX_HEAD_SIZE: usize = 14;

/// Control frames (close, ping, pong) carry at most 125 bytes of payload.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket operation code of a frame.
///
/// The numeric values are the ones defined in
/// [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when parsing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames cannot be fragmented and their payload must not exceed
    /// [`MAX_CONTROL_PAYLOAD`] bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Decoded (or to be encoded) frame header, without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment of a message.
    pub fin: bool,
    pub opcode: OpCode,
    /// Masking key, present on every client-to-server frame.
    pub mask: Option<[u8; 4]>,
    /// Length of the payload that follows the header.
    pub payload_len: usize,
}

impl FrameHeader {
    /// Header of an unmasked server-to-client frame.
    pub fn new(fin: bool, opcode: OpCode, payload_len: usize) -> Self {
        Self {
            fin,
            opcode,
            mask: None,
            payload_len,
        }
    }

    /// Number of bytes [`FrameHeader::format`] writes for this header.
    pub fn encoded_len(&self) -> usize {
        let size = match self.payload_len {
            0..=125 => 2,
            126..=65535 => 4,
            _ => 10,
        };
        size + self.mask.map_or(0, |_| 4)
    }

    /// Writes the header into `head` and returns how many bytes were used.
    ///
    /// `head` must be at least [`FrameHeader::encoded_len`] bytes long;
    /// [`MAX_HEAD_SIZE`] always suffices.
    pub fn format(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | u8::from(self.opcode);

        let len = self.payload_len;
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        match self.mask {
            Some(mask) => {
                head[1] |= 0x80;
                head[size..size + 4].copy_from_slice(&mask);
                size + 4
            }
            None => size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod opcode_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());

            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
        }

        #[test]
        fn test_reserved_opcodes_are_rejected() {
            for byte in (0x3..=0x7).chain(0xB..=0xF) {
                assert!(matches!(
                    OpCode::try_from(byte),
                    Err(WebSocketError::InvalidOpCode(b)) if b == byte
                ));
            }
        }

        #[test]
        fn test_byte_values() {
            assert_eq!(u8::from(OpCode::Text), 0x1);
            assert_eq!(u8::from(OpCode::Close), 0x8);
            assert_eq!(OpCode::try_from(0xA).unwrap(), OpCode::Pong);
        }
    }

    mod header_tests {
        use super::*;

        #[test]
        fn test_short_header() {
            let header = FrameHeader::new(true, OpCode::Binary, 3);
            let mut head = [0u8; MAX_HEAD_SIZE];
            let n = header.format(&mut head);
            assert_eq!(n, 2);
            assert_eq!(n, header.encoded_len());
            assert_eq!(&head[..n], &[0x82, 0x03]);
        }

        #[test]
        fn test_fragment_has_no_fin() {
            let header = FrameHeader::new(false, OpCode::Text, 0);
            let mut head = [0u8; MAX_HEAD_SIZE];
            header.format(&mut head);
            assert_eq!(head[0], 0x01);
        }

        #[test]
        fn test_extended_16bit_length() {
            let header = FrameHeader::new(true, OpCode::Text, 300);
            let mut head = [0u8; MAX_HEAD_SIZE];
            let n = header.format(&mut head);
            assert_eq!(n, 4);
            assert_eq!(&head[..n], &[0x81, 126, 0x01, 0x2C]);
        }

        #[test]
        fn test_extended_64bit_length() {
            let header = FrameHeader::new(true, OpCode::Binary, 70_000);
            let mut head = [0u8; MAX_HEAD_SIZE];
            let n = header.format(&mut head);
            assert_eq!(n, 10);
            assert_eq!(head[1], 127);
            assert_eq!(u64::from_be_bytes(head[2..10].try_into().unwrap()), 70_000);
        }

        #[test]
        fn test_masked_header() {
            let header = FrameHeader {
                fin: true,
                opcode: OpCode::Ping,
                mask: Some([1, 2, 3, 4]),
                payload_len: 5,
            };
            let mut head = [0u8; MAX_HEAD_SIZE];
            let n = header.format(&mut head);
            assert_eq!(n, 6);
            assert_eq!(n, header.encoded_len());
            assert_eq!(&head[..n], &[0x89, 0x85, 1, 2, 3, 4]);
        }
    }
}
