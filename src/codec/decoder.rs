use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{FrameHeader, OpCode, MAX_CONTROL_PAYLOAD},
    WebSocketError,
};

/// The first two header bytes, kept while the rest of the header is still in flight.
struct Partial {
    fin: bool,
    masked: bool,
    opcode: OpCode,
    /// Size of the extended length field: 0, 2 or 8 bytes.
    extra: usize,
    length_code: u8,
}

impl Partial {
    /// Remaining header bytes after the first two.
    fn remaining(&self) -> usize {
        self.extra + self.masked as usize * 4
    }
}

/// Incremental decoder for frame headers.
///
/// Only the header is consumed from the source buffer; the payload bytes stay in
/// place so the server codec can stream them out in receive-buffer sized chunks.
///
/// Frames with any RSV bit set are rejected since no extension is ever negotiated.
#[derive(Default)]
pub(crate) struct HeaderDecoder {
    state: Option<Partial>,
}

impl codec::Decoder for HeaderDecoder {
    type Item = FrameHeader;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    if src[0] & 0b0111_0000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;
                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    src.advance(2);

                    self.state = Some(Partial {
                        fin,
                        masked,
                        opcode,
                        extra,
                        length_code,
                    });
                }
                Some(partial) => {
                    if src.remaining() < partial.remaining() {
                        self.state = Some(partial);
                        return Ok(None);
                    }

                    let payload_len = match partial.extra {
                        0 => usize::from(partial.length_code),
                        2 => src.get_u16() as usize,
                        _ => {
                            let len = src.get_u64();
                            // the most significant bit must be 0
                            if len >> 63 != 0 {
                                return Err(WebSocketError::FrameTooLarge);
                            }
                            usize::try_from(len).map_err(|_| WebSocketError::FrameTooLarge)?
                        }
                    };

                    let mask = if partial.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if partial.opcode.is_control() {
                        if !partial.fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if payload_len > MAX_CONTROL_PAYLOAD {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }

                    break Ok(Some(FrameHeader {
                        fin: partial.fin,
                        opcode: partial.opcode,
                        mask,
                        payload_len,
                    }));
                }
            }
        }
    }
}
