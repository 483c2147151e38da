//! # Shared buffer region
//!
//! Every connection owns one heap region allocated at construction and never
//! moved or resized until cleanup. It is sliced into three segments:
//!
//! ```text
//! [ native workspace: receive + send + overhead ][ overflow: receive ][ descriptors ]
//! ```
//!
//! - the native workspace is handed to the codec on every call;
//! - the overflow segment holds the tail of a received chunk that did not fit the
//!   caller's buffer, drained by later receives before the codec is asked again;
//! - the descriptor segment holds the setup properties, written once.
//!
//! Codec buffers are addresses. They are only ever turned back into slices through
//! the bounds checks here, so a codec reporting a range outside the native
//! workspace (or outside the send payload pinned for the current send) surfaces as
//! a [`WebSocketError::BufferContractViolation`] instead of a stray access.
use std::ops::Range;

use bytes::Bytes;

use crate::{
    close::CloseCode,
    codec::{Action, CodecBuffer, Property, PropertyType},
    websocket::{MessageType, ReceiveResult},
    Result, WebSocketError,
};

/// Smallest accepted receive buffer.
pub const MIN_RECEIVE_BUFFER_SIZE: usize = 256;
/// Smallest accepted send buffer.
pub const MIN_SEND_BUFFER_SIZE: usize = 16;
/// Largest accepted receive or send buffer.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Native workspace bytes beyond the receive and send areas, used by the codec for control frames.
pub(crate) const NATIVE_OVERHEAD: usize = 256;

/// One descriptor record: property type, then two little endian u64 values.
const PROPERTY_RECORD: usize = 4 + 8 + 8;
const PROPERTY_SLOTS: usize = 6;
const PROPERTY_AREA: usize = PROPERTY_RECORD * PROPERTY_SLOTS;

/// Settings written into the descriptor segment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CodecSettings {
    pub disable_masking: bool,
    pub check_utf8: bool,
    pub keep_alive_ms: u32,
}

/// Tail of a received chunk parked in the overflow segment.
#[derive(Debug)]
struct BufferedPayload {
    offset: usize,
    remaining: usize,
    message_type: MessageType,
    end_of_message: bool,
}

pub(crate) struct WebSocketBuffer {
    region: Box<[u8]>,
    receive_buffer_size: usize,
    send_buffer_size: usize,
    native_len: usize,
    pinned: Option<Bytes>,
    buffered: Option<BufferedPayload>,
    described: bool,
    disposed: bool,
}

fn check_size(name: &'static str, size: usize, min: usize) -> Result<()> {
    if !(min..=MAX_BUFFER_SIZE).contains(&size) {
        return Err(WebSocketError::BufferSizeOutOfRange {
            name,
            size,
            min,
            max: MAX_BUFFER_SIZE,
        });
    }
    Ok(())
}

impl WebSocketBuffer {
    /// Allocates the region for the given receive and send buffer sizes.
    pub fn new(receive_buffer_size: usize, send_buffer_size: usize) -> Result<Self> {
        check_size("receive_buffer_size", receive_buffer_size, MIN_RECEIVE_BUFFER_SIZE)?;
        check_size("send_buffer_size", send_buffer_size, MIN_SEND_BUFFER_SIZE)?;

        let native_len = receive_buffer_size + send_buffer_size + NATIVE_OVERHEAD;
        let total = native_len + receive_buffer_size + PROPERTY_AREA;

        Ok(Self {
            region: vec![0u8; total].into_boxed_slice(),
            receive_buffer_size,
            send_buffer_size,
            native_len,
            pinned: None,
            buffered: None,
            described: false,
            disposed: false,
        })
    }

    fn base(&self) -> usize {
        self.region.as_ptr() as usize
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.disposed {
            return Err(WebSocketError::Disposed);
        }
        Ok(())
    }

    /// The native workspace handed to the codec.
    pub fn native_mut(&mut self) -> &mut [u8] {
        &mut self.region[..self.native_len]
    }

    pub fn native(&self, range: Range<usize>) -> &[u8] {
        &self.region[..self.native_len][range]
    }

    /// Copies `data` into the native workspace at `range`.
    pub fn write_native(&mut self, range: Range<usize>, data: &[u8]) {
        self.region[..self.native_len][range].copy_from_slice(data);
    }

    /// Writes the geometry and codec settings into the descriptor segment and
    /// returns them as read back from there. Can only be called once.
    pub fn describe_for_codec(&mut self, settings: CodecSettings) -> Result<Vec<Property>> {
        self.ensure_alive()?;
        if self.described {
            return Err(WebSocketError::InvalidAction("codec properties already described"));
        }
        self.described = true;

        let records: [(PropertyType, u64, u64); PROPERTY_SLOTS] = [
            (PropertyType::ReceiveBufferSize, self.receive_buffer_size as u64, 0),
            (PropertyType::SendBufferSize, self.send_buffer_size as u64, 0),
            (PropertyType::DisableMasking, settings.disable_masking as u64, 0),
            (
                PropertyType::AllocatedBuffer,
                self.base() as u64,
                self.native_len as u64,
            ),
            (PropertyType::DisableUtf8Verification, !settings.check_utf8 as u64, 0),
            (PropertyType::KeepAliveInterval, u64::from(settings.keep_alive_ms), 0),
        ];

        let start = self.native_len + self.receive_buffer_size;
        let area = &mut self.region[start..start + PROPERTY_AREA];
        for (record, (kind, first, second)) in area.chunks_exact_mut(PROPERTY_RECORD).zip(records) {
            record[..4].copy_from_slice(&(kind as u32).to_le_bytes());
            record[4..12].copy_from_slice(&first.to_le_bytes());
            record[12..20].copy_from_slice(&second.to_le_bytes());
        }

        self.region[start..start + PROPERTY_AREA]
            .chunks_exact(PROPERTY_RECORD)
            .map(read_property)
            .collect()
    }

    /// Pins the payload of the one outstanding send and returns its descriptor.
    pub fn pin_send_payload(&mut self, payload: Bytes) -> Result<CodecBuffer> {
        self.ensure_alive()?;
        if self.pinned.is_some() {
            return Err(WebSocketError::PayloadAlreadyPinned);
        }
        let buffer = CodecBuffer::data(payload.as_ptr() as usize, payload.len());
        self.pinned = Some(payload);
        Ok(buffer)
    }

    pub fn release_pinned_send_payload(&mut self) {
        self.pinned = None;
    }

    fn native_range(&self, buffer: &CodecBuffer) -> Option<Range<usize>> {
        let offset = buffer.address().checked_sub(self.base())?;
        let end = offset.checked_add(buffer.len())?;
        (end <= self.native_len).then_some(offset..end)
    }

    fn pinned_range(&self, buffer: &CodecBuffer) -> Option<Range<usize>> {
        let pinned = self.pinned.as_ref()?;
        let offset = buffer.address().checked_sub(pinned.as_ptr() as usize)?;
        let end = offset.checked_add(buffer.len())?;
        (end <= pinned.len()).then_some(offset..end)
    }

    fn violation(buffer: &CodecBuffer) -> WebSocketError {
        WebSocketError::BufferContractViolation {
            address: buffer.address(),
            length: buffer.len(),
        }
    }

    /// Checks every buffer of a codec answer. Only writes may point into the pinned payload.
    pub fn validate_native_buffers(&self, action: Action, buffers: &[CodecBuffer]) -> Result<()> {
        self.ensure_alive()?;
        for buffer in buffers {
            let contained = self.native_range(buffer).is_some()
                || (action == Action::SendToNetwork && self.pinned_range(buffer).is_some());
            if !contained {
                return Err(Self::violation(buffer));
            }
        }
        Ok(())
    }

    /// Translates a codec buffer into a range of the native workspace.
    pub fn convert_native_buffer(&self, buffer: &CodecBuffer) -> Result<Range<usize>> {
        self.ensure_alive()?;
        self.native_range(buffer).ok_or_else(|| Self::violation(buffer))
    }

    /// Translates a codec buffer into a slice of the pinned send payload.
    pub fn convert_pinned_send_payload(&self, buffer: &CodecBuffer) -> Result<Bytes> {
        self.ensure_alive()?;
        match (self.pinned.as_ref(), self.pinned_range(buffer)) {
            (Some(pinned), Some(range)) => Ok(pinned.slice(range)),
            _ => Err(Self::violation(buffer)),
        }
    }

    /// Reads the status and reason of a close buffer reported by the codec.
    pub fn convert_close_buffer(&self, buffer: &CodecBuffer) -> Result<(CloseCode, Option<String>)> {
        let CodecBuffer::Close { status, .. } = *buffer else {
            return Err(WebSocketError::InvalidAction("close indicated without a close buffer"));
        };
        let range = self.convert_native_buffer(buffer)?;
        let reason = std::str::from_utf8(self.native(range)).map_err(|_| WebSocketError::InvalidUTF8)?;
        let reason = (!reason.is_empty()).then(|| reason.to_owned());
        Ok((CloseCode::from(status), reason))
    }

    pub fn has_buffered_payload(&self) -> bool {
        self.buffered.is_some()
    }

    /// Parks `payload[consumed..]` in the overflow segment.
    pub fn buffer_payload(
        &mut self,
        payload: Range<usize>,
        consumed: usize,
        message_type: MessageType,
        end_of_message: bool,
    ) -> Result<()> {
        self.ensure_alive()?;
        let start = payload.start + consumed;
        let remaining = payload.end.saturating_sub(start);
        if payload.end > self.native_len || remaining > self.receive_buffer_size {
            return Err(WebSocketError::InvalidAction("payload exceeds overflow capacity"));
        }

        self.region.copy_within(start..payload.end, self.native_len);
        self.buffered = Some(BufferedPayload {
            offset: 0,
            remaining,
            message_type,
            end_of_message,
        });
        Ok(())
    }

    /// Copies as much of the parked payload as fits into `dest`. The flag tells
    /// whether anything remains afterwards.
    pub fn receive_from_buffered_payload(&mut self, dest: &mut [u8]) -> Result<(ReceiveResult, bool)> {
        self.ensure_alive()?;
        let Some(mut state) = self.buffered.take() else {
            return Err(WebSocketError::InvalidAction("no buffered payload"));
        };

        let count = dest.len().min(state.remaining);
        let start = self.native_len + state.offset;
        dest[..count].copy_from_slice(&self.region[start..start + count]);
        state.offset += count;
        state.remaining -= count;

        if state.offset + state.remaining > self.receive_buffer_size {
            return Err(WebSocketError::InvalidAction("buffered payload out of bounds"));
        }

        let more = state.remaining > 0;
        let result = ReceiveResult::new(
            count,
            state.message_type,
            !more && state.end_of_message,
        );
        if more {
            self.buffered = Some(state);
        }
        Ok((result, more))
    }

    /// Frees the region and drops any pinned payload. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.pinned = None;
        self.buffered = None;
        self.region = Box::default();
    }
}

fn read_property(record: &[u8]) -> Result<Property> {
    let kind = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
    let mut first = [0u8; 8];
    first.copy_from_slice(&record[4..12]);
    let mut second = [0u8; 8];
    second.copy_from_slice(&record[12..20]);
    let first = u64::from_le_bytes(first);
    let second = u64::from_le_bytes(second);

    Ok(match PropertyType::try_from(kind)? {
        PropertyType::ReceiveBufferSize => Property::ReceiveBufferSize(first as u32),
        PropertyType::SendBufferSize => Property::SendBufferSize(first as u32),
        PropertyType::DisableMasking => Property::DisableMasking(first != 0),
        PropertyType::AllocatedBuffer => Property::AllocatedBuffer {
            address: first as usize,
            length: second as usize,
        },
        PropertyType::DisableUtf8Verification => Property::DisableUtf8Verification(first != 0),
        PropertyType::KeepAliveInterval => Property::KeepAliveInterval(first as u32),
    })
}
