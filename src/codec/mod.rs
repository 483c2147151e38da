//! # Codec boundary
//!
//! The engine never frames, masks or parses anything itself. It drives a
//! [`ProtocolCodec`] through a pull-based loop: the engine asks for the next
//! [`Action`] on one of two [`ActionQueue`]s, performs the I/O the codec asked
//! for against the transport and the shared buffer region, and reports back how
//! many bytes were consumed with [`ProtocolCodec::complete_action`].
//!
//! Buffers crossing this boundary are described by [`CodecBuffer`], a plain
//! address/length pair. Addresses must point inside the native workspace handed to
//! the codec, or inside the send payload the engine pinned for the current send.
//! The engine checks every buffer a codec reports and treats anything else as a
//! contract violation.
//!
//! The numeric values of [`Action`], [`BufferType`], [`ActionQueue`] and
//! [`PropertyType`] are part of the boundary and stable.
//!
//! The crate ships with [`ServerCodec`], an RFC 6455 server codec. Other codecs
//! can be plugged in through [`crate::WebSocket::with_codec`].
mod decoder;
mod server;
mod utf8;

pub use server::ServerCodec;

pub(crate) use decoder::HeaderDecoder;
pub(crate) use utf8::Utf8Validator;

use crate::Result;

/// What the engine has to do next for a given queue.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// The codec has nothing more to do for the current request.
    NoAction = 0,
    /// Write the reported buffers to the transport.
    SendToNetwork = 1,
    /// A send completed; flush the transport.
    IndicateSendComplete = 2,
    /// Read from the transport into the reported buffer.
    ReceiveFromNetwork = 3,
    /// A frame (or a chunk of one) is available in the reported buffer.
    IndicateReceiveComplete = 4,
}

/// Which direction an action is pulled for.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionQueue {
    Send = 1,
    Receive = 2,
}

/// Kind of data carried by a buffer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    None = 0x0000_0000,
    Utf8Message = 0x8000_0000,
    Utf8Fragment = 0x8000_0001,
    BinaryMessage = 0x8000_0002,
    BinaryFragment = 0x8000_0003,
    Close = 0x8000_0004,
    PingPong = 0x8000_0005,
    UnsolicitedPong = 0x8000_0006,
}

impl BufferType {
    /// `true` for the pong variants the engine suppresses once a close frame was sent.
    pub fn is_control(self) -> bool {
        matches!(self, BufferType::PingPong | BufferType::UnsolicitedPong)
    }

    /// `true` for the buffer types that terminate a message.
    pub fn is_end_of_message(self) -> bool {
        !matches!(self, BufferType::Utf8Fragment | BufferType::BinaryFragment)
    }
}

/// Address/length description of a byte range, as exchanged with a codec.
///
/// The close variant mirrors a close frame body: the status code travels by value
/// and only the reason is a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecBuffer {
    Data {
        address: usize,
        length: usize,
    },
    Close {
        address: usize,
        length: usize,
        status: u16,
    },
}

impl CodecBuffer {
    pub fn data(address: usize, length: usize) -> Self {
        CodecBuffer::Data { address, length }
    }

    pub fn address(&self) -> usize {
        match *self {
            CodecBuffer::Data { address, .. } | CodecBuffer::Close { address, .. } => address,
        }
    }

    pub fn len(&self) -> usize {
        match *self {
            CodecBuffer::Data { length, .. } | CodecBuffer::Close { length, .. } => length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opaque token tying a [`ProtocolCodec::complete_action`] call to the action it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionContext(u64);

impl ActionContext {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// One answer to [`ProtocolCodec::get_action`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub action: Action,
    pub buffer_type: BufferType,
    pub buffers: Vec<CodecBuffer>,
    pub context: ActionContext,
}

impl ActionRequest {
    /// The "nothing to do" answer.
    pub fn none(context: ActionContext) -> Self {
        Self {
            action: Action::NoAction,
            buffer_type: BufferType::None,
            buffers: Vec::new(),
            context,
        }
    }
}

/// Identifier of a setup property.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    ReceiveBufferSize = 0,
    SendBufferSize = 1,
    DisableMasking = 2,
    AllocatedBuffer = 3,
    DisableUtf8Verification = 4,
    KeepAliveInterval = 5,
}

impl TryFrom<u32> for PropertyType {
    type Error = crate::WebSocketError;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::ReceiveBufferSize,
            1 => Self::SendBufferSize,
            2 => Self::DisableMasking,
            3 => Self::AllocatedBuffer,
            4 => Self::DisableUtf8Verification,
            5 => Self::KeepAliveInterval,
            _ => return Err(crate::WebSocketError::InvalidAction("unknown codec property")),
        })
    }
}

/// A setup value handed to the codec when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    ReceiveBufferSize(u32),
    SendBufferSize(u32),
    DisableMasking(bool),
    /// Base address and length of the native workspace.
    AllocatedBuffer { address: usize, length: usize },
    DisableUtf8Verification(bool),
    /// Keep-alive interval in milliseconds, 0 when disabled.
    KeepAliveInterval(u32),
}

impl Property {
    pub fn kind(&self) -> PropertyType {
        match self {
            Property::ReceiveBufferSize(_) => PropertyType::ReceiveBufferSize,
            Property::SendBufferSize(_) => PropertyType::SendBufferSize,
            Property::DisableMasking(_) => PropertyType::DisableMasking,
            Property::AllocatedBuffer { .. } => PropertyType::AllocatedBuffer,
            Property::DisableUtf8Verification(_) => PropertyType::DisableUtf8Verification,
            Property::KeepAliveInterval(_) => PropertyType::KeepAliveInterval,
        }
    }
}

/// A stateful protocol codec driven by the engine.
///
/// All calls for one connection are serialized by the engine's session lock, and
/// `workspace` is always the same native segment of the shared buffer region: the
/// one announced by [`Property::AllocatedBuffer`].
///
/// For every action other than [`Action::NoAction`] the engine calls
/// [`complete_action`](ProtocolCodec::complete_action) exactly once with the
/// request's context, even when servicing the action failed.
pub trait ProtocolCodec: Send {
    /// Returns the next action for `queue`, reporting at most `max_buffers` buffers.
    fn get_action(
        &mut self,
        queue: ActionQueue,
        workspace: &mut [u8],
        max_buffers: usize,
    ) -> Result<ActionRequest>;

    /// Completes the action identified by `context`. `bytes` is the number of bytes
    /// read from or written to the network, 0 for indications.
    fn complete_action(
        &mut self,
        context: ActionContext,
        workspace: &mut [u8],
        bytes: usize,
    ) -> Result<()>;

    /// Queues an outgoing frame whose payload is described by `buffer`.
    fn send(&mut self, buffer_type: BufferType, buffer: CodecBuffer) -> Result<()>;

    /// Queues an outgoing frame without a payload.
    fn send_without_body(&mut self, buffer_type: BufferType) -> Result<()>;

    /// Arms a receive request on the receive queue.
    fn receive(&mut self) -> Result<()>;

    /// Drops all pending work. Every later call may fail.
    fn abort(&mut self);
}
