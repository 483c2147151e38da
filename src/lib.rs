//! # wsbase
//! Server-side WebSocket protocol engine (RFC 6455) for connections that were already upgraded.
//!
//! The engine owns the connection lifecycle: the open/closing/closed state machine, the close
//! handshake, keep-alive heartbeats, cancellation and abort. Framing is delegated to a
//! pull-based [`codec::ProtocolCodec`] which the engine drives over any async byte stream.
//! A conforming server codec, [`codec::ServerCodec`], is built in.
//!
//! The HTTP upgrade handshake is not part of this crate. [`WebSocket::accept`] expects a stream
//! on which the handshake response has already been written.
//!
//! # Features
//! - `logging`: Enables debug logging of state transitions, close handshakes and keep-alives
//!   using the `log` crate.
//!
//! - `simd`: Validates UTF-8 text payloads with `simdutf8`.
//!
//! - `json`: Enables [`WebSocket::send_json`] to serialize JSON payloads.
//!
//! ## Usage Example
//! ```toml
//! [dependencies]
//! wsbase = { version = "0.1", features = ["logging"] }
//! ```
//!
//! # Echo Server Example
//! ```rust,no_run
//! use tokio::net::TcpStream;
//! use wsbase::{CancellationToken, CloseCode, MessageType, Options, WebSocket};
//!
//! async fn echo(stream: TcpStream) -> wsbase::Result<()> {
//!     let ws = WebSocket::accept(stream, Options::default()).await?;
//!     let token = CancellationToken::new();
//!     let mut buf = vec![0u8; 4096];
//!
//!     loop {
//!         let result = ws.receive(&mut buf, &token).await?;
//!         if result.message_type == MessageType::Close {
//!             ws.close(CloseCode::Normal, None, &token).await?;
//!             return Ok(());
//!         }
//!         ws.send(
//!             buf[..result.count].to_vec(),
//!             result.message_type,
//!             result.end_of_message,
//!             &token,
//!         )
//!         .await?;
//!     }
//! }
//! ```
//!
//! # Concurrency
//! A [`WebSocket`] is a cheap cloneable handle. One receive, one send and one close may be
//! outstanding at the same time, typically from different tasks. A second concurrent call of the
//! same kind fails with [`WebSocketError::AlreadyOneOutstandingOperation`].
//!
//! # Memory
//! Each connection allocates a single buffer region up front, sized by
//! [`Options::receive_buffer_size`] and [`Options::send_buffer_size`]. Send payloads are
//! referenced, never copied, while their frame is written.

#![cfg_attr(docsrs, feature(doc_cfg))]

mod buffer;
pub mod close;
pub mod codec;
pub mod frame;
mod mask;
mod stream;
mod websocket;

use thiserror::Error;

pub use buffer::{MAX_BUFFER_SIZE, MIN_RECEIVE_BUFFER_SIZE, MIN_SEND_BUFFER_SIZE};
pub use close::CloseCode;
pub use tokio_util::sync::CancellationToken;
pub use websocket::{MessageType, Options, ReceiveResult, WebSocket, WebSocketState};

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The errors fall into a few groups:
///
/// - API misuse (wrong state, concurrent calls of the same kind, invalid arguments)
/// - cancellation, either by the caller's token or by an abort of the connection
/// - protocol errors reported by the codec (invalid frames, invalid UTF-8, bad close frames)
/// - codec contract violations, which always abort the connection
/// - I/O errors from the underlying stream
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The operation is not valid in the current connection state. After an abort every
    /// operation fails with this error carrying [`WebSocketState::Aborted`].
    #[error("Invalid state: {0}")]
    InvalidState(WebSocketState),

    /// Another operation of the same kind is still outstanding.
    #[error("There is already one outstanding '{0}' call")]
    AlreadyOneOutstandingOperation(&'static str),

    /// A receive was started while `close` is waiting for the peer's close frame.
    #[error("Receive is not allowed while close is waiting for the peer")]
    ReceiveAfterClose,

    /// The connection handle was disposed.
    #[error("The WebSocket has been disposed")]
    Disposed,

    /// The message type cannot be used for the operation, or a close handshake received a
    /// data message where a close frame was expected.
    #[error("Invalid message type")]
    InvalidMessageType,

    /// A buffer size option is outside of its accepted range.
    #[error("{name} must be between {min} and {max}, got {size}")]
    BufferSizeOutOfRange {
        name: &'static str,
        size: usize,
        min: usize,
        max: usize,
    },

    /// The close status cannot be sent, or `Empty` was given together with a reason.
    #[error("Invalid close status")]
    InvalidCloseStatus,

    /// The UTF-8 encoded close reason is longer than 123 bytes.
    #[error("Close reason too long ({0} bytes)")]
    CloseReasonTooLong(usize),

    /// The sub-protocol is not a valid HTTP token.
    #[error("Invalid sub-protocol: {0:?}")]
    InvalidSubProtocol(String),

    /// The caller's cancellation token fired.
    #[error("The operation was canceled")]
    OperationCanceled,

    /// The peer closed the stream without completing the close handshake.
    #[error("The remote party closed the connection without completing the close handshake")]
    ConnectionClosedPrematurely,

    /// Occurs when receiving a WebSocket fragment that violates the protocol specification,
    /// such as receiving a new data frame before completing the previous message.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Indicates that a text frame or close frame reason contains invalid UTF-8 data.
    /// According to RFC 6455, all text payloads must be valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Indicates that a received close frame has an invalid format, such as
    /// containing a payload of 1 byte (close frames must be either empty or ≥2 bytes).
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// Occurs when a close frame contains a status code that is not valid according to
    /// RFC 6455 (e.g., using reserved codes or codes in invalid ranges).
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// Indicates that reserved bits in the WebSocket frame header are set. No extension
    /// is negotiated, so all of them must be 0.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Occurs when a control frame (ping, pong, or close) is received with the FIN bit
    /// not set. RFC 6455 requires that control frames must not be fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// Indicates that a received control frame exceeds the maximum allowed size of 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// Occurs when a received frame's payload length cannot be represented.
    #[error("Frame too large")]
    FrameTooLarge,

    /// Indicates receipt of a frame with an invalid opcode value.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A client frame arrived without a masking key.
    #[error("Client frames must be masked")]
    UnmaskedFrame,

    /// The codec returned something the engine cannot act on, or was called out of order.
    #[error("Invalid codec action: {0}")]
    InvalidAction(&'static str),

    /// The codec reported a buffer outside of the memory it may reference.
    #[error("Codec buffer outside of the shared region (address={address:#x}, length={length})")]
    BufferContractViolation { address: usize, length: usize },

    /// A send payload was pinned while another one is still pinned.
    #[error("A send payload is already pinned")]
    PayloadAlreadyPinned,

    /// A background task (keep-alive) failed. The connection was aborted and this error is
    /// reported once, by the next API call.
    #[error("The connection faulted in the background: {0}")]
    Faulted(#[source] Box<WebSocketError>),

    /// Wraps standard I/O errors that may occur during WebSocket communication,
    /// such as connection resets or network timeouts.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Occurs when serialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WebSocketError {
    /// `true` for [`WebSocketError::InvalidState`].
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, WebSocketError::InvalidState(_))
    }

    /// `true` when the caller's own token cancelled the operation. An operation cut short by
    /// an abort reports [`WebSocketError::InvalidState`] with [`WebSocketState::Aborted`] instead.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, WebSocketError::OperationCanceled)
    }

    /// `true` when a codec broke the buffer contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            WebSocketError::BufferContractViolation { .. } | WebSocketError::PayloadAlreadyPinned
        )
    }

    /// `true` for errors raised by the wire protocol or the stream beneath it.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            WebSocketError::ConnectionClosedPrematurely
                | WebSocketError::InvalidFragment
                | WebSocketError::InvalidContinuationFrame
                | WebSocketError::InvalidUTF8
                | WebSocketError::InvalidCloseFrame
                | WebSocketError::InvalidCloseCode
                | WebSocketError::ReservedBitsNotZero
                | WebSocketError::ControlFrameFragmented
                | WebSocketError::ControlFrameTooLarge
                | WebSocketError::FrameTooLarge
                | WebSocketError::InvalidOpCode(_)
                | WebSocketError::UnmaskedFrame
                | WebSocketError::IoError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_groups() {
        assert!(WebSocketError::InvalidState(WebSocketState::Aborted).is_invalid_state());
        assert!(WebSocketError::OperationCanceled.is_cancellation());
        assert!(!WebSocketError::InvalidState(WebSocketState::Aborted).is_cancellation());
        assert!(WebSocketError::BufferContractViolation {
            address: 0,
            length: 1
        }
        .is_contract_violation());
        assert!(WebSocketError::IoError(std::io::ErrorKind::BrokenPipe.into()).is_protocol_error());
        assert!(!WebSocketError::InvalidMessageType.is_protocol_error());
    }

    #[test]
    fn test_faulted_keeps_source() {
        use std::error::Error;

        let err = WebSocketError::Faulted(Box::new(WebSocketError::ConnectionClosedPrematurely));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("without completing the close handshake"));
    }
}
