//! # Close
//!
//! Status codes carried by WebSocket close frames, as defined in
//! [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4),
//! together with the validation applied to locally supplied close statuses.
//!
//! A close frame body is either empty or starts with a 2-byte big-endian status
//! code followed by an optional UTF-8 reason. Because control frames are limited
//! to 125 bytes of payload, the reason can be at most [`MAX_CLOSE_REASON_LEN`]
//! bytes long.
use crate::{frame::MAX_CONTROL_PAYLOAD, Result, WebSocketError};

/// Maximum length, in bytes, of the UTF-8 reason attached to a close frame.
pub const MAX_CLOSE_REASON_LEN: usize = MAX_CONTROL_PAYLOAD - 2;

/// Status code used in close frames.
///
/// `Empty` (1005) is never written on the wire: it stands for "no status" and
/// closing with it produces a close frame without a body. Conversely a
/// received close frame without a body is reported as `Empty`.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseCode {
    /// 1000: the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001: an endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002: the peer violated the protocol.
    Protocol,
    /// 1003: the peer sent a kind of data this endpoint cannot accept.
    Unsupported,
    /// 1005: no status code was present.
    Empty,
    /// 1006: the connection was closed abnormally, without a close frame.
    Abnormal,
    /// 1007: a message contained data inconsistent with its type (e.g. non UTF-8 text).
    Invalid,
    /// 1008: a message violated the endpoint's policy.
    Policy,
    /// 1009: a message was too big to process.
    Size,
    /// 1010: the client expected an extension the server didn't negotiate.
    Extension,
    /// 1011: the server hit an unexpected condition.
    Error,
    /// 1012: the service is restarting.
    Restart,
    /// 1013: the service is overloaded, try again later.
    Again,
    /// 1015: TLS handshake failure. Reserved, never sent in a frame.
    Tls,
    /// Codes in 1016..=2999 not assigned by the RFC.
    Reserved(u16),
    /// 3000..=3999: registered with IANA for libraries and frameworks.
    Iana(u16),
    /// 4000..=4999: private use by applications.
    Library(u16),
    /// Anything outside the ranges above.
    Bad(u16),
}

impl CloseCode {
    /// Returns `true` if this code may appear in a close frame sent over the wire.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            CloseCode::Bad(_)
                | CloseCode::Reserved(_)
                | CloseCode::Empty
                | CloseCode::Abnormal
                | CloseCode::Tls
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Empty,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            1016..=2999 => CloseCode::Reserved(code),
            3000..=3999 => CloseCode::Iana(code),
            4000..=4999 => CloseCode::Library(code),
            _ => CloseCode::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Empty => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

/// Validates a locally supplied close status and reason.
///
/// `Empty` is accepted only without a reason, since a close frame without a
/// status cannot carry one. Every other code must be allowed on the wire and the
/// reason must fit in a control frame.
pub fn validate_close_status(code: CloseCode, reason: Option<&str>) -> Result<()> {
    let reason_len = reason.map_or(0, str::len);

    if code == CloseCode::Empty {
        if reason_len > 0 {
            return Err(WebSocketError::InvalidCloseStatus);
        }
        return Ok(());
    }

    if !code.is_allowed() {
        return Err(WebSocketError::InvalidCloseStatus);
    }

    if reason_len > MAX_CLOSE_REASON_LEN {
        return Err(WebSocketError::CloseReasonTooLong(reason_len));
    }

    Ok(())
}
