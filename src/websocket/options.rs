use std::time::Duration;

use crate::{buffer::CodecSettings, Result, WebSocketError};

/// Default size of the receive and send buffers: 16 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Default keep-alive interval.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration options for a WebSocket connection.
///
/// `Options` sets the geometry of the connection's buffer region, the keep-alive
/// heartbeat and the protocol checks applied by the built-in codec.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use wsbase::Options;
///
/// let options = Options::default()
///     .with_receive_buffer_size(4096)
///     .with_keep_alive_interval(Duration::from_secs(10))
///     .with_sub_protocol("chat");
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Size of the receive buffer, and the largest chunk of a message a single receive
    /// can return.
    ///
    /// Must be between [`crate::MIN_RECEIVE_BUFFER_SIZE`] and [`crate::MAX_BUFFER_SIZE`].
    ///
    /// Default: 16 KiB
    pub receive_buffer_size: usize,

    /// Size of the send buffer, used for outgoing frame headers.
    ///
    /// Must be between [`crate::MIN_SEND_BUFFER_SIZE`] and [`crate::MAX_BUFFER_SIZE`].
    ///
    /// Default: 16 KiB
    pub send_buffer_size: usize,

    /// Interval of the keep-alive heartbeat.
    ///
    /// When the connection was idle for this long in both directions, an unsolicited pong is
    /// sent. `None` (or a zero duration) disables the heartbeat.
    ///
    /// Default: 30 seconds
    pub keep_alive_interval: Option<Duration>,

    /// Sub-protocol negotiated during the upgrade, reported back by [`crate::WebSocket::sub_protocol`].
    pub sub_protocol: Option<String>,

    /// Accept unmasked client frames.
    ///
    /// Default: `false`
    pub disable_masking: bool,

    /// Flag to determine whether incoming text messages should be validated for UTF-8
    /// encoding. A validation failure aborts the connection. Close reasons are always validated.
    ///
    /// Default: `true`
    pub check_utf8: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            receive_buffer_size: DEFAULT_BUFFER_SIZE,
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            keep_alive_interval: Some(DEFAULT_KEEP_ALIVE_INTERVAL),
            sub_protocol: None,
            disable_masking: false,
            check_utf8: true,
        }
    }
}

impl Options {
    /// Sets the receive buffer size.
    pub fn with_receive_buffer_size(self, size: usize) -> Self {
        Self {
            receive_buffer_size: size,
            ..self
        }
    }

    /// Sets the send buffer size.
    pub fn with_send_buffer_size(self, size: usize) -> Self {
        Self {
            send_buffer_size: size,
            ..self
        }
    }

    /// Sets the keep-alive interval.
    pub fn with_keep_alive_interval(self, interval: Duration) -> Self {
        Self {
            keep_alive_interval: Some(interval),
            ..self
        }
    }

    /// Disables the keep-alive heartbeat.
    pub fn without_keep_alive(self) -> Self {
        Self {
            keep_alive_interval: None,
            ..self
        }
    }

    /// Records the negotiated sub-protocol.
    pub fn with_sub_protocol(self, sub_protocol: impl Into<String>) -> Self {
        Self {
            sub_protocol: Some(sub_protocol.into()),
            ..self
        }
    }

    /// Accepts unmasked frames from the client.
    ///
    /// RFC 6455 requires clients to mask every frame. Only use this behind a trusted proxy
    /// that strips masking.
    pub fn without_masking(self) -> Self {
        Self {
            disable_masking: true,
            ..self
        }
    }

    /// Disables UTF-8 validation of text messages. Close reasons are still validated.
    pub fn without_utf8(self) -> Self {
        Self {
            check_utf8: false,
            ..self
        }
    }

    /// The keep-alive interval, with a zero interval meaning disabled.
    pub(crate) fn effective_keep_alive(&self) -> Option<Duration> {
        self.keep_alive_interval.filter(|interval| !interval.is_zero())
    }

    pub(crate) fn codec_settings(&self) -> CodecSettings {
        CodecSettings {
            disable_masking: self.disable_masking,
            check_utf8: self.check_utf8,
            keep_alive_ms: self
                .effective_keep_alive()
                .map_or(0, |interval| u32::try_from(interval.as_millis()).unwrap_or(u32::MAX)),
        }
    }

    /// Checks the values that are not checked by the buffer allocation.
    pub(crate) fn validate(&self) -> Result<()> {
        match &self.sub_protocol {
            Some(sub_protocol) if !is_token(sub_protocol) => {
                Err(WebSocketError::InvalidSubProtocol(sub_protocol.clone()))
            }
            _ => Ok(()),
        }
    }
}

/// RFC 7230 token: one or more visible ASCII characters, none of them a separator.
fn is_token(value: &str) -> bool {
    const SEPARATORS: &[u8] = b"()<>@,;:\\\"/[]?={} \t";
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_graphic() && !SEPARATORS.contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.receive_buffer_size, 16 * 1024);
        assert_eq!(options.send_buffer_size, 16 * 1024);
        assert_eq!(options.keep_alive_interval, Some(Duration::from_secs(30)));
        assert!(options.check_utf8);
        assert!(!options.disable_masking);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_keep_alive_settings() {
        let options = Options::default().with_keep_alive_interval(Duration::from_millis(1500));
        assert_eq!(options.codec_settings().keep_alive_ms, 1500);

        let options = Options::default().with_keep_alive_interval(Duration::ZERO);
        assert_eq!(options.effective_keep_alive(), None);
        assert_eq!(options.codec_settings().keep_alive_ms, 0);

        assert_eq!(Options::default().without_keep_alive().effective_keep_alive(), None);
    }

    #[test]
    fn test_sub_protocol_token() {
        assert!(Options::default().with_sub_protocol("chat.v2").validate().is_ok());
        for bad in ["", "two words", "a,b", "semi;colon", "é"] {
            assert!(
                matches!(
                    Options::default().with_sub_protocol(bad).validate(),
                    Err(WebSocketError::InvalidSubProtocol(_))
                ),
                "{bad:?} accepted"
            );
        }
    }
}
