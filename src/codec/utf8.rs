use crate::{Result, WebSocketError};

#[cfg(feature = "simd")]
use simdutf8::compat::from_utf8;
#[cfg(not(feature = "simd"))]
use std::str::from_utf8;

/// Validates a text message delivered in arbitrary chunks.
///
/// A chunk may end in the middle of a code point; up to 3 trailing bytes are
/// carried over and checked together with the next chunk.
#[derive(Default)]
pub(crate) struct Utf8Validator {
    carry: Vec<u8>,
}

impl Utf8Validator {
    /// Checks `chunk`. `last` marks the final chunk of the message, after which no
    /// incomplete sequence may remain.
    pub fn feed(&mut self, chunk: &[u8], last: bool) -> Result<()> {
        let mut chunk = chunk;

        // complete the sequence left over from the previous chunk first
        if !self.carry.is_empty() {
            let take = chunk.len().min(4 - self.carry.len());
            self.carry.extend_from_slice(&chunk[..take]);
            match from_utf8(&self.carry) {
                Ok(_) => {
                    chunk = &chunk[take..];
                    self.carry.clear();
                }
                Err(err) => {
                    if err.error_len().is_some() {
                        return Err(WebSocketError::InvalidUTF8);
                    }
                    let valid = err.valid_up_to();
                    if valid == 0 {
                        // still incomplete, which only happens when the chunk ran out
                        if last {
                            return Err(WebSocketError::InvalidUTF8);
                        }
                        return Ok(());
                    }
                    // the carried sequence completed within the first bytes of `chunk`
                    let used = valid - (self.carry.len() - take);
                    chunk = &chunk[used..];
                    self.carry.clear();
                }
            }
        }

        match from_utf8(chunk) {
            Ok(_) => Ok(()),
            Err(err) if err.error_len().is_none() && !last => {
                self.carry.extend_from_slice(&chunk[err.valid_up_to()..]);
                Ok(())
            }
            Err(_) => Err(WebSocketError::InvalidUTF8),
        }
    }

    pub fn reset(&mut self) {
        self.carry.clear();
    }
}
