//! Extraction of back-to-back JSON values from a growing text buffer.

use serde_json::{Deserializer, Value};
use thiserror::Error;
use tracing::trace;

/// Text that can never become a valid JSON value, however many more bytes
/// arrive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed message at line {line}, column {column}: {message}")]
pub struct MessageError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Values completed by one call to [`MessageDecoder::decode`].
#[derive(Debug, Default)]
pub struct Decoded {
    /// Complete values, in arrival order.
    pub values: Vec<Value>,
    /// Set when the buffer holds text that is not JSON.
    pub malformed: Option<MessageError>,
}

/// Splits concatenated JSON values. Whitespace between values, including
/// the keep-alive newlines the stream server sends, is skipped.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: String,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text received but not yet part of a complete value.
    pub fn buffered(&self) -> &str {
        &self.buf
    }

    /// Append `text` and pull out every complete value.
    ///
    /// A partial value at the end of the buffer is left untouched for the
    /// next call.
    pub fn decode(&mut self, text: &str) -> Decoded {
        self.buf.push_str(text);
        let mut decoded = Decoded::default();

        loop {
            let start = self.buf.len() - self.buf.trim_start().len();
            if start == self.buf.len() {
                if !self.buf.is_empty() {
                    trace!(len = self.buf.len(), "dropping keep-alive whitespace");
                    self.buf.clear();
                }
                break;
            }

            let (next, offset) = {
                let mut values = Deserializer::from_str(&self.buf[start..]).into_iter::<Value>();
                let next = values.next();
                (next, values.byte_offset())
            };

            match next {
                Some(Ok(value)) => {
                    self.buf.drain(..start + offset);
                    decoded.values.push(value);
                }
                Some(Err(err)) if err.is_eof() => break,
                Some(Err(err)) => {
                    decoded.malformed = Some(MessageError {
                        line: err.line(),
                        column: err.column(),
                        message: err.to_string(),
                    });
                    break;
                }
                None => {
                    self.buf.clear();
                    break;
                }
            }
        }

        decoded
    }
}
