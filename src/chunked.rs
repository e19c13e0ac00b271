//! Decoder for the stream server's chunked transfer-encoding.
//!
//! Frames are `<hex length>\r\n<payload>\r\n`, ended by a zero-length
//! frame. The streaming service does not flush the CRLF that closes chunk
//! *N* until chunk *N+1* begins, so the closing CRLF is consumed lazily at
//! the start of the next decode pass instead of together with its payload.
//! This is a quirk of that service and not general chunked framing.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tracing::trace;

const CRLF: &[u8] = b"\r\n";

/// Framing violation found while dechunking.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("invalid chunk size header: {0:?}")]
    InvalidSize(String),
}

/// Where the decoder stands after a call to [`ChunkDecoder::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Everything buffered has been consumed or is waiting on more bytes.
    NeedMore,
    /// A zero-length chunk was seen.
    EndOfStream,
    /// The chunk-size header could not be parsed.
    Invalid(ChunkError),
}

impl ChunkStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChunkStatus::NeedMore)
    }
}

/// Output of one decode pass.
#[derive(Debug, Clone)]
pub struct Dechunked {
    /// Payload of every chunk completed by this pass, concatenated in order.
    pub payload: Bytes,
    pub status: ChunkStatus,
}

/// Stateful dechunker. Feed it raw bytes as they arrive; it returns the
/// payload of every chunk that is complete so far.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    buf: BytesMut,
    awaiting_terminal_crlf: bool,
    finished: Option<ChunkStatus>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of raw bytes held back waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append `data` and drain every complete chunk now in the buffer.
    ///
    /// After a terminal status is returned the decoder is latched: later
    /// calls return the same status with an empty payload.
    pub fn decode(&mut self, data: &[u8]) -> Dechunked {
        if let Some(status) = &self.finished {
            return Dechunked {
                payload: Bytes::new(),
                status: status.clone(),
            };
        }

        self.buf.extend_from_slice(data);
        let mut payload = BytesMut::new();

        let status = loop {
            if self.awaiting_terminal_crlf {
                if self.buf.len() < CRLF.len() {
                    break ChunkStatus::NeedMore;
                }
                self.buf.advance(CRLF.len());
                self.awaiting_terminal_crlf = false;
            }

            let Some(header_end) = find_crlf(&self.buf) else {
                break ChunkStatus::NeedMore;
            };

            let size = match parse_size(&self.buf[..header_end]) {
                Ok(size) => size,
                Err(err) => break ChunkStatus::Invalid(err),
            };

            if size == 0 {
                break ChunkStatus::EndOfStream;
            }

            let data_start = header_end + CRLF.len();
            let complete = data_start
                .checked_add(size)
                .map_or(false, |data_end| self.buf.len() >= data_end);
            if !complete {
                break ChunkStatus::NeedMore;
            }

            self.buf.advance(data_start);
            payload.extend_from_slice(&self.buf.split_to(size));
            self.awaiting_terminal_crlf = true;
            trace!(size, "dechunked frame");
        };

        if status.is_terminal() {
            self.buf.clear();
            self.finished = Some(status.clone());
        }

        Dechunked {
            payload: payload.freeze(),
            status,
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF.len()).position(|w| w == CRLF)
}

fn parse_size(header: &[u8]) -> Result<usize, ChunkError> {
    let invalid = || ChunkError::InvalidSize(String::from_utf8_lossy(header).into_owned());

    let text = std::str::from_utf8(header)
        .map_err(|_| invalid())?
        .trim_matches(|c: char| c.is_ascii_whitespace());

    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    usize::from_str_radix(text, 16).map_err(|_| invalid())
}
