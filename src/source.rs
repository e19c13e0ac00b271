//! The narrow transport capability the stream decoder reads from.
//!
//! Anything that can wait a bounded time for bytes and then hand over
//! whatever is available can feed a [`StreamIter`](crate::StreamIter).

use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

const READ_CAPACITY: usize = 8 * 1024;

/// Result of a non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRead {
    /// Bytes that were immediately available.
    Bytes(Bytes),
    /// Nothing available right now.
    Empty,
    /// The peer closed the connection.
    Closed,
}

/// A cancellable byte transport.
///
/// Transient conditions (would-block, interrupted) must be reported as
/// "not ready" or [`SourceRead::Empty`], never as errors. An `Err` means
/// the connection is gone.
pub trait ByteSource {
    /// Wait at most `wait` for data (or a close) to become available.
    fn poll_readable(&mut self, wait: Duration) -> impl Future<Output = io::Result<bool>> + Send;

    /// Take whatever is available without waiting.
    fn read(&mut self) -> io::Result<SourceRead>;
}

/// [`ByteSource`] over any tokio reader: a TCP stream, a TLS stream, or an
/// in-memory pipe.
#[derive(Debug)]
pub struct SocketSource<IO> {
    io: IO,
    buf: BytesMut,
    closed: bool,
}

impl<IO> SocketSource<IO> {
    pub fn new(io: IO) -> Self {
        Self::with_prefix(io, Bytes::new())
    }

    /// Start with bytes already pulled off the connection, typically body
    /// bytes read together with the response head.
    pub fn with_prefix(io: IO, prefix: Bytes) -> Self {
        Self {
            io,
            buf: BytesMut::from(&prefix[..]),
            closed: false,
        }
    }

    pub fn get_ref(&self) -> &IO {
        &self.io
    }

    pub fn into_inner(self) -> IO {
        self.io
    }
}

impl<IO> ByteSource for SocketSource<IO>
where
    IO: AsyncRead + Unpin + Send,
{
    async fn poll_readable(&mut self, wait: Duration) -> io::Result<bool> {
        if !self.buf.is_empty() || self.closed {
            return Ok(true);
        }

        self.buf.reserve(READ_CAPACITY);
        match tokio::time::timeout(wait, self.io.read_buf(&mut self.buf)).await {
            Err(_elapsed) => Ok(false),
            Ok(Ok(0)) => {
                trace!("peer closed the connection");
                self.closed = true;
                Ok(true)
            }
            Ok(Ok(n)) => {
                trace!(n, "socket read");
                Ok(true)
            }
            Ok(Err(err)) if is_transient(&err) => Ok(false),
            Ok(Err(err)) => Err(err),
        }
    }

    fn read(&mut self) -> io::Result<SourceRead> {
        if !self.buf.is_empty() {
            return Ok(SourceRead::Bytes(self.buf.split().freeze()));
        }
        if self.closed {
            return Ok(SourceRead::Closed);
        }
        Ok(SourceRead::Empty)
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio_test::io::Builder;

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_then_data_then_close() {
        let mock = Builder::new()
            .read(b"abc")
            .wait(Duration::from_secs(2))
            .read(b"def")
            .build();
        let mut source = SocketSource::new(mock);

        assert!(source.poll_readable(Duration::from_secs(1)).await.unwrap());
        assert_eq!(source.read().unwrap(), SourceRead::Bytes(Bytes::from_static(b"abc")));
        assert_eq!(source.read().unwrap(), SourceRead::Empty);

        assert!(!source.poll_readable(Duration::from_secs(1)).await.unwrap());
        assert!(source.poll_readable(Duration::from_secs(5)).await.unwrap());
        assert_eq!(source.read().unwrap(), SourceRead::Bytes(Bytes::from_static(b"def")));

        assert!(source.poll_readable(Duration::from_secs(1)).await.unwrap());
        assert_eq!(source.read().unwrap(), SourceRead::Closed);
    }

    #[tokio::test]
    async fn prefix_is_served_first() {
        let mock = Builder::new().read(b"tail").build();
        let mut source = SocketSource::with_prefix(mock, Bytes::from_static(b"head"));

        assert!(source.poll_readable(Duration::ZERO).await.unwrap());
        assert_eq!(source.read().unwrap(), SourceRead::Bytes(Bytes::from_static(b"head")));
        assert!(source.poll_readable(Duration::from_secs(1)).await.unwrap());
        assert_eq!(source.read().unwrap(), SourceRead::Bytes(Bytes::from_static(b"tail")));
    }

    /// Replays a fixed list of read outcomes, then reports EOF.
    struct Scripted(VecDeque<io::Result<&'static [u8]>>);

    impl AsyncRead for Scripted {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.0.pop_front() {
                Some(Ok(data)) => {
                    buf.put_slice(data);
                    Poll::Ready(Ok(()))
                }
                Some(Err(err)) => Poll::Ready(Err(err)),
                None => Poll::Ready(Ok(())),
            }
        }
    }

    #[tokio::test]
    async fn transient_read_errors_are_not_ready() {
        let script = Scripted(VecDeque::from([
            Err(io::Error::new(io::ErrorKind::WouldBlock, "empty")),
            Err(io::Error::new(io::ErrorKind::Interrupted, "signal")),
            Ok(&b"data"[..]),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]));
        let mut source = SocketSource::new(script);

        assert!(!source.poll_readable(Duration::from_secs(1)).await.unwrap());
        assert_eq!(source.read().unwrap(), SourceRead::Empty);
        assert!(!source.poll_readable(Duration::from_secs(1)).await.unwrap());

        assert!(source.poll_readable(Duration::from_secs(1)).await.unwrap());
        assert_eq!(source.read().unwrap(), SourceRead::Bytes(Bytes::from_static(b"data")));

        let err = source.poll_readable(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
