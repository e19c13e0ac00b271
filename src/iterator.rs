//! Stream consumption with StreamIter.

use crate::chunked::{ChunkDecoder, ChunkStatus};
use crate::json::MessageDecoder;
use crate::source::{ByteSource, SourceRead};
use crate::timer::ExpiryTimer;
use crate::types::{IdleMode, Message, StreamEvent, StreamState};
use crate::utf8::Utf8Decoder;
use bytes::Bytes;
use futures::Stream;
use http::HeaderMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default longest silence, keep-alives included, before the connection
/// is declared dead.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// Default upper bound on a single socket wait.
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Builder for configuring stream decoding.
///
/// ## Idle behaviour
///
/// | `timeout` | `block` | Mode |
/// |-----------|---------|------|
/// | `> 0` | any | [`IdleMode::Timeout`]: `Timeout` after that long without a message |
/// | unset or zero | `true` (default) | [`IdleMode::Blocking`]: wait indefinitely |
/// | unset or zero | `false` | [`IdleMode::Polling`]: never wait |
///
/// The heartbeat timeout applies in every mode.
#[derive(Clone, Debug)]
#[must_use = "builders do nothing unless you call .build()"]
pub struct StreamBuilder {
    timeout: Option<Duration>,
    block: bool,
    heartbeat_timeout: Duration,
    max_poll_interval: Duration,
}

impl Default for StreamBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self {
            timeout: None,
            block: true,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
        }
    }

    /// Yield [`StreamEvent::Timeout`] when no message arrives for this long.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether to wait for messages when no timeout is set.
    pub fn block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    /// Select the idle mode directly.
    pub fn idle(mut self, mode: IdleMode) -> Self {
        match mode {
            IdleMode::Blocking => {
                self.timeout = None;
                self.block = true;
            }
            IdleMode::Polling => {
                self.timeout = None;
                self.block = false;
            }
            IdleMode::Timeout(timeout) => self.timeout = Some(timeout),
        }
        self
    }

    /// Longest silence tolerated before [`StreamEvent::HeartbeatTimeout`].
    /// A zero duration keeps the default.
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.heartbeat_timeout = timeout;
        }
        self
    }

    /// Upper bound on one socket wait, so a pull always returns to check
    /// its timers.
    pub fn max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    /// The idle mode these settings resolve to.
    pub fn idle_mode(&self) -> IdleMode {
        match self.timeout {
            Some(timeout) if !timeout.is_zero() => IdleMode::Timeout(timeout),
            _ if !self.block => IdleMode::Polling,
            _ => IdleMode::Blocking,
        }
    }

    /// Build the iterator over an already-open source.
    ///
    /// `headers` are the response headers of the connection; every
    /// message refers to them.
    pub fn build<S: ByteSource>(&self, source: S, headers: HeaderMap) -> StreamIter<S> {
        let idle = self.idle_mode();
        debug!(?idle, heartbeat = ?self.heartbeat_timeout, "stream iterator ready");
        StreamIter {
            source,
            headers: Arc::new(headers),
            chunks: ChunkDecoder::new(),
            text: Utf8Decoder::new(),
            messages: MessageDecoder::new(),
            idle: ExpiryTimer::new(idle.period()),
            heartbeat: ExpiryTimer::new(Some(self.heartbeat_timeout)),
            max_poll_interval: self.max_poll_interval,
            ready: VecDeque::new(),
            state: StreamState::Streaming,
        }
    }
}

/// Pull-based iterator over a live chunked JSON stream.
///
/// Each call to [`next_event`](Self::next_event) performs at most one
/// bounded socket wait per internal step, decodes what arrived, and
/// returns the next message or sentinel. After a terminal sentinel it
/// returns `None` forever.
pub struct StreamIter<S> {
    source: S,
    headers: Arc<HeaderMap>,
    chunks: ChunkDecoder,
    text: Utf8Decoder,
    messages: MessageDecoder,
    idle: ExpiryTimer,
    heartbeat: ExpiryTimer,
    max_poll_interval: Duration,
    ready: VecDeque<StreamEvent>,
    state: StreamState,
}

impl<S> std::fmt::Debug for StreamIter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamIter")
            .field("state", &self.state)
            .field("queued", &self.ready.len())
            .field("idle", &self.idle)
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl<S: ByteSource> StreamIter<S> {
    /// Current state. Terminal once a terminal sentinel was queued, even
    /// if messages ahead of it have not been pulled yet.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Response headers captured when the connection was opened.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetch the next event, or `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(event);
            }
            if self.state.is_terminal() {
                return None;
            }
            self.step().await;
        }
    }

    /// Turn the iterator into a [`futures::Stream`].
    ///
    /// ```no_run
    /// # use chirpstream::{SocketSource, StreamIter};
    /// # async fn run(iter: StreamIter<SocketSource<tokio::net::TcpStream>>) {
    /// use futures::StreamExt;
    ///
    /// let events = iter.into_stream();
    /// futures::pin_mut!(events);
    /// while let Some(event) = events.next().await {
    ///     println!("{event:?}");
    /// }
    /// # }
    /// ```
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> {
        futures::stream::unfold(self, |mut iter| async move {
            let event = iter.next_event().await?;
            Some((event, iter))
        })
    }

    /// One wait, one decode pass, one round of timer checks.
    async fn step(&mut self) {
        let wait = self.wait_bound();

        let read = match self.source.poll_readable(wait).await {
            Ok(true) => self.source.read(),
            Ok(false) => Ok(SourceRead::Empty),
            Err(err) => Err(err),
        };

        let mut connection_lost = false;
        let data = match read {
            Ok(SourceRead::Bytes(data)) => data,
            Ok(SourceRead::Empty) => Bytes::new(),
            Ok(SourceRead::Closed) => {
                debug!("connection closed by peer");
                connection_lost = true;
                Bytes::new()
            }
            Err(err) => {
                warn!(error = %err, "stream transport failed");
                connection_lost = true;
                Bytes::new()
            }
        };

        let dechunked = self.chunks.decode(&data);
        let text = self.text.decode(&dechunked.payload);
        let decoded = self.messages.decode(&text);

        if !dechunked.payload.is_empty() {
            self.heartbeat.reset();
        }
        let produced = !decoded.values.is_empty();
        if produced {
            trace!(count = decoded.values.len(), "decoded messages");
            self.idle.reset();
            self.heartbeat.reset();
        }
        for value in decoded.values {
            let message = Message::new(value, Arc::clone(&self.headers));
            self.ready.push_back(StreamEvent::Message(message));
        }

        let next = match dechunked.status {
            ChunkStatus::EndOfStream => {
                debug!("server sent the terminal chunk");
                StreamState::Hangup
            }
            ChunkStatus::Invalid(err) => {
                warn!(error = %err, "undecodable chunk framing");
                StreamState::DecodeError
            }
            ChunkStatus::NeedMore => {
                if let Some(err) = decoded.malformed {
                    warn!(error = %err, "undecodable message payload");
                    StreamState::DecodeError
                } else if connection_lost {
                    StreamState::Hangup
                } else if self.heartbeat.expired() {
                    warn!(timeout = ?self.heartbeat.period(), "no heartbeat from server");
                    StreamState::HeartbeatTimeout
                } else {
                    if !produced && self.idle.expired() {
                        self.ready.push_back(StreamEvent::Timeout);
                    }
                    StreamState::Streaming
                }
            }
        };

        if let Some(sentinel) = next.sentinel() {
            debug!(state = %next, "stream finished");
            self.ready.push_back(sentinel);
        }
        self.state = next;
    }

    /// The socket wait for one step: until the nearest timer deadline,
    /// capped by the poll interval.
    fn wait_bound(&self) -> Duration {
        [self.idle.remaining(), self.heartbeat.remaining()]
            .into_iter()
            .flatten()
            .fold(self.max_poll_interval, Duration::min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SocketSource;
    use futures::StreamExt;
    use serde_json::json;
    use tokio::time::Instant;
    use tokio_test::io::{Builder, Mock};

    const FOREVER: Duration = Duration::from_secs(24 * 3600);

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = format!("{:x}\r\n", payload.len()).into_bytes();
        out.extend_from_slice(payload);
        out.extend_from_slice(b"\r\n");
        out
    }

    fn iter(builder: StreamBuilder, mock: Mock) -> StreamIter<SocketSource<Mock>> {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        builder.build(SocketSource::new(mock), headers)
    }

    fn payload(event: Option<StreamEvent>) -> serde_json::Value {
        match event {
            Some(StreamEvent::Message(msg)) => msg.into_payload(),
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[test]
    fn idle_mode_resolution() {
        assert_eq!(StreamBuilder::new().idle_mode(), IdleMode::Blocking);
        assert_eq!(StreamBuilder::new().block(false).idle_mode(), IdleMode::Polling);
        assert_eq!(
            StreamBuilder::new().block(false).timeout(Duration::from_secs(3)).idle_mode(),
            IdleMode::Timeout(Duration::from_secs(3))
        );
        assert_eq!(
            StreamBuilder::new().timeout(Duration::ZERO).idle_mode(),
            IdleMode::Blocking
        );
        assert_eq!(
            StreamBuilder::new().idle(IdleMode::Polling).idle_mode(),
            IdleMode::Polling
        );
    }

    /// Never has data; records every wait it is asked for.
    #[derive(Default)]
    struct Silent {
        waits: Vec<Duration>,
    }

    impl ByteSource for Silent {
        async fn poll_readable(&mut self, wait: Duration) -> std::io::Result<bool> {
            self.waits.push(wait);
            tokio::time::sleep(wait).await;
            Ok(false)
        }

        fn read(&mut self) -> std::io::Result<SourceRead> {
            Ok(SourceRead::Empty)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn socket_waits_are_capped_by_poll_interval() {
        let builder = StreamBuilder::new()
            .heartbeat_timeout(Duration::from_secs(25))
            .max_poll_interval(Duration::from_secs(10));
        let mut stream = builder.build(Silent::default(), HeaderMap::new());

        let started = Instant::now();
        assert_eq!(stream.next_event().await, Some(StreamEvent::HeartbeatTimeout));
        assert_eq!(started.elapsed(), Duration::from_secs(25));
        assert_eq!(
            stream.source().waits,
            [10, 10, 5].map(Duration::from_secs).to_vec()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_interval_bounds_wait_on_long_silence() {
        let mock = Builder::new()
            .wait(Duration::from_secs(60))
            .read(&frame(br#"{"late":true}"#))
            .build();
        let builder = StreamBuilder::new()
            .heartbeat_timeout(Duration::from_secs(3600))
            .max_poll_interval(Duration::from_secs(2));
        let mut stream = iter(builder, mock);

        let started = Instant::now();
        assert_eq!(payload(stream.next_event().await), json!({"late": true}));
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(62));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timeout_on_silent_source() {
        let mock = Builder::new().wait(FOREVER).build();
        let builder = StreamBuilder::new().heartbeat_timeout(Duration::from_secs(5));
        let mut stream = iter(builder, mock);

        let started = Instant::now();
        assert_eq!(stream.next_event().await, Some(StreamEvent::HeartbeatTimeout));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(stream.state(), StreamState::HeartbeatTimeout);

        assert_eq!(stream.next_event().await, None);
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alives_hold_off_heartbeat() {
        let mut builder = Builder::new();
        for _ in 0..5 {
            builder.read(&frame(b"\r\n")).wait(Duration::from_secs(3));
        }
        builder.read(&frame(br#"{"text":"finally"}"#)).wait(FOREVER);
        let mock = builder.build();

        let mut stream = iter(
            StreamBuilder::new().heartbeat_timeout(Duration::from_secs(5)),
            mock,
        );

        assert_eq!(payload(stream.next_event().await), json!({"text": "finally"}));
        assert_eq!(stream.next_event().await, Some(StreamEvent::HeartbeatTimeout));
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_chunk_yields_hangup_once() {
        let mut wire = frame(br#"{"id":1}"#);
        wire.extend_from_slice(b"0\r\n\r\n");
        wire.extend(frame(br#"{"id":2}"#));
        let mock = Builder::new().read(&wire).build();
        let mut stream = iter(StreamBuilder::new(), mock);

        assert_eq!(payload(stream.next_event().await), json!({"id": 1}));
        assert_eq!(stream.next_event().await, Some(StreamEvent::Hangup));
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_chunk_header_yields_decode_error_once() {
        let mock = Builder::new().read(b"nothex\r\n{}\r\n").wait(FOREVER).build();
        let mut stream = iter(StreamBuilder::new(), mock);

        assert_eq!(stream.next_event().await, Some(StreamEvent::DecodeError));
        assert_eq!(stream.state(), StreamState::DecodeError);
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_yields_decode_error() {
        let mock = Builder::new()
            .read(&frame(b"{\"ok\":1}<html>"))
            .wait(FOREVER)
            .build();
        let mut stream = iter(StreamBuilder::new(), mock);

        assert_eq!(payload(stream.next_event().await), json!({"ok": 1}));
        assert_eq!(stream.next_event().await, Some(StreamEvent::DecodeError));
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_is_hangup() {
        let mock = Builder::new().read(&frame(b"{\"a\":")).build();
        let mut stream = iter(StreamBuilder::new(), mock);

        assert_eq!(stream.next_event().await, Some(StreamEvent::Hangup));
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_is_hangup() {
        let mock = Builder::new()
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut stream = iter(StreamBuilder::new(), mock);

        assert_eq!(stream.next_event().await, Some(StreamEvent::Hangup));
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_repeats_until_message() {
        let mock = Builder::new()
            .wait(Duration::from_secs(5))
            .read(&frame(br#"{"late":true}"#))
            .build();
        let mut stream = iter(StreamBuilder::new().timeout(Duration::from_secs(2)), mock);

        assert_eq!(stream.next_event().await, Some(StreamEvent::Timeout));
        assert_eq!(stream.next_event().await, Some(StreamEvent::Timeout));
        assert_eq!(payload(stream.next_event().await), json!({"late": true}));
        assert_eq!(stream.state(), StreamState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_mode_never_waits() {
        let mock = Builder::new()
            .read(&frame(br#"{"now":1}"#))
            .wait(FOREVER)
            .build();
        let mut stream = iter(StreamBuilder::new().block(false), mock);

        let started = Instant::now();
        assert_eq!(payload(stream.next_event().await), json!({"now": 1}));
        assert_eq!(stream.next_event().await, Some(StreamEvent::Timeout));
        assert_eq!(stream.next_event().await, Some(StreamEvent::Timeout));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn several_messages_in_one_read_keep_order() {
        let mut wire = frame(b"{\"n\":1}{\"n\":");
        wire.extend(frame(b"2}\r\n{\"n\":3}"));
        let mock = Builder::new().read(&wire).wait(FOREVER).build();
        let mut stream = iter(StreamBuilder::new(), mock);

        let first = stream.next_event().await.and_then(StreamEvent::into_message).unwrap();
        let second = stream.next_event().await.and_then(StreamEvent::into_message).unwrap();
        let third = stream.next_event().await.and_then(StreamEvent::into_message).unwrap();
        assert_eq!(first["n"], 1);
        assert_eq!(second["n"], 2);
        assert_eq!(third["n"], 3);
        assert!(std::ptr::eq(first.headers(), third.headers()));
        assert_eq!(first.header("content-type"), Some("application/json"));
    }

    #[tokio::test(start_paused = true)]
    async fn utf8_split_between_reads() {
        let text = "{\"text\":\"tweet \u{1f426}\"}".as_bytes();
        let cut = text.iter().position(|&b| b == 0xf0).unwrap() + 2;
        let mock = Builder::new()
            .read(&frame(&text[..cut]))
            .wait(Duration::from_secs(1))
            .read(&frame(&text[cut..]))
            .wait(FOREVER)
            .build();
        let mut stream = iter(StreamBuilder::new(), mock);

        assert_eq!(
            payload(stream.next_event().await),
            json!({"text": "tweet \u{1f426}"})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn into_stream_ends_after_terminal_sentinel() {
        let mut wire = frame(b"[1]");
        wire.extend(frame(b"[2]"));
        wire.extend_from_slice(b"0\r\n\r\n");
        let mock = Builder::new().read(&wire).build();

        let events: Vec<StreamEvent> = iter(StreamBuilder::new(), mock)
            .into_stream()
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].as_message().map(|m| m.payload().clone()), Some(json!([1])));
        assert_eq!(events[1].as_message().map(|m| m.payload().clone()), Some(json!([2])));
        assert_eq!(events[2], StreamEvent::Hangup);
    }
}
