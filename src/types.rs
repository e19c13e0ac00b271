//! Core types for the chirpstream client.

use http::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// One decoded stream message together with the response headers of the
/// connection it arrived on.
///
/// Every message of a connection shares the same header map, captured
/// once when the connection was opened.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    payload: Value,
    headers: Arc<HeaderMap>,
}

impl Message {
    pub(crate) fn new(payload: Value, headers: Arc<HeaderMap>) -> Self {
        Self { payload, headers }
    }

    /// The decoded JSON payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Response headers of the connection.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A single response header as text, if present and visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Deserialize the payload into a typed value.
    ///
    /// # Example
    /// ```
    /// # use chirpstream::Message;
    /// #[derive(serde::Deserialize)]
    /// struct Status { text: String }
    ///
    /// fn text_of(msg: &Message) -> Option<String> {
    ///     msg.deserialize::<Status>().ok().map(|s| s.text)
    /// }
    /// ```
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

impl Deref for Message {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.payload
    }
}

/// An item yielded by [`StreamIter`](crate::StreamIter).
///
/// `Hangup`, `DecodeError` and `HeartbeatTimeout` are terminal: each is
/// yielded at most once and nothing follows it. `Timeout` may repeat.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// A decoded application message.
    Message(Message),
    /// No message within the idle window; the connection is still alive.
    /// In polling mode this is the "nothing right now" answer.
    Timeout,
    /// The server ended the stream or the connection was lost.
    Hangup,
    /// The server sent something that cannot be decoded: a bad chunk-size
    /// line, or message text that can never become valid JSON however many
    /// bytes follow. Either one ends the stream.
    DecodeError,
    /// No bytes at all, not even keep-alives, within the heartbeat window.
    HeartbeatTimeout,
}

impl StreamEvent {
    /// Whether the stream ends after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Hangup | StreamEvent::DecodeError | StreamEvent::HeartbeatTimeout
        )
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            StreamEvent::Message(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            StreamEvent::Message(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Lifecycle of a [`StreamIter`](crate::StreamIter).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StreamState {
    #[default]
    Streaming,
    Hangup,
    DecodeError,
    HeartbeatTimeout,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamState::Streaming)
    }

    /// The sentinel announcing this state, if it is terminal.
    pub(crate) fn sentinel(&self) -> Option<StreamEvent> {
        match self {
            StreamState::Streaming => None,
            StreamState::Hangup => Some(StreamEvent::Hangup),
            StreamState::DecodeError => Some(StreamEvent::DecodeError),
            StreamState::HeartbeatTimeout => Some(StreamEvent::HeartbeatTimeout),
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Streaming => "streaming",
            StreamState::Hangup => "hangup",
            StreamState::DecodeError => "decode-error",
            StreamState::HeartbeatTimeout => "heartbeat-timeout",
        };
        f.write_str(name)
    }
}

/// How long the caller is willing to wait for the next message.
///
/// - `Blocking`: wait indefinitely; only the heartbeat timeout ends a wait.
/// - `Polling`: never wait; answer [`StreamEvent::Timeout`] when nothing
///   is ready.
/// - `Timeout`: yield [`StreamEvent::Timeout`] after this long without a
///   message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IdleMode {
    #[default]
    Blocking,
    Polling,
    Timeout(std::time::Duration),
}

impl IdleMode {
    /// Period of the idle timer; `None` never expires.
    pub fn period(&self) -> Option<std::time::Duration> {
        match self {
            IdleMode::Blocking => None,
            IdleMode::Polling => Some(std::time::Duration::ZERO),
            IdleMode::Timeout(period) => Some(*period),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_events() {
        assert!(!StreamEvent::Timeout.is_terminal());
        assert!(StreamEvent::Hangup.is_terminal());
        assert!(StreamEvent::DecodeError.is_terminal());
        assert!(StreamEvent::HeartbeatTimeout.is_terminal());

        let msg = StreamEvent::Message(Message::new(json!({}), Arc::default()));
        assert!(!msg.is_terminal());
        assert!(msg.as_message().is_some());
    }

    #[test]
    fn message_exposes_payload_and_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-connection-id", "abc".parse().unwrap());
        let msg = Message::new(json!({"text": "hi", "id": 7}), Arc::new(headers));

        assert_eq!(msg["text"], "hi");
        assert_eq!(msg.header("x-connection-id"), Some("abc"));

        #[derive(serde::Deserialize)]
        struct Status {
            id: u64,
        }
        assert_eq!(msg.deserialize::<Status>().unwrap().id, 7);
    }
}
