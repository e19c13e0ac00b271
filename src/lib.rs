//! chirpstream
//!
//! A client for a social-network REST API and its long-lived streaming
//! endpoints. Streams arrive as HTTP/1.1 chunked bodies carrying
//! concatenated JSON objects with blank-line keep-alives; this crate
//! decodes them incrementally and tells clean hangups, garbage, silent
//! peers and idle periods apart.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use chirpstream::{ApiPath, Client, StreamEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .secure(false)
//!         .stream_domain("localhost:8080")
//!         .default_header("authorization", "Bearer token")
//!         .build()?;
//!
//!     let mut stream = client
//!         .open_stream(ApiPath::parse("statuses/filter").param("track", "rust"))
//!         .await?;
//!
//!     while let Some(event) = stream.next_event().await {
//!         match event {
//!             StreamEvent::Message(msg) => println!("{}", msg.payload()),
//!             StreamEvent::Timeout => continue,
//!             other => {
//!                 eprintln!("stream ended: {:?}", other);
//!                 break;
//!             }
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! `https` streams need the `rustls` feature (on by default). Any other
//! transport can be handed to [`StreamBuilder::open`] together with
//! [`Client::stream_request`].

mod chunked;
mod client;
mod connect;
mod error;
mod iterator;
mod json;
mod path;
mod retry;
mod source;
mod timer;
mod types;
mod utf8;

pub use chunked::{ChunkDecoder, ChunkError, ChunkStatus, Dechunked};
pub use client::{ApiResponse, Client, ClientBuilder, HeaderProvider, RequestParts};
pub use connect::{connect, connect_tcp, open, StreamConnection, StreamRequest};
#[cfg(feature = "rustls")]
pub use connect::{connect_tls, default_tls_config};
pub use error::{InvalidHeaderError, StreamError};
pub use iterator::{
    StreamBuilder, StreamIter, DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_MAX_POLL_INTERVAL,
};
pub use json::{Decoded, MessageDecoder, MessageError};
pub use path::{method_for_path, ApiPath, Endpoint, ResolvedPath};
pub use retry::{apply_jitter, Failure, JitterMode, ReconnectBackoff};
pub use source::{ByteSource, SocketSource, SourceRead};
pub use timer::ExpiryTimer;
pub use types::{IdleMode, Message, StreamEvent, StreamState};
pub use utf8::Utf8Decoder;
