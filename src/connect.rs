//! Opening a streaming connection.
//!
//! The stream decoder needs the raw chunked body, so streaming requests do
//! not go through `reqwest` (which dechunks internally). Instead the request
//! is written over any tokio I/O object and the response head is parsed
//! here. [`connect`] dials `http` and (with the `rustls` feature) `https`
//! URLs; any other transport can be handed to [`open`].

use crate::error::StreamError;
use crate::iterator::{StreamBuilder, StreamIter};
use crate::source::SocketSource;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Uri};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[cfg(feature = "rustls")]
use std::sync::Arc;
#[cfg(feature = "rustls")]
use tokio_rustls::rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
#[cfg(feature = "rustls")]
use tokio_rustls::TlsConnector;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const HEAD_END: &[u8] = b"\r\n\r\n";

/// A request for a streaming endpoint.
///
/// Authentication headers are the caller's business; add them with
/// [`header`](Self::header) or [`headers_mut`](Self::headers_mut).
#[derive(Clone, Debug)]
pub struct StreamRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl StreamRequest {
    pub fn new(method: Method, url: &str) -> Result<Self, StreamError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| StreamError::InvalidUrl(url.to_string()))?;
        if uri.host().is_none() {
            return Err(StreamError::InvalidUrl(url.to_string()));
        }
        Ok(Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: None,
        })
    }

    pub fn get(url: &str) -> Result<Self, StreamError> {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str) -> Result<Self, StreamError> {
        Self::new(Method::POST, url)
    }

    /// Add a header. Invalid names or values are silently ignored, as in
    /// [`ClientBuilder::default_header`](crate::ClientBuilder::default_header).
    pub fn header(mut self, key: &str, value: &str) -> Self {
        if let (Ok(name), Ok(val)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, val);
        }
        self
    }

    /// Set the request body. `Content-Length` is added when encoding.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Serialize as an HTTP/1.1 request.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let target = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/");

        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, target).into_bytes();

        if !self.headers.contains_key(HOST) {
            if let Some(authority) = self.uri.authority() {
                out.extend_from_slice(format!("host: {}\r\n", authority).as_bytes());
            }
        }
        for (name, value) in &self.headers {
            if *name == CONTENT_LENGTH {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if let Some(body) = &self.body {
            out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }
}

/// Status line and headers of a streaming response.
#[derive(Debug)]
struct ResponseHead {
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
}

impl ResponseHead {
    fn is_chunked(&self) -> bool {
        self.headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
    }
}

/// Send `request` over `io` and start decoding the response stream.
pub async fn open<IO>(
    mut io: IO,
    request: &StreamRequest,
    builder: &StreamBuilder,
) -> Result<StreamIter<SocketSource<IO>>, StreamError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    debug!(method = %request.method, uri = %request.uri, "opening stream");
    io.write_all(&request.encode()).await?;
    io.flush().await?;

    let (head, rest) = read_head(&mut io).await?;

    if head.status != StatusCode::OK {
        warn!(status = head.status.as_u16(), reason = %head.reason, "stream request refused");
        return Err(StreamError::from_status(
            head.status.as_u16(),
            &request.uri.to_string(),
            &head.reason,
        ));
    }
    if !head.is_chunked() {
        return Err(StreamError::UnsupportedFraming);
    }

    Ok(builder.build(SocketSource::with_prefix(io, rest), head.headers))
}

/// A dialled stream connection, plain or TLS.
#[derive(Debug)]
pub enum StreamConnection {
    Plain(TcpStream),
    #[cfg(feature = "rustls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for StreamConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamConnection::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "rustls")]
            StreamConnection::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for StreamConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            StreamConnection::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "rustls")]
            StreamConnection::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamConnection::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "rustls")]
            StreamConnection::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamConnection::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "rustls")]
            StreamConnection::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

/// Dial the request's URL, `http` or `https`, and start decoding.
///
/// `https` needs the `rustls` feature and verifies the server against the
/// bundled web PKI roots; use [`connect_tls`] for a custom configuration.
pub async fn connect(
    request: &StreamRequest,
    builder: &StreamBuilder,
) -> Result<StreamIter<SocketSource<StreamConnection>>, StreamError> {
    match request.uri.scheme_str().unwrap_or("http") {
        "http" => {
            let tcp = dial_tcp(&request.uri, 80).await?;
            open(StreamConnection::Plain(tcp), request, builder).await
        }
        #[cfg(feature = "rustls")]
        "https" => connect_tls(request, builder, default_tls_config()?).await,
        other => Err(StreamError::UnsupportedScheme(other.to_string())),
    }
}

/// Dial a plain-`http` streaming endpoint over TCP with keep-alive on.
pub async fn connect_tcp(
    request: &StreamRequest,
    builder: &StreamBuilder,
) -> Result<StreamIter<SocketSource<TcpStream>>, StreamError> {
    let scheme = request.uri.scheme_str().unwrap_or("http");
    if scheme != "http" {
        return Err(StreamError::UnsupportedScheme(scheme.to_string()));
    }
    let stream = dial_tcp(&request.uri, 80).await?;
    open(stream, request, builder).await
}

/// Dial an `https` streaming endpoint with the given TLS configuration.
#[cfg(feature = "rustls")]
pub async fn connect_tls(
    request: &StreamRequest,
    builder: &StreamBuilder,
    config: Arc<ClientConfig>,
) -> Result<StreamIter<SocketSource<StreamConnection>>, StreamError> {
    let scheme = request.uri.scheme_str().unwrap_or("http");
    if scheme != "https" {
        return Err(StreamError::UnsupportedScheme(scheme.to_string()));
    }
    let (host, _) = host_and_port(&request.uri, 443)?;
    let name = ServerName::try_from(host.to_string())
        .map_err(|_| StreamError::InvalidUrl(request.uri.to_string()))?;

    let tcp = dial_tcp(&request.uri, 443).await?;
    let tls = TlsConnector::from(config).connect(name, tcp).await?;
    debug!(host, "tls handshake complete");

    open(StreamConnection::Tls(Box::new(tls)), request, builder).await
}

/// Client TLS configuration trusting the bundled web PKI roots.
#[cfg(feature = "rustls")]
pub fn default_tls_config() -> Result<Arc<ClientConfig>, StreamError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| StreamError::Tls(err.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

async fn dial_tcp(uri: &Uri, default_port: u16) -> Result<TcpStream, StreamError> {
    let (host, port) = host_and_port(uri, default_port)?;
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    socket2::SockRef::from(&stream).set_keepalive(true)?;
    Ok(stream)
}

/// Host to dial, without the brackets of an IPv6 literal, and port.
fn host_and_port(uri: &Uri, default_port: u16) -> Result<(&str, u16), StreamError> {
    let host = uri
        .host()
        .ok_or_else(|| StreamError::InvalidUrl(uri.to_string()))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok((host, uri.port_u16().unwrap_or(default_port)))
}

impl StreamBuilder {
    /// Send `request` over `io` and build an iterator over the response.
    pub async fn open<IO>(
        &self,
        io: IO,
        request: &StreamRequest,
    ) -> Result<StreamIter<SocketSource<IO>>, StreamError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        open(io, request, self).await
    }
}

/// Read up to the blank line ending the head. Returns the parsed head and
/// any body bytes that arrived with it.
async fn read_head<IO>(io: &mut IO) -> Result<(ResponseHead, Bytes), StreamError>
where
    IO: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(end) = buf.windows(HEAD_END.len()).position(|w| w == HEAD_END) {
            let head = parse_head(&buf[..end])?;
            let rest = buf.split_off(end + HEAD_END.len()).freeze();
            return Ok((head, rest));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(StreamError::InvalidResponse(
                "response head too large".to_string(),
            ));
        }
        if io.read_buf(&mut buf).await? == 0 {
            return Err(StreamError::InvalidResponse(
                "connection closed before response head".to_string(),
            ));
        }
    }
}

fn parse_head(raw: &[u8]) -> Result<ResponseHead, StreamError> {
    let invalid = |what: &str| StreamError::InvalidResponse(what.to_string());

    let text = std::str::from_utf8(raw).map_err(|_| invalid("response head is not utf-8"))?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(invalid(&format!("bad status line: {status_line:?}")));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| invalid(&format!("bad status line: {status_line:?}")))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = HeaderMap::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid(&format!("bad header line: {line:?}")))?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| invalid(&format!("bad header name: {name:?}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| invalid(&format!("bad header value for {name}")))?;
        headers.append(name, value);
    }

    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}
