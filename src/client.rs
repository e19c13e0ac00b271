//! HTTP client and configuration.

use crate::connect::{connect, StreamConnection, StreamRequest};
use crate::error::{InvalidHeaderError, StreamError};
use crate::iterator::{StreamBuilder, StreamIter};
use crate::path::{ApiPath, Endpoint, ResolvedPath};
use crate::source::SocketSource;
use http::header::{CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use http::{HeaderMap, Method};
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "rustls")]
use crate::connect::connect_tls;
#[cfg(feature = "rustls")]
use tokio_rustls::rustls::ClientConfig;

const DEFAULT_USER_AGENT: &str = concat!("chirpstream/", env!("CARGO_PKG_VERSION"));
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// What a header provider sees of the request it is asked to decorate.
#[derive(Debug)]
pub struct RequestParts<'a> {
    pub method: &'a Method,
    /// Full URL without query string.
    pub url: &'a str,
    /// Query params for GET/DELETE, form fields otherwise.
    pub params: &'a [(String, String)],
}

/// Per-request header source, e.g. an external request signer.
pub type HeaderProvider = Arc<dyn Fn(&RequestParts<'_>) -> HeaderMap + Send + Sync>;

/// A decoded REST response.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// Decoded JSON body; a JSON string holding the raw text when the
    /// endpoint format is not `json`.
    pub body: Value,
}

/// A client for the REST and streaming APIs.
///
/// The client is cloneable and can be shared across threads.
/// It manages connection pooling for REST calls.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: reqwest::Client,
    pub(crate) api: Endpoint,
    pub(crate) stream: Endpoint,
    pub(crate) default_headers: HeaderMap,
    pub(crate) header_provider: Option<HeaderProvider>,
    pub(crate) stream_defaults: StreamBuilder,
    #[cfg(feature = "rustls")]
    pub(crate) tls_config: Option<Arc<ClientConfig>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("api", &self.api)
            .field("stream", &self.stream)
            .field("default_headers", &self.default_headers)
            .field("has_header_provider", &self.header_provider.is_some())
            .field("stream_defaults", &self.stream_defaults)
            .finish()
    }
}

impl Client {
    /// Create a new client with default settings.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client fails to build. Use `Client::builder().build()`
    /// for fallible construction.
    pub fn new() -> Self {
        ClientBuilder::new()
            .build()
            .expect("Failed to build default HTTP client")
    }

    /// Create a client builder for customization.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The stream settings used by [`open_stream`](Self::open_stream).
    pub fn stream_builder(&self) -> &StreamBuilder {
        &self.stream_defaults
    }

    /// Perform one REST call.
    ///
    /// GET and DELETE params go in the query string, everything else is
    /// sent as a form body. A 304 answer yields an empty JSON array.
    pub async fn call(&self, path: ApiPath) -> Result<ApiResponse, StreamError> {
        let ResolvedPath {
            method,
            path,
            params,
        } = path.resolve()?;
        let url = self.api.url_for(&path);

        let headers = self.get_headers(&RequestParts {
            method: &method,
            url: &url,
            params: &params,
        });

        let mut req = self.inner.request(method.clone(), &url).headers(headers);
        req = if sends_query(&method) {
            req.query(&params)
        } else {
            req.form(&params)
        };

        debug!(%method, %url, "api call");
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();

        match status {
            200..=299 => {
                let body = resp.bytes().await?;
                let body = if self.api.format.as_deref() != Some("json") {
                    Value::String(String::from_utf8_lossy(&body).into_owned())
                } else if body.is_empty() {
                    Value::Null
                } else {
                    serde_json::from_slice(&body)?
                };
                Ok(ApiResponse {
                    status,
                    headers,
                    body,
                })
            }
            304 => Ok(ApiResponse {
                status,
                headers,
                body: Value::Array(Vec::new()),
            }),
            _ => {
                let text = resp.text().await.unwrap_or_default();
                let mut err = StreamError::from_status(status, &url, &text);
                if let StreamError::RateLimited { retry_after } = &mut err {
                    *retry_after = parse_retry_after(&headers);
                }
                Err(err)
            }
        }
    }

    /// Build the raw request for a streaming endpoint, with default and
    /// provider headers applied.
    pub fn stream_request(&self, path: ApiPath) -> Result<StreamRequest, StreamError> {
        let ResolvedPath {
            method,
            path,
            params,
        } = path.resolve()?;
        let url = self.stream.url_for(&path);

        let headers = self.get_headers(&RequestParts {
            method: &method,
            url: &url,
            params: &params,
        });

        let encoded = encode_params(&params);
        let mut request = if sends_query(&method) && !encoded.is_empty() {
            StreamRequest::new(method, &format!("{}?{}", url, encoded))?
        } else {
            StreamRequest::new(method, &url)?
        };

        request.headers_mut().extend(headers);
        if !request.headers().contains_key(USER_AGENT) {
            request
                .headers_mut()
                .insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        }
        if !sends_query(request.method()) {
            request
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
            request = request.body(encoded);
        }
        Ok(request)
    }

    /// Dial the streaming endpoint and start decoding.
    ///
    /// With `secure(true)` (the default) this needs the `rustls` feature.
    /// Other transports can take [`stream_request`](Self::stream_request)
    /// to [`StreamBuilder::open`].
    pub async fn open_stream(
        &self,
        path: ApiPath,
    ) -> Result<StreamIter<SocketSource<StreamConnection>>, StreamError> {
        let request = self.stream_request(path)?;
        self.dial(&request).await
    }

    #[cfg(feature = "rustls")]
    async fn dial(
        &self,
        request: &StreamRequest,
    ) -> Result<StreamIter<SocketSource<StreamConnection>>, StreamError> {
        match &self.tls_config {
            Some(config) if request.uri().scheme_str() == Some("https") => {
                connect_tls(request, &self.stream_defaults, Arc::clone(config)).await
            }
            _ => connect(request, &self.stream_defaults).await,
        }
    }

    #[cfg(not(feature = "rustls"))]
    async fn dial(
        &self,
        request: &StreamRequest,
    ) -> Result<StreamIter<SocketSource<StreamConnection>>, StreamError> {
        connect(request, &self.stream_defaults).await
    }

    /// Get headers for a request, including dynamic headers if configured.
    pub(crate) fn get_headers(&self, parts: &RequestParts<'_>) -> HeaderMap {
        let mut headers = self.default_headers.clone();
        if let Some(provider) = &self.header_provider {
            for (key, value) in provider(parts).iter() {
                headers.insert(key.clone(), value.clone());
            }
        }
        headers
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

fn sends_query(method: &Method) -> bool {
    *method == Method::GET || *method == Method::DELETE
}

fn encode_params(params: &[(String, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish()
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Builder for configuring a Client.
#[must_use = "builders do nothing unless you call .build()"]
pub struct ClientBuilder {
    api: Endpoint,
    stream: Endpoint,
    default_headers: HeaderMap,
    timeout: Option<Duration>,
    header_provider: Option<HeaderProvider>,
    stream_defaults: StreamBuilder,
    #[cfg(feature = "rustls")]
    tls_config: Option<Arc<ClientConfig>>,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            api: Endpoint::rest(),
            stream: Endpoint::stream(),
            default_headers: HeaderMap::new(),
            timeout: None,
            header_provider: None,
            stream_defaults: StreamBuilder::new(),
            #[cfg(feature = "rustls")]
            tls_config: None,
        }
    }

    /// Set the REST API domain.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.api.domain = domain.into();
        self
    }

    /// Set the streaming API domain.
    pub fn stream_domain(mut self, domain: impl Into<String>) -> Self {
        self.stream.domain = domain.into();
        self
    }

    /// Set the API version for both endpoints. An empty string drops the
    /// version from URLs.
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.api.api_version = Some(version.clone());
        self.stream.api_version = Some(version);
        self
    }

    /// Use https (default) or plain http for both endpoints.
    pub fn secure(mut self, secure: bool) -> Self {
        self.api.secure = secure;
        self.stream.secure = secure;
        self
    }

    /// Set the REST format suffix (default `json`). An empty string drops
    /// the suffix.
    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.api.format = Some(format.into());
        self
    }

    /// Add a default header for all requests.
    ///
    /// Invalid header names or values are silently ignored. Use
    /// [`try_default_header`](Self::try_default_header) if you need error handling.
    pub fn default_header(mut self, key: &str, value: &str) -> Self {
        if let (Ok(name), Ok(val)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.default_headers.insert(name, val);
        }
        self
    }

    /// Add a default header, returning an error if the name or value is invalid.
    pub fn try_default_header(
        mut self,
        key: &str,
        value: &str,
    ) -> std::result::Result<Self, InvalidHeaderError> {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| InvalidHeaderError::InvalidName(key.to_string()))?;
        let val = HeaderValue::from_str(value)
            .map_err(|_| InvalidHeaderError::InvalidValue(value.to_string()))?;
        self.default_headers.insert(name, val);
        Ok(self)
    }

    /// Set all default headers.
    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }

    /// Set the REST request timeout. Streams use their own idle and
    /// heartbeat timeouts instead.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set a dynamic header provider (called per-request).
    pub fn header_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn(&RequestParts<'_>) -> HeaderMap + Send + Sync + 'static,
    {
        self.header_provider = Some(Arc::new(provider));
        self
    }

    /// Stream settings for [`Client::open_stream`].
    pub fn stream_defaults(mut self, builder: StreamBuilder) -> Self {
        self.stream_defaults = builder;
        self
    }

    /// TLS configuration for `https` streams, replacing the bundled web
    /// PKI roots.
    #[cfg(feature = "rustls")]
    pub fn tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Build the client.
    ///
    /// Returns an error if the underlying HTTP client fails to build
    /// (e.g., due to TLS configuration issues).
    pub fn build(self) -> Result<Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let inner = builder.build()?;

        Ok(Client {
            inner,
            api: self.api,
            stream: self.stream,
            default_headers: self.default_headers,
            header_provider: self.header_provider,
            stream_defaults: self.stream_defaults,
            #[cfg(feature = "rustls")]
            tls_config: self.tls_config,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
