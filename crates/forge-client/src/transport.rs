//! §6.3 external collaborator: the wire transport the pipeline dispatches
//! signed requests through. [`ReqwestTransport`] is the client's default,
//! grounded in `flow-client::Client`'s use of `reqwest::Client` for its
//! agent RPCs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use forge_error::{ErrorKind, RuntimeError};

use crate::pool::ConnectionPool;

/// An HTTP request as the pipeline hands it to a [`Transport`]. Headers are
/// an ordered multimap rather than `http::HeaderMap` so that interceptors
/// can append without needing the `http` crate's stricter header-name
/// validation at every mutation point.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        HttpRequest {
            method: method.into(),
            uri: uri.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An HTTP response as a [`Transport`] returns it to the pipeline.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parses a `Retry-After` header as either a number of seconds or an
    /// HTTP date compared against `now` (§4.7's `retryAfterHint`). `now` is
    /// threaded in rather than read from `SystemTime::now()` directly so
    /// callers can supply a fixed clock in tests.
    pub fn retry_after(&self, now: chrono::DateTime<chrono::Utc>) -> Option<Duration> {
        let raw = self.header("retry-after")?;
        if let Ok(seconds) = raw.parse::<u64>() {
            return Some(Duration::from_secs(seconds));
        }
        let target = chrono::DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&chrono::Utc);
        (target - now).to_std().ok()
    }
}

/// §6.3: `Transport<Req, Res>` generalized to HTTP's concrete request and
/// response types, since the runtime core only ever drives HTTP-shaped
/// protocols (rest-json, rest-xml, rpc-v2-cbor, SigV4 HTTP).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, RuntimeError>;
}

/// The client's default [`Transport`], backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    pool: ConnectionPool,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        ReqwestTransport { client: reqwest::Client::new(), pool: ConnectionPool::new() }
    }

    /// Drops bookkeeping for endpoint hosts this transport hasn't dispatched
    /// to since the preceding call. `reqwest::Client` keeps its own
    /// connection pool regardless; this only forgets the per-host usage
    /// counters a long-lived client otherwise accumulates without bound.
    pub fn sweep(&self) {
        self.pool.sweep();
    }

    /// Spawns a background task that calls [`Self::sweep`] on a fixed
    /// interval, mirroring how callers drive `gazette::Router::sweep`
    /// externally rather than on every dispatch.
    pub fn spawn_periodic_sweep(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl From<reqwest::Client> for ReqwestTransport {
    fn from(client: reqwest::Client) -> Self {
        ReqwestTransport { client, pool: ConnectionPool::new() }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[tracing::instrument(skip(self, request), fields(method = %request.method, uri = %request.uri))]
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, RuntimeError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| RuntimeError::new(ErrorKind::TransportProtocol, "invalid HTTP method").with_cause(e))?;

        if let Some(host) = url::Url::parse(&request.uri).ok().and_then(|u| u.host_str().map(str::to_owned)) {
            self.pool.touch(&host);
        }

        let mut builder = self.client.request(method, &request.uri).body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or_default().to_owned()))
            .collect();
        let body = response.bytes().await.map_err(classify_reqwest_error)?;

        Ok(HttpResponse { status, headers, body })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> RuntimeError {
    let kind = if err.is_timeout() {
        ErrorKind::TransportSocketTimeout
    } else if err.is_connect() {
        ErrorKind::TransportConnect
    } else {
        ErrorKind::TransportGeneric
    };
    RuntimeError::new(kind, err.to_string()).with_cause(err)
}

/// An in-memory [`Transport`] driven by a handler function, used in tests
/// to exercise the pipeline without a real socket.
pub struct FnTransport<F>(pub F)
where
    F: Fn(HttpRequest) -> Result<HttpResponse, RuntimeError> + Send + Sync;

#[async_trait]
impl<F> Transport for FnTransport<F>
where
    F: Fn(HttpRequest) -> Result<HttpResponse, RuntimeError> + Send + Sync,
{
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, RuntimeError> {
        (self.0)(request)
    }
}
