//! Per-service reverse-proxy handler
//!
//! One [`ServiceHandler`] is built per service at start time. Construction
//! validates the backend address and the configured header rewrites; the
//! request path then runs access logging, metrics, identity injection,
//! request-id propagation, body-size enforcement, header rewrites and the
//! upstream dispatch in order. TCP backends share a pooled HTTP/1.1 client;
//! unix-socket backends dial per request.

use futures::future::BoxFuture;
use futures::FutureExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::{Duration as StdDuration, Instant};
use tokio::net::UnixStream;
use tracing::{debug, error, info, warn};

use crate::config::{
    self, Global, Service, TlsMode, DEFAULT_WHOIS_TIMEOUT,
};
use crate::errors::Error;
use crate::metrics::Collector;
use crate::tsnet::WhoisIdentity;

/// Body type returned to mesh clients
pub type HandlerBody = BoxBody<Bytes, hyper::Error>;
/// Body type sent to the backend
type UpstreamBody = BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;
type UpstreamError = Box<dyn std::error::Error + Send + Sync>;

/// Identity lookup captured as a closure over the owning node manager
pub type WhoisLookup =
    Arc<dyn Fn(SocketAddr) -> BoxFuture<'static, Result<Option<WhoisIdentity>, Error>> + Send + Sync>;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_REAL_IP: &str = "x-real-ip";

const WHOIS_CACHE_CAPACITY: usize = 128;
const WHOIS_CACHE_TTL: StdDuration = StdDuration::from_secs(10);

/// Emit buffered bytes at least this often regardless of the flush interval
const FLUSH_BUFFER_CUTOFF: usize = 64 * 1024;

const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Response flushing behavior resolved from `flush_interval`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushMode {
    /// Negative interval: every upstream frame is forwarded as it arrives
    Immediate,
    /// Zero or unset: library default (also streaming in hyper)
    Default,
    /// Positive interval: frames are coalesced and emitted periodically
    Periodic(StdDuration),
}

/// Extra collaborators for handler construction
#[derive(Default)]
pub struct HandlerOptions {
    pub whois: Option<WhoisLookup>,
    pub metrics: Option<Arc<Collector>>,
}

enum Backend {
    Tcp {
        authority: String,
        client: Client<HttpConnector, UpstreamBody>,
    },
    Unix {
        path: PathBuf,
        dial_timeout: Option<StdDuration>,
    },
}

struct WhoisSettings {
    lookup: WhoisLookup,
    timeout: StdDuration,
    cache: StdMutex<WhoisCache>,
}

/// The full request pipeline for one service
pub struct ServiceHandler {
    name: String,
    backend: Backend,
    access_log: bool,
    metrics: Option<Arc<Collector>>,
    whois: Option<WhoisSettings>,
    /// `None` means unlimited
    max_body: Option<u64>,
    add_upstream: Vec<(HeaderName, HeaderValue)>,
    add_downstream: Vec<(HeaderName, HeaderValue)>,
    remove_upstream: Vec<HeaderName>,
    remove_downstream: Vec<HeaderName>,
    trusted_proxies: Vec<String>,
    response_header_timeout: Option<StdDuration>,
    flush: FlushMode,
    proto: &'static str,
}

impl std::fmt::Debug for ServiceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandler").field("name", &self.name).finish()
    }
}

impl ServiceHandler {
    /// Build the handler chain for a service. Fails on an invalid backend
    /// address; malformed header rewrite entries are dropped with a warning.
    pub fn new(svc: &Service, global: &Global, opts: HandlerOptions) -> Result<Self, Error> {
        config::validate_backend_address(&svc.backend_addr).map_err(|e| {
            Error::validation(format!(
                "service {:?}: invalid backend address {:?}: {}",
                svc.name, svc.backend_addr, e
            ))
        })?;

        let backend = if let Some(path) = svc.backend_addr.strip_prefix("unix://") {
            Backend::Unix {
                path: PathBuf::from(path),
                dial_timeout: global.dial_timeout.and_then(|d| d.to_std()).filter(|d| !d.is_zero()),
            }
        } else {
            let authority = if svc.backend_addr.starts_with(':') {
                format!("localhost{}", svc.backend_addr)
            } else {
                svc.backend_addr.clone()
            };
            let mut connector = HttpConnector::new();
            connector.set_nodelay(true);
            connector.enforce_http(true);
            if let Some(d) = global.dial_timeout.and_then(|d| d.to_std()).filter(|d| !d.is_zero()) {
                connector.set_connect_timeout(Some(d));
            }
            if let Some(d) = global
                .keep_alive_timeout
                .and_then(|d| d.to_std())
                .filter(|d| !d.is_zero())
            {
                connector.set_keepalive(Some(d));
            }
            let mut builder = Client::builder(TokioExecutor::new());
            if let Some(d) = global
                .idle_conn_timeout
                .and_then(|d| d.to_std())
                .filter(|d| !d.is_zero())
            {
                builder.pool_idle_timeout(d);
            }
            Backend::Tcp {
                authority,
                client: builder.build(connector),
            }
        };

        let whois = match (svc.whois_enabled(), opts.whois) {
            (true, Some(lookup)) => {
                let timeout = svc
                    .whois_timeout
                    .and_then(|d| d.to_std())
                    .filter(|d| !d.is_zero())
                    .unwrap_or(DEFAULT_WHOIS_TIMEOUT);
                Some(WhoisSettings {
                    lookup,
                    timeout,
                    cache: StdMutex::new(WhoisCache::new(WHOIS_CACHE_CAPACITY, WHOIS_CACHE_TTL)),
                })
            }
            _ => None,
        };

        let max_body = svc.max_request_body_size.and_then(|b| {
            if b.is_unlimited() {
                None
            } else {
                Some(b.bytes() as u64)
            }
        });

        let flush = match svc.flush_interval {
            Some(d) if d.is_negative() => FlushMode::Immediate,
            Some(d) if !d.is_zero() => FlushMode::Periodic(d.std_or_zero()),
            _ => FlushMode::Default,
        };

        let proto = if svc.tls_mode() == TlsMode::Off && !svc.funnel_enabled() {
            "http"
        } else {
            "https"
        };

        Ok(Self {
            name: svc.name.clone(),
            backend,
            access_log: svc.access_log_enabled(),
            metrics: opts.metrics,
            whois,
            max_body,
            add_upstream: parse_header_additions(&svc.name, &svc.upstream_headers, "upstream"),
            add_downstream: parse_header_additions(&svc.name, &svc.downstream_headers, "downstream"),
            remove_upstream: parse_header_removals(&svc.name, &svc.remove_upstream, "upstream"),
            remove_downstream: parse_header_removals(&svc.name, &svc.remove_downstream, "downstream"),
            trusted_proxies: global.trusted_proxies.clone(),
            response_header_timeout: svc
                .response_header_timeout
                .and_then(|d| d.to_std())
                .filter(|d| !d.is_zero()),
            flush,
            proto,
        })
    }

    /// Entry point for one request over a mesh connection
    pub async fn handle(&self, mut req: Request<Incoming>, remote: SocketAddr) -> Response<HandlerBody> {
        let start = Instant::now();

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            req.headers_mut().insert(X_REQUEST_ID, value);
        }

        if self.access_log {
            info!(
                service = %self.name,
                method = %req.method(),
                path = %req.uri().path(),
                remote = %remote,
                request_id = %request_id,
                "request started"
            );
        }
        if let Some(m) = &self.metrics {
            m.inc_connections(&self.name);
        }

        let response = match AssertUnwindSafe(self.process(req, remote)).catch_unwind().await {
            Ok(response) => response,
            Err(_) => {
                error!(service = %self.name, request_id = %request_id, "handler panicked");
                if let Some(m) = &self.metrics {
                    m.record_error(&self.name, "panic");
                }
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "internal proxy error",
                )
            }
        };

        let elapsed = start.elapsed();
        if let Some(m) = &self.metrics {
            m.record_request(&self.name, response.status().as_u16(), elapsed);
            m.dec_connections(&self.name);
        }
        if self.access_log {
            info!(
                service = %self.name,
                status = response.status().as_u16(),
                duration_ms = elapsed.as_millis() as u64,
                request_id = %request_id,
                "request completed"
            );
        }
        response
    }

    async fn process(&self, mut req: Request<Incoming>, remote: SocketAddr) -> Response<HandlerBody> {
        if let Some(whois) = &self.whois {
            self.inject_identity(&mut req, remote, whois).await;
        }

        // Content-Length is checked up front; chunked bodies are capped by
        // the streaming limit below.
        if let Some(limit) = self.max_body {
            let declared = req
                .headers()
                .get(hyper::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            if declared.is_some_and(|len| len > limit) {
                if let Some(m) = &self.metrics {
                    m.record_error(&self.name, "body_too_large");
                }
                return error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "REQUEST_BODY_TOO_LARGE",
                    "request body exceeds the configured limit",
                );
            }
        }

        for name in &self.remove_upstream {
            req.headers_mut().remove(name);
        }
        for (name, value) in &self.add_upstream {
            req.headers_mut().insert(name.clone(), value.clone());
        }
        self.set_forwarded_headers(req.headers_mut(), remote);
        strip_hop_by_hop(req.headers_mut());

        let (parts, body) = req.into_parts();
        let upstream_body: UpstreamBody = match self.max_body {
            Some(limit) => Limited::new(body, limit as usize).boxed(),
            None => body
                .map_err(|e| Box::new(e) as UpstreamError)
                .boxed(),
        };

        let uri = match self.upstream_uri(&parts.uri) {
            Ok(uri) => uri,
            Err(e) => {
                error!(service = %self.name, error = %e, "failed to build upstream URI");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "invalid upstream request",
                );
            }
        };

        let mut upstream_req = Request::new(upstream_body);
        *upstream_req.method_mut() = parts.method;
        *upstream_req.uri_mut() = uri;
        *upstream_req.headers_mut() = parts.headers;

        let send = self.backend.send(upstream_req);
        let result = match self.response_header_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, send).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        service = %self.name,
                        timeout = ?timeout,
                        "timed out waiting for upstream response headers"
                    );
                    if let Some(m) = &self.metrics {
                        m.record_error(&self.name, "upstream_timeout");
                    }
                    return error_response(
                        StatusCode::GATEWAY_TIMEOUT,
                        "UPSTREAM_TIMEOUT",
                        "upstream did not respond in time",
                    );
                }
            },
            None => send.await,
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                if is_length_limit_error(e.as_ref()) {
                    if let Some(m) = &self.metrics {
                        m.record_error(&self.name, "body_too_large");
                    }
                    return error_response(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "REQUEST_BODY_TOO_LARGE",
                        "request body exceeds the configured limit",
                    );
                }
                error!(service = %self.name, error = %e, "upstream request failed");
                if let Some(m) = &self.metrics {
                    m.record_error(&self.name, "upstream_error");
                }
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    "UPSTREAM_UNAVAILABLE",
                    "failed to reach backend",
                );
            }
        };

        let (mut parts, body) = response.into_parts();
        for name in &self.remove_downstream {
            parts.headers.remove(name);
        }
        for (name, value) in &self.add_downstream {
            parts.headers.insert(name.clone(), value.clone());
        }

        let body: HandlerBody = match self.flush {
            FlushMode::Periodic(interval) => {
                IntervalFlushBody::new(body.boxed(), interval).boxed()
            }
            // hyper forwards frames as they arrive, which is exactly the
            // immediate/default behavior.
            FlushMode::Immediate | FlushMode::Default => body.boxed(),
        };
        Response::from_parts(parts, body)
    }

    async fn inject_identity(
        &self,
        req: &mut Request<Incoming>,
        remote: SocketAddr,
        whois: &WhoisSettings,
    ) {
        let key = remote.to_string();
        let cached = whois
            .cache
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(&key));

        let identity = match cached {
            Some(identity) => Some(identity),
            None => {
                let started = Instant::now();
                let result = tokio::time::timeout(whois.timeout, (whois.lookup)(remote)).await;
                if let Some(m) = &self.metrics {
                    m.record_whois_duration(&self.name, started.elapsed());
                }
                match result {
                    Ok(Ok(Some(identity))) => {
                        if let Ok(mut cache) = whois.cache.lock() {
                            cache.insert(key, identity.clone());
                        }
                        Some(identity)
                    }
                    Ok(Ok(None)) => None,
                    Ok(Err(e)) => {
                        warn!(service = %self.name, remote = %remote, error = %e, "identity lookup failed");
                        None
                    }
                    Err(_) => {
                        warn!(
                            service = %self.name,
                            remote = %remote,
                            timeout = ?whois.timeout,
                            "identity lookup timed out"
                        );
                        None
                    }
                }
            }
        };

        if let Some(identity) = identity {
            set_identity_headers(req.headers_mut(), &identity);
        }
    }

    fn set_forwarded_headers(&self, headers: &mut HeaderMap, remote: SocketAddr) {
        let client_ip = remote.ip().to_string();
        let trusted = self
            .trusted_proxies
            .iter()
            .any(|entry| config::ip_matches(entry, remote.ip()));

        // Only a trusted peer may extend the forwarding chain; anything else
        // gets its spoofable headers replaced.
        let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if trusted => format!("{}, {}", existing, client_ip),
            _ => client_ip.clone(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_ip) {
            headers.insert(X_REAL_IP, value);
        }
        if !(trusted && headers.contains_key(X_FORWARDED_PROTO)) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(self.proto));
        }
    }

    fn upstream_uri(&self, original: &Uri) -> Result<Uri, hyper::http::uri::InvalidUri> {
        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = match &self.backend {
            Backend::Tcp { authority, .. } => format!("http://{}{}", authority, path_and_query),
            // The host part is ignored for unix sockets; the dial target is
            // the socket path.
            Backend::Unix { .. } => format!("http://localhost{}", path_and_query),
        };
        target.parse()
    }
}

impl Backend {
    async fn send(&self, req: Request<UpstreamBody>) -> Result<Response<Incoming>, UpstreamError> {
        match self {
            Backend::Tcp { client, .. } => {
                let response = client.request(req).await?;
                Ok(response)
            }
            Backend::Unix { path, dial_timeout } => {
                let connect = UnixStream::connect(path);
                let stream = match dial_timeout {
                    Some(timeout) => tokio::time::timeout(*timeout, connect)
                        .await
                        .map_err(|_| {
                            std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "unix socket dial timed out",
                            )
                        })??,
                    None => connect.await?,
                };
                let io = TokioIo::new(stream);
                let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(error = %e, "unix upstream connection closed with error");
                    }
                });
                let response = sender.send_request(req).await?;
                Ok(response)
            }
        }
    }
}

fn parse_header_additions(
    service: &str,
    entries: &std::collections::BTreeMap<String, String>,
    direction: &str,
) -> Vec<(HeaderName, HeaderValue)> {
    let mut out = Vec::new();
    for (name, value) in entries {
        if !config::is_valid_header_name(name) || !config::is_valid_header_value(value) {
            warn!(service = %service, direction, header = %name, "dropping malformed header entry");
            continue;
        }
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            (Ok(n), Ok(v)) => out.push((n, v)),
            _ => {
                warn!(service = %service, direction, header = %name, "dropping malformed header entry");
            }
        }
    }
    out
}

fn parse_header_removals(service: &str, names: &[String], direction: &str) -> Vec<HeaderName> {
    let mut out = Vec::new();
    for name in names {
        match HeaderName::try_from(name.as_str()) {
            Ok(n) if config::is_valid_header_name(name) => out.push(n),
            _ => {
                warn!(service = %service, direction, header = %name, "dropping malformed header removal");
            }
        }
    }
    out
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn sanitize_header_value(value: &str) -> String {
    value.chars().filter(|c| !c.is_control()).collect()
}

fn set_identity_headers(headers: &mut HeaderMap, identity: &WhoisIdentity) {
    let mut set = |name: &'static str, value: &str| {
        let cleaned = sanitize_header_value(value);
        if cleaned.is_empty() {
            return;
        }
        if let Ok(v) = HeaderValue::from_str(&cleaned) {
            headers.insert(HeaderName::from_static(name), v);
        }
    };
    if let Some(login) = identity.login_name.as_deref() {
        set("x-tailscale-user", login);
        set("x-tailscale-login", login);
    }
    if let Some(display) = identity.display_name.as_deref() {
        set("x-tailscale-name", display);
    }
    if let Some(pic) = identity.profile_pic_url.as_deref() {
        set("x-tailscale-profile-picture", pic);
    }
    if !identity.addresses.is_empty() {
        let joined = identity
            .addresses
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",");
        set("x-tailscale-addresses", &joined);
    }
}

fn is_length_limit_error(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
            return true;
        }
        current = e.source();
    }
    false
}

/// JSON error response in the shape backends and clients can key on
pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response<HandlerBody> {
    let body = serde_json::json!({
        "code": code,
        "message": message,
        "status": status.as_u16(),
    })
    .to_string();
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code)
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Bounded LRU cache for positive identity lookups. Entries expire a fixed
/// TTL after insertion regardless of use, so a revoked identity ages out
/// even on a hot path.
struct WhoisCache {
    capacity: usize,
    ttl: StdDuration,
    entries: HashMap<String, WhoisCacheEntry>,
}

struct WhoisCacheEntry {
    inserted: Instant,
    last_access: Instant,
    identity: WhoisIdentity,
}

impl WhoisCache {
    fn new(capacity: usize, ttl: StdDuration) -> Self {
        Self {
            capacity,
            ttl,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<WhoisIdentity> {
        let expired = match self.entries.get_mut(key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                entry.last_access = Instant::now();
                return Some(entry.identity.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn insert(&mut self, key: String, identity: WhoisIdentity) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            // Evict the least-recently-used entry to stay bounded.
            if let Some(coldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&coldest);
            }
        }
        let now = Instant::now();
        self.entries.insert(
            key,
            WhoisCacheEntry {
                inserted: now,
                last_access: now,
                identity,
            },
        );
    }
}

/// Response body wrapper that coalesces data frames and releases them on a
/// fixed interval (positive `flush_interval`).
struct IntervalFlushBody {
    inner: HandlerBody,
    interval: StdDuration,
    buf: Vec<u8>,
    deadline: Pin<Box<tokio::time::Sleep>>,
    pending_frame: Option<Frame<Bytes>>,
    ended: bool,
}

impl IntervalFlushBody {
    fn new(inner: HandlerBody, interval: StdDuration) -> Self {
        Self {
            inner,
            interval,
            buf: Vec::new(),
            deadline: Box::pin(tokio::time::sleep(interval)),
            pending_frame: None,
            ended: false,
        }
    }

    fn take_buffered(&mut self) -> Frame<Bytes> {
        let data = std::mem::take(&mut self.buf);
        Frame::data(Bytes::from(data))
    }
}

impl Body for IntervalFlushBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            if this.pending_frame.is_some() {
                if !this.buf.is_empty() {
                    let frame = this.take_buffered();
                    return Poll::Ready(Some(Ok(frame)));
                }
                return Poll::Ready(Some(Ok(this.pending_frame.take().expect("frame present"))));
            }

            if this.ended {
                if !this.buf.is_empty() {
                    let frame = this.take_buffered();
                    return Poll::Ready(Some(Ok(frame)));
                }
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => {
                        if this.buf.is_empty() {
                            this.deadline
                                .as_mut()
                                .reset(tokio::time::Instant::now() + this.interval);
                        }
                        this.buf.extend_from_slice(&data);
                        if this.buf.len() >= FLUSH_BUFFER_CUTOFF {
                            let frame = this.take_buffered();
                            return Poll::Ready(Some(Ok(frame)));
                        }
                    }
                    Err(other) => {
                        this.pending_frame = Some(other);
                    }
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    this.ended = true;
                }
                Poll::Pending => {
                    if !this.buf.is_empty() {
                        match this.deadline.as_mut().poll(cx) {
                            Poll::Ready(_) => {
                                this.deadline
                                    .as_mut()
                                    .reset(tokio::time::Instant::now() + this.interval);
                                let frame = this.take_buffered();
                                return Poll::Ready(Some(Ok(frame)));
                            }
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::service_fn;
    use std::collections::BTreeMap;
    use std::convert::Infallible;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn test_service(name: &str, backend: &str) -> Service {
        let mut cfg = crate::config::Config {
            tailscale: crate::config::Tailscale {
                auth_key: Some("tskey".to_string()),
                ..Default::default()
            },
            services: vec![Service {
                name: name.to_string(),
                backend_addr: backend.to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        cfg.set_defaults();
        cfg.normalize();
        cfg.services.remove(0)
    }

    fn test_global() -> Global {
        let mut cfg = crate::config::Config::default();
        cfg.set_defaults();
        cfg.global
    }

    /// Backend echoing request headers in the body, one `name=value` line
    /// each, plus a couple of fixed response headers.
    async fn spawn_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let mut lines = String::new();
                        for (name, value) in req.headers() {
                            lines.push_str(name.as_str());
                            lines.push('=');
                            lines.push_str(value.to_str().unwrap_or("<binary>"));
                            lines.push('\n');
                        }
                        Ok::<_, Infallible>(
                            Response::builder()
                                .header("X-Backend-Header", "from-backend")
                                .header("X-Remove-Me", "1")
                                .body(Full::new(Bytes::from(lines)))
                                .unwrap(),
                        )
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    /// Front listener driving the handler the way a mesh listener would.
    async fn serve_handler(handler: Arc<ServiceHandler>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, remote)) = listener.accept().await else {
                    break;
                };
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = Arc::clone(&handler);
                        async move { Ok::<_, Infallible>(handler.handle(req, remote).await) }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    async fn raw_request(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    async fn http_get(addr: SocketAddr, path: &str, extra: &str) -> String {
        raw_request(
            addr,
            &format!(
                "GET {} HTTP/1.1\r\nHost: svc.test\r\n{}Connection: close\r\n\r\n",
                path, extra
            ),
        )
        .await
    }

    #[test]
    fn test_invalid_backend_address_is_an_error() {
        let svc = test_service("api", "localhost");
        let err = ServiceHandler::new(&svc, &test_global(), HandlerOptions::default()).unwrap_err();
        assert!(err.to_string().contains("invalid backend address"));
    }

    #[test]
    fn test_malformed_configured_headers_are_dropped() {
        let mut svc = test_service("api", "127.0.0.1:9999");
        svc.upstream_headers = BTreeMap::from([
            ("X-Bad".to_string(), "v\r\nX-Evil: 1".to_string()),
            ("X-Good".to_string(), "ok".to_string()),
        ]);
        svc.remove_upstream = vec!["not a header".to_string(), "X-Strip".to_string()];

        let handler =
            ServiceHandler::new(&svc, &test_global(), HandlerOptions::default()).unwrap();
        assert_eq!(handler.add_upstream.len(), 1);
        assert_eq!(handler.add_upstream[0].0.as_str(), "x-good");
        assert_eq!(handler.remove_upstream.len(), 1);
        assert_eq!(handler.remove_upstream[0].as_str(), "x-strip");
    }

    #[tokio::test]
    async fn test_proxy_forwards_and_rewrites_headers() {
        let backend = spawn_backend().await;
        let mut svc = test_service("api", &backend.to_string());
        svc.upstream_headers = BTreeMap::from([("X-Custom".to_string(), "injected".to_string())]);
        svc.remove_upstream = vec!["X-Secret".to_string()];
        svc.downstream_headers = BTreeMap::from([("X-Added".to_string(), "yes".to_string())]);
        svc.remove_downstream = vec!["X-Remove-Me".to_string()];

        let handler =
            Arc::new(ServiceHandler::new(&svc, &test_global(), HandlerOptions::default()).unwrap());
        let front = serve_handler(handler).await;

        let response = http_get(front, "/headers", "X-Secret: shhh\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200"));

        let (headers, body) = response.split_once("\r\n\r\n").unwrap();
        assert!(headers.contains("X-Added: yes") || headers.contains("x-added: yes"));
        assert!(!headers.to_ascii_lowercase().contains("x-remove-me"));
        assert!(headers.to_ascii_lowercase().contains("x-backend-header"));

        assert!(body.contains("x-custom=injected"));
        assert!(!body.contains("x-secret"));
        assert!(body.contains("x-request-id="));
        assert!(body.contains("x-forwarded-for=127.0.0.1"));
        assert!(body.contains("x-real-ip=127.0.0.1"));
        assert!(body.contains("x-forwarded-proto=https"));
    }

    #[tokio::test]
    async fn test_request_id_is_preserved() {
        let backend = spawn_backend().await;
        let svc = test_service("api", &backend.to_string());
        let handler =
            Arc::new(ServiceHandler::new(&svc, &test_global(), HandlerOptions::default()).unwrap());
        let front = serve_handler(handler).await;

        let response = http_get(front, "/headers", "X-Request-ID: fixed-id-123\r\n").await;
        assert!(response.contains("x-request-id=fixed-id-123"));
    }

    #[tokio::test]
    async fn test_plain_tls_mode_reports_http_proto() {
        let backend = spawn_backend().await;
        let mut svc = test_service("api", &backend.to_string());
        svc.tls_mode = Some(TlsMode::Off);
        let handler =
            Arc::new(ServiceHandler::new(&svc, &test_global(), HandlerOptions::default()).unwrap());
        let front = serve_handler(handler).await;

        let response = http_get(front, "/headers", "").await;
        assert!(response.contains("x-forwarded-proto=http\n"));
    }

    #[tokio::test]
    async fn test_body_limit_rejects_oversized_content_length() {
        let backend = spawn_backend().await;
        let mut svc = test_service("api", &backend.to_string());
        svc.max_request_body_size = Some(crate::config::ByteSize::from_bytes(10));

        let handler =
            Arc::new(ServiceHandler::new(&svc, &test_global(), HandlerOptions::default()).unwrap());
        let front = serve_handler(handler).await;

        let body = "x".repeat(100);
        let response = raw_request(
            front,
            &format!(
                "POST /headers HTTP/1.1\r\nHost: svc.test\r\nContent-Length: 100\r\nConnection: close\r\n\r\n{}",
                body
            ),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 413"));
        assert!(response.contains("REQUEST_BODY_TOO_LARGE"));
    }

    #[tokio::test]
    async fn test_unlimited_body_size() {
        let backend = spawn_backend().await;
        let mut svc = test_service("api", &backend.to_string());
        svc.max_request_body_size = Some(crate::config::ByteSize::from_bytes(-1));
        let handler =
            ServiceHandler::new(&svc, &test_global(), HandlerOptions::default()).unwrap();
        assert!(handler.max_body.is_none());
        drop(backend);
    }

    #[tokio::test]
    async fn test_upstream_unreachable_returns_502() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let svc = test_service("api", &dead.to_string());
        let metrics = Arc::new(Collector::new());
        let handler = Arc::new(
            ServiceHandler::new(
                &svc,
                &test_global(),
                HandlerOptions {
                    whois: None,
                    metrics: Some(Arc::clone(&metrics)),
                },
            )
            .unwrap(),
        );
        let front = serve_handler(handler).await;

        let response = http_get(front, "/", "").await;
        assert!(response.starts_with("HTTP/1.1 502"));
        assert!(response.contains("UPSTREAM_UNAVAILABLE"));

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("type=\"upstream_error\""));
        assert!(encoded.contains("status=\"502\""));
    }

    #[tokio::test]
    async fn test_whois_timeout_omits_identity_headers() {
        let backend = spawn_backend().await;
        let mut svc = test_service("api", &backend.to_string());
        svc.whois_timeout = Some(crate::config::Duration::parse("1ms").unwrap());

        let lookup: WhoisLookup = Arc::new(|_remote| {
            Box::pin(async {
                tokio::time::sleep(StdDuration::from_secs(30)).await;
                Ok(None)
            })
        });
        let metrics = Arc::new(Collector::new());
        let handler = Arc::new(
            ServiceHandler::new(
                &svc,
                &test_global(),
                HandlerOptions {
                    whois: Some(lookup),
                    metrics: Some(Arc::clone(&metrics)),
                },
            )
            .unwrap(),
        );
        let front = serve_handler(handler).await;

        let response = http_get(front, "/headers", "").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(!response.contains("x-tailscale-"));

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("tsbridge_whois_duration_seconds"));
    }

    #[tokio::test]
    async fn test_whois_injects_sanitized_headers() {
        let backend = spawn_backend().await;
        let svc = test_service("api", &backend.to_string());

        let lookup: WhoisLookup = Arc::new(|_remote| {
            Box::pin(async {
                Ok(Some(WhoisIdentity {
                    login_name: Some("user@example.com\r\nX-Evil: 1".to_string()),
                    display_name: Some("Test User".to_string()),
                    profile_pic_url: None,
                    addresses: vec!["100.64.0.1".parse().unwrap()],
                }))
            })
        });
        let handler = Arc::new(
            ServiceHandler::new(
                &svc,
                &test_global(),
                HandlerOptions {
                    whois: Some(lookup),
                    metrics: None,
                },
            )
            .unwrap(),
        );
        let front = serve_handler(handler).await;

        let response = http_get(front, "/headers", "").await;
        let (_, body) = response.split_once("\r\n\r\n").unwrap();

        assert!(body.contains("x-tailscale-user=user@example.comX-Evil: 1"));
        assert!(body.contains("x-tailscale-login="));
        assert!(body.contains("x-tailscale-name=Test User"));
        assert!(body.contains("x-tailscale-addresses=100.64.0.1"));
        // The CRLF was stripped, so no separate header line appeared.
        assert!(!body.lines().any(|l| l.to_ascii_lowercase().starts_with("x-evil")));
    }

    #[tokio::test]
    async fn test_unix_socket_backend() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("app.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(|_req: Request<Incoming>| async {
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(
                            b"from-unix-backend",
                        ))))
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        let svc = test_service("api", &format!("unix://{}", socket.display()));
        let handler =
            Arc::new(ServiceHandler::new(&svc, &test_global(), HandlerOptions::default()).unwrap());
        let front = serve_handler(handler).await;

        let response = http_get(front, "/anything", "").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("from-unix-backend"));
    }

    #[tokio::test]
    async fn test_flush_mode_resolution() {
        let backend = "127.0.0.1:9999";
        let mut svc = test_service("api", backend);

        svc.flush_interval = Some(crate::config::Duration::parse("-1ms").unwrap());
        let handler = ServiceHandler::new(&svc, &test_global(), HandlerOptions::default()).unwrap();
        assert_eq!(handler.flush, FlushMode::Immediate);

        svc.flush_interval = Some(crate::config::Duration::ZERO);
        let handler = ServiceHandler::new(&svc, &test_global(), HandlerOptions::default()).unwrap();
        assert_eq!(handler.flush, FlushMode::Default);

        svc.flush_interval = Some(crate::config::Duration::parse("100ms").unwrap());
        let handler = ServiceHandler::new(&svc, &test_global(), HandlerOptions::default()).unwrap();
        assert_eq!(handler.flush, FlushMode::Periodic(StdDuration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_interval_flush_body_passes_data_through() {
        let inner: HandlerBody = Full::new(Bytes::from_static(b"hello world"))
            .map_err(|never| match never {})
            .boxed();
        let wrapped = IntervalFlushBody::new(inner, StdDuration::from_millis(10));
        let collected = wrapped.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"hello world"));
    }

    #[test]
    fn test_whois_cache_expires_entries() {
        let mut cache = WhoisCache::new(4, StdDuration::from_millis(50));
        let id = WhoisIdentity {
            login_name: Some("a@example.com".to_string()),
            ..Default::default()
        };
        cache.insert("peer1".to_string(), id);
        assert!(cache.get("peer1").is_some());

        std::thread::sleep(StdDuration::from_millis(60));
        assert!(cache.get("peer1").is_none());
    }

    #[test]
    fn test_whois_cache_evicts_least_recently_used() {
        let mut cache = WhoisCache::new(2, StdDuration::from_secs(5));
        let id = WhoisIdentity {
            login_name: Some("a@example.com".to_string()),
            ..Default::default()
        };

        cache.insert("peer1".to_string(), id.clone());
        std::thread::sleep(StdDuration::from_millis(5));
        cache.insert("peer2".to_string(), id.clone());
        std::thread::sleep(StdDuration::from_millis(5));

        // A hit refreshes recency, so peer1 is now warmer than peer2.
        assert!(cache.get("peer1").is_some());
        std::thread::sleep(StdDuration::from_millis(5));

        cache.insert("peer3".to_string(), id);
        assert!(cache.get("peer1").is_some());
        assert!(cache.get("peer2").is_none());
        assert!(cache.get("peer3").is_some());
    }

    #[test]
    fn test_sanitize_header_value() {
        assert_eq!(
            sanitize_header_value("value\r\ninjected\x00"),
            "valueinjected"
        );
        assert_eq!(sanitize_header_value("clean"), "clean");
    }
}
